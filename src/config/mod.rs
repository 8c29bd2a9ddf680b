//! Environment configuration, read once at startup.
//!
//! Every loader has a `from_lookup` twin that takes the variable source as a
//! closure, so tests never touch the process environment.

use std::time::Duration;

use thiserror::Error;

use crate::security::{DEFAULT_BUCKET, ThrottleBucket};

pub const AUTH_BUCKET: &str = "auth";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Reads `var`, treating an empty or whitespace-only value as unset.
fn non_empty(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    lookup(var)
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Parses a finite number, or returns `fallback`.
fn number_or(value: Option<String>, fallback: f64) -> f64 {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|n| n.is_finite())
        .unwrap_or(fallback)
}

fn to_limit(n: f64) -> u32 {
    // Float-to-int `as` saturates.
    n.max(0.0).floor() as u32
}

fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX)
}

/// Limits for the `default` and `auth` throttle buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub default_limit: u32,
    pub default_ttl: Duration,
    pub auth_limit: u32,
    pub auth_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            default_ttl: Duration::from_secs(60),
            auth_limit: 10,
            auth_ttl: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// | Variable | Default |
    /// |---|---|
    /// | `RATE_LIMIT_LIMIT`, else `RATE_LIMIT_MAX` | 100 |
    /// | `RATE_LIMIT_TTL` (seconds) | 60 |
    /// | `RATE_LIMIT_AUTH_LIMIT` | 10 |
    /// | `RATE_LIMIT_AUTH_TTL` (seconds) | `RATE_LIMIT_TTL` |
    ///
    /// Values that are not finite numbers fall back to the default; negative
    /// values clamp to zero.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default_limit = number_or(
            non_empty(&lookup, "RATE_LIMIT_LIMIT").or_else(|| non_empty(&lookup, "RATE_LIMIT_MAX")),
            100.0,
        );
        let default_ttl = number_or(non_empty(&lookup, "RATE_LIMIT_TTL"), 60.0);
        let auth_limit = number_or(non_empty(&lookup, "RATE_LIMIT_AUTH_LIMIT"), 10.0);
        let auth_ttl = number_or(non_empty(&lookup, "RATE_LIMIT_AUTH_TTL"), default_ttl);

        Self {
            default_limit: to_limit(default_limit),
            default_ttl: seconds_to_duration(default_ttl),
            auth_limit: to_limit(auth_limit),
            auth_ttl: seconds_to_duration(auth_ttl),
        }
    }

    pub fn default_bucket(&self) -> ThrottleBucket {
        ThrottleBucket::new(DEFAULT_BUCKET, self.default_limit, self.default_ttl)
    }

    pub fn auth_bucket(&self) -> ThrottleBucket {
        ThrottleBucket::new(AUTH_BUCKET, self.auth_limit, self.auth_ttl)
    }
}

/// Process-wide settings for the server binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    /// Default lifetime for entries written through the cache service.
    pub cache_ttl: Duration,
    pub cors_origins: Vec<String>,
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// # Errors
    ///
    /// See [`from_lookup`](Self::from_lookup).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// # Errors
    ///
    /// [`ConfigError::Missing`] without `JWT_SECRET`;
    /// [`ConfigError::Invalid`] for a `PORT` that is not a port number.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = match non_empty(&lookup, "PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "PORT",
                value: raw.clone(),
            })?,
            None => 3001,
        };

        let jwt_secret = non_empty(&lookup, "JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let cors_origins = non_empty(&lookup, "CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_else(|| vec!["http://localhost:3000".to_owned()]);

        Ok(Self {
            host: non_empty(&lookup, "HOST").unwrap_or_else(|| "0.0.0.0".to_owned()),
            port,
            jwt_secret,
            cache_ttl: seconds_to_duration(number_or(non_empty(&lookup, "CACHE_TTL"), 300.0)),
            cors_origins,
            rate_limit: RateLimitConfig::from_lookup(&lookup),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
