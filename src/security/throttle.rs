//! Fixed-window rate limiting.
//!
//! Every request that is not bypassed is charged against one or more named
//! [`ThrottleBucket`]s. The `default` bucket covers every route; any other
//! bucket only covers routes that opt into it through a [`RouteRateLimit`].
//!
//! Counters live behind the [`ThrottleStorage`] trait. [`MemoryThrottleStorage`]
//! keeps them in a [`DashMap`] and performs each increment-and-check inside a
//! single shard lock, so concurrent requests for the same key never both slip
//! under the limit.

use std::{pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    Method, Request, Response, StatusCode,
    auth::{TokenVerifier, token_claims},
    context::Context,
    middleware::{Middleware, Next},
    router::Pattern,
    security::{CallerIdentity, resolve_tracker, should_skip},
};

/// Name of the bucket that applies to every route.
pub const DEFAULT_BUCKET: &str = "default";

/// A named limit: at most `limit` hits per `ttl` window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleBucket {
    pub name: String,
    pub limit: u32,
    pub ttl: Duration,
    /// How long a caller stays blocked after exceeding the limit. Without one
    /// the block ends with the current window.
    pub block_duration: Option<Duration>,
}

impl ThrottleBucket {
    pub fn new(name: impl Into<String>, limit: u32, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            ttl,
            block_duration: None,
        }
    }

    #[must_use]
    pub fn with_block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = Some(block_duration);
        self
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_BUCKET
    }

    /// Suffix appended to rate-limit header names (`""` for the default bucket).
    fn header_suffix(&self) -> String {
        if self.is_default() {
            String::new()
        } else {
            format!("-{}", self.name)
        }
    }
}

/// A per-route opt-in to (or override of) a named bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub name: String,
    pub limit: Option<u32>,
    pub ttl: Option<Duration>,
    pub block_duration: Option<Duration>,
}

impl RateLimitRule {
    /// Opt into bucket `name` with its configured limit and window.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limit: None,
            ttl: None,
            block_duration: None,
        }
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = Some(block_duration);
        self
    }

    fn overrides_window(&self) -> bool {
        self.limit.is_some() || self.ttl.is_some()
    }
}

/// Rate-limit rules attached to the routes matching `method` + `pattern`.
///
/// `pattern` uses router syntax (`/quests/:id`, `/auth/*`). A `None` method
/// matches every method.
#[derive(Debug, Clone)]
pub struct RouteRateLimit {
    method: Option<Method>,
    source: String,
    pattern: Pattern,
    rules: Vec<RateLimitRule>,
    skip: Vec<String>,
}

impl RouteRateLimit {
    pub fn new(method: Option<Method>, pattern: &str) -> Self {
        Self {
            method,
            source: pattern.to_owned(),
            pattern: Pattern::parse(pattern),
            rules: Vec::new(),
            skip: Vec::new(),
        }
    }

    /// Rules for every method on `pattern`.
    pub fn any(pattern: &str) -> Self {
        Self::new(None, pattern)
    }

    #[must_use]
    pub fn rule(mut self, rule: RateLimitRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Exempts these routes from bucket `name`.
    #[must_use]
    pub fn skip(mut self, name: impl Into<String>) -> Self {
        self.skip.push(name.into());
        self
    }

    fn matches(&self, request: &Request) -> bool {
        self.method.as_ref().is_none_or(|m| m == request.method())
            && self.pattern.matches(request.path()).is_some()
    }

    fn rule_for(&self, name: &str) -> Option<&RateLimitRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    fn skips(&self, name: &str) -> bool {
        self.skip.iter().any(|s| s == name)
    }
}

/// Counter state returned by [`ThrottleStorage::increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleRecord {
    pub total_hits: u32,
    pub time_to_expire: Duration,
    pub is_blocked: bool,
    pub time_to_block_expire: Duration,
}

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("throttle storage unavailable: {0}")]
    Storage(String),
}

/// Backing store for rate-limit counters.
#[async_trait]
pub trait ThrottleStorage: Send + Sync {
    /// Records one hit on `key` and returns the resulting window state.
    ///
    /// The window starts at the first hit and lasts `ttl`. A hit that pushes the
    /// count past `limit` blocks the key for `block_duration`, or until the
    /// window ends when there is none; once the block lapses the key starts a
    /// fresh window.
    async fn increment(
        &self,
        key: &str,
        ttl: Duration,
        limit: u32,
        block_duration: Option<Duration>,
    ) -> Result<ThrottleRecord, ThrottleError>;
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    hits: u32,
    expires_at: Instant,
    blocked_until: Option<Instant>,
}

impl WindowState {
    fn fresh(now: Instant, ttl: Duration) -> Self {
        Self {
            hits: 0,
            expires_at: now + ttl,
            blocked_until: None,
        }
    }

    fn is_stale(&self, now: Instant) -> bool {
        match self.blocked_until {
            Some(until) => now >= until,
            None => now >= self.expires_at,
        }
    }
}

/// In-process [`ThrottleStorage`] backed by a [`DashMap`].
#[derive(Clone, Default)]
pub struct MemoryThrottleStorage {
    records: Arc<DashMap<String, WindowState>>,
}

impl MemoryThrottleStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops every record whose window and block have both lapsed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, state| !state.is_stale(now));
        before.saturating_sub(self.records.len())
    }

    /// Spawns a task that calls [`cleanup_expired`](Self::cleanup_expired) every `every`.
    pub fn start_cleanup_task(&self, every: Duration) -> JoinHandle<()> {
        let storage = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = storage.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = storage.len(), "evicted throttle records");
                }
            }
        })
    }

    fn hit(
        &self,
        key: &str,
        ttl: Duration,
        limit: u32,
        block_duration: Option<Duration>,
    ) -> ThrottleRecord {
        let now = Instant::now();
        let mut entry = self
            .records
            .entry(key.to_owned())
            .or_insert_with(|| WindowState::fresh(now, ttl));
        let state = entry.value_mut();

        if state.is_stale(now) {
            *state = WindowState::fresh(now, ttl);
        }

        let is_blocked = match state.blocked_until {
            Some(_) => true,
            None => {
                state.hits = state.hits.saturating_add(1);
                if state.hits > limit {
                    state.blocked_until =
                        Some(block_duration.map_or(state.expires_at, |d| now + d));
                    true
                } else {
                    false
                }
            }
        };

        ThrottleRecord {
            total_hits: state.hits,
            time_to_expire: state.expires_at.saturating_duration_since(now),
            is_blocked,
            time_to_block_expire: state
                .blocked_until
                .map_or(Duration::ZERO, |until| until.saturating_duration_since(now)),
        }
    }
}

#[async_trait]
impl ThrottleStorage for MemoryThrottleStorage {
    async fn increment(
        &self,
        key: &str,
        ttl: Duration,
        limit: u32,
        block_duration: Option<Duration>,
    ) -> Result<ThrottleRecord, ThrottleError> {
        Ok(self.hit(key, ttl, limit, block_duration))
    }
}

/// A bucket as it applies to one particular request.
struct AppliedLimit {
    bucket: ThrottleBucket,
    key: String,
}

fn whole_seconds(d: Duration) -> u128 {
    d.as_millis().div_ceil(1000)
}

/// Admission control: resolves the caller, applies every bucket that covers
/// the route, and rejects with `429` once any of them is exhausted.
///
/// Admins bypass entirely without touching a counter. A storage failure is
/// logged and the request is let through.
pub struct ThrottlerMiddleware {
    buckets: Vec<ThrottleBucket>,
    routes: Vec<RouteRateLimit>,
    storage: Arc<dyn ThrottleStorage>,
    verifier: Arc<dyn TokenVerifier>,
}

impl ThrottlerMiddleware {
    pub fn new(
        default_bucket: ThrottleBucket,
        storage: Arc<dyn ThrottleStorage>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            buckets: vec![default_bucket],
            routes: Vec::new(),
            storage,
            verifier,
        }
    }

    /// Registers an additional named bucket. Routes opt in with a [`RateLimitRule`].
    #[must_use]
    pub fn bucket(mut self, bucket: ThrottleBucket) -> Self {
        self.buckets.push(bucket);
        self
    }

    #[must_use]
    pub fn route(mut self, route: RouteRateLimit) -> Self {
        self.routes.push(route);
        self
    }

    fn applied_limits(&self, request: &Request, tracker: &str) -> Vec<AppliedLimit> {
        let route = self.routes.iter().find(|r| r.matches(request));
        let mut applied = Vec::new();

        for bucket in &self.buckets {
            if route.is_some_and(|r| r.skips(&bucket.name)) {
                continue;
            }
            let rule = route.and_then(|r| r.rule_for(&bucket.name));
            if !bucket.is_default() && rule.is_none() {
                continue;
            }
            applied.push(Self::apply(bucket.clone(), rule, route, tracker));
        }

        // A rule may name a bucket that was never registered; it stands alone
        // as long as it carries its own window.
        if let Some(route) = route {
            for rule in &route.rules {
                if self.buckets.iter().any(|b| b.name == rule.name) || route.skips(&rule.name) {
                    continue;
                }
                match (rule.limit, rule.ttl) {
                    (Some(limit), Some(ttl)) => {
                        let bucket = ThrottleBucket::new(rule.name.clone(), limit, ttl);
                        applied.push(Self::apply(bucket, Some(rule), Some(route), tracker));
                    }
                    _ => tracing::warn!(
                        bucket = %rule.name,
                        route = %route.source,
                        "rate limit rule names an unknown bucket without a limit and ttl; ignoring"
                    ),
                }
            }
        }

        applied
    }

    fn apply(
        mut bucket: ThrottleBucket,
        rule: Option<&RateLimitRule>,
        route: Option<&RouteRateLimit>,
        tracker: &str,
    ) -> AppliedLimit {
        let key = match (rule, route) {
            (Some(rule), Some(route)) if rule.overrides_window() => {
                format!("{}:{}:{tracker}", bucket.name, route.source)
            }
            _ => format!("{}:{tracker}", bucket.name),
        };

        if let Some(rule) = rule {
            bucket.limit = rule.limit.unwrap_or(bucket.limit);
            bucket.ttl = rule.ttl.unwrap_or(bucket.ttl);
            bucket.block_duration = rule.block_duration.or(bucket.block_duration);
        }

        AppliedLimit { bucket, key }
    }

    fn too_many_requests(bucket: &ThrottleBucket, retry_after: Duration) -> Response {
        Response::json(
            StatusCode::TooManyRequests,
            &serde_json::json!({
                "statusCode": 429,
                "message": "ThrottlerException: Too Many Requests",
            }),
        )
        .header(
            format!("Retry-After{}", bucket.header_suffix()),
            whole_seconds(retry_after).to_string(),
        )
    }
}

impl Middleware for ThrottlerMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let claims = token_claims(&mut ctx, self.verifier.as_ref());
        if should_skip(ctx.principal(), claims.as_ref()) {
            tracing::debug!(path = %ctx.request().path(), "admin request bypasses throttling");
            return Box::pin(next.run(ctx));
        }

        let identity = resolve_tracker(ctx.principal(), ctx.request(), claims.as_ref());
        let limits = self.applied_limits(ctx.request(), &identity.tracker_key());
        let storage = Arc::clone(&self.storage);

        Box::pin(async move {
            let mut ctx = ctx;
            let mut headers = Vec::with_capacity(limits.len() * 3);

            for AppliedLimit { bucket, key } in &limits {
                let record = match storage
                    .increment(key, bucket.ttl, bucket.limit, bucket.block_duration)
                    .await
                {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(error = %e, key = %key, "throttle storage failed; admitting request");
                        continue;
                    }
                };

                if record.is_blocked {
                    tracing::info!(
                        bucket = %bucket.name,
                        tracker = %identity,
                        hits = record.total_hits,
                        "rate limit exceeded"
                    );
                    return Self::too_many_requests(bucket, record.time_to_block_expire);
                }

                let suffix = bucket.header_suffix();
                headers.push((format!("X-RateLimit-Limit{suffix}"), bucket.limit.to_string()));
                headers.push((
                    format!("X-RateLimit-Remaining{suffix}"),
                    bucket.limit.saturating_sub(record.total_hits).to_string(),
                ));
                headers.push((
                    format!("X-RateLimit-Reset{suffix}"),
                    whole_seconds(record.time_to_expire).to_string(),
                ));
            }

            ctx.extensions_mut().insert::<CallerIdentity>(identity);
            let mut response = next.run(ctx).await;
            for (name, value) in headers {
                response.add_header(name, value);
            }
            response
        })
    }
}
