//! # earngate
//!
//! Request admission, response caching and payload validation for the
//! StellarEarn API, served over a small async HTTP/1.1 stack.
//!
//! Every request runs through a [`Pipeline`](middleware::Pipeline):
//!
//! * the caller is resolved to a stable tracker (`user:<id>` or `ip:<addr>`),
//! * admins skip throttling, everyone else is charged against fixed-window buckets,
//! * cacheable `GET`s are answered from a per-caller response cache,
//! * handlers validate JSON bodies against declarative schemas.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use earngate::app::{self, Services};
//! use earngate::auth::JwtVerifier;
//! use earngate::cache::{CacheService, MemoryCache};
//! use earngate::config::AppConfig;
//! use earngate::security::MemoryThrottleStorage;
//! use earngate::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::from_env()?;
//!     let services = Services {
//!         verifier: Arc::new(JwtVerifier::new(config.jwt_secret.as_bytes())),
//!         throttle: Arc::new(MemoryThrottleStorage::new()),
//!         cache: CacheService::new(Arc::new(MemoryCache::new())),
//!     };
//!     let pipeline = Arc::new(app::pipeline(&config, services));
//!
//!     Server::bind(config.bind_addr()).await?.serve(pipeline).await?;
//!     Ok(())
//! }
//! ```

pub mod http;
pub mod server;

pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod dto;
pub mod middleware;
pub mod router;
pub mod security;
pub mod validation;

pub use context::Context;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::Pipeline;
pub use router::Router;
pub use server::{Server, ServerError};
