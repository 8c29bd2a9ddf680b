//! earngate server binary.

use std::{sync::Arc, time::Duration};

use earngate::{
    Server,
    app::{self, Services},
    auth::JwtVerifier,
    cache::{CacheService, MemoryCache},
    config::AppConfig,
    security::MemoryThrottleStorage,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!(
        default_limit = config.rate_limit.default_limit,
        default_ttl_secs = config.rate_limit.default_ttl.as_secs(),
        auth_limit = config.rate_limit.auth_limit,
        auth_ttl_secs = config.rate_limit.auth_ttl.as_secs(),
        "rate limits loaded"
    );

    let throttle = MemoryThrottleStorage::new();
    let store = MemoryCache::new();
    let _throttle_cleanup = throttle.start_cleanup_task(CLEANUP_INTERVAL);
    let _cache_cleanup = store.start_cleanup_task(CLEANUP_INTERVAL);

    let services = Services {
        verifier: Arc::new(JwtVerifier::new(config.jwt_secret.as_bytes())),
        throttle: Arc::new(throttle),
        cache: CacheService::with_default_ttl(Arc::new(store), config.cache_ttl),
    };
    let pipeline = Arc::new(app::pipeline(&config, services));
    let server = Server::bind(config.bind_addr()).await?;

    tokio::select! {
        result = server.serve(pipeline) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
