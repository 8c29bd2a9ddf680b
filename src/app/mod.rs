//! The gateway's route table and middleware stack.
//!
//! Requests pass through the layers in this order:
//!
//! 1. [`LoggerMiddleware`]
//! 2. [`CorsMiddleware`]
//! 3. [`AuthenticationMiddleware`]
//! 4. [`ThrottlerMiddleware`] (`/health` is exempt, `/auth/*` also draws on the `auth` bucket)
//! 5. [`ResponseCacheMiddleware`] (`/health` and `/cache/*` are never cached)
//! 6. [`Router`]

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::{
    Response, StatusCode,
    auth::{AuthenticationMiddleware, Principal, TokenVerifier},
    cache::{CacheService, ResponseCacheMiddleware},
    config::{AUTH_BUCKET, AppConfig},
    context::Context,
    dto::{ChallengeRequest, SubmitProof},
    middleware::{LoggerMiddleware, Pipeline},
    router::{IntoHandler, Router},
    security::{
        CorsMiddleware, DEFAULT_BUCKET, RateLimitRule, RouteRateLimit, ThrottleStorage,
        ThrottlerMiddleware,
    },
};

/// How long a wallet challenge stays signable.
const CHALLENGE_TTL_MINUTES: i64 = 5;

/// Shared backends the pipeline is assembled from.
pub struct Services {
    pub verifier: Arc<dyn TokenVerifier>,
    pub throttle: Arc<dyn ThrottleStorage>,
    pub cache: CacheService,
}

/// Builds the full middleware stack in front of [`router`].
pub fn pipeline(config: &AppConfig, services: Services) -> Pipeline {
    let throttler = ThrottlerMiddleware::new(
        config.rate_limit.default_bucket(),
        services.throttle,
        Arc::clone(&services.verifier),
    )
    .bucket(config.rate_limit.auth_bucket())
    .route(RouteRateLimit::any("/health").skip(DEFAULT_BUCKET))
    .route(RouteRateLimit::any("/auth/*").rule(RateLimitRule::named(AUTH_BUCKET)));

    let response_cache = ResponseCacheMiddleware::new(services.cache.clone())
        .exclude("/health")
        .exclude("/cache/*");

    Pipeline::new(router(services.cache))
        .layer(LoggerMiddleware)
        .layer(CorsMiddleware::new(config.cors_origins.iter().cloned()))
        .layer(AuthenticationMiddleware::new(services.verifier))
        .layer(throttler)
        .layer(response_cache)
}

pub fn router(cache: CacheService) -> Router {
    let mut router = Router::new();
    router.get("/health", |_ctx: Context| async { health() });
    router.get("/cache/stats", with_cache(&cache, cache_stats));
    router.delete("/cache/clear", with_cache(&cache, clear_cache));
    router.delete("/cache/clear-pattern", with_cache(&cache, clear_cache_pattern));
    router.delete("/cache/reset-stats", with_cache(&cache, reset_cache_stats));
    router.post("/submissions", submit_proof);
    router.post("/auth/challenge", issue_challenge);
    router
}

fn with_cache<F, Fut>(cache: &CacheService, handler: F) -> impl IntoHandler
where
    F: Fn(Context, CacheService) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let cache = cache.clone();
    move |ctx: Context| handler(ctx, cache.clone())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn error(status: StatusCode, message: &str) -> Response {
    Response::json(
        status,
        &json!({ "statusCode": status.as_u16(), "message": message }),
    )
}

fn message(text: impl Into<String>) -> Response {
    Response::json(StatusCode::Ok, &json!({ "message": text.into() }))
}

fn authenticated(ctx: &Context) -> Result<&Principal, Response> {
    ctx.principal()
        .ok_or_else(|| error(StatusCode::Unauthorized, "Unauthorized"))
}

fn admin(ctx: &Context) -> Result<&Principal, Response> {
    let principal = authenticated(ctx)?;
    if principal.is_admin() {
        Ok(principal)
    } else {
        Err(error(StatusCode::Forbidden, "Forbidden resource"))
    }
}

fn health() -> Response {
    Response::json(StatusCode::Ok, &json!({ "status": "ok", "timestamp": now() }))
}

async fn cache_stats(ctx: Context, cache: CacheService) -> Response {
    if let Err(res) = authenticated(&ctx) {
        return res;
    }
    match ctx.request().query_param("key") {
        Some(key) => Response::json(StatusCode::Ok, &cache.stats(key)),
        None => Response::json(StatusCode::Ok, &cache.all_stats()),
    }
}

async fn clear_cache(ctx: Context, cache: CacheService) -> Response {
    if let Err(res) = admin(&ctx) {
        return res;
    }
    match cache.clear().await {
        Ok(()) => message("Cache cleared successfully"),
        Err(e) => {
            tracing::error!(error = %e, "cache clear failed");
            error(StatusCode::InternalServerError, "Cache clear failed")
        }
    }
}

async fn clear_cache_pattern(ctx: Context, cache: CacheService) -> Response {
    if let Err(res) = admin(&ctx) {
        return res;
    }
    let Some(pattern) = ctx.request().query_param("pattern").filter(|p| !p.is_empty()) else {
        return error(StatusCode::BadRequest, "Pattern is required");
    };

    let deleted = cache.delete_pattern(pattern).await;
    Response::json(
        StatusCode::Ok,
        &json!({
            "message": format!("Cache pattern \"{pattern}\" cleared successfully"),
            "deleted": deleted,
        }),
    )
}

async fn reset_cache_stats(ctx: Context, cache: CacheService) -> Response {
    if let Err(res) = admin(&ctx) {
        return res;
    }
    cache.reset_stats();
    message("Cache statistics reset successfully")
}

async fn submit_proof(ctx: Context) -> Response {
    let caller = match authenticated(&ctx) {
        Ok(principal) => principal.identifier().unwrap_or("-").to_owned(),
        Err(res) => return res,
    };
    let proof: SubmitProof = match ctx.validated_json(&SubmitProof::schema()) {
        Ok(proof) => proof,
        Err(errors) => return errors.into_response(ctx.request().path()),
    };

    let id = Uuid::new_v4();
    tracing::info!(submission = %id, caller = %caller, quest = %proof.quest_id, "proof submitted");
    Response::json(
        StatusCode::Created,
        &json!({
            "id": id,
            "userId": proof.user_id,
            "questId": proof.quest_id,
            "fileName": proof.file_name,
            "status": "PENDING",
            "submittedAt": now(),
        }),
    )
}

/// The text a wallet signs to prove it owns `address`.
pub fn challenge_message(address: &str, timestamp_ms: i64) -> String {
    format!(
        "StellarEarn Authentication\n\n\
         Sign this message to authenticate with your Stellar wallet.\n\n\
         Address: {address}\n\
         Timestamp: {timestamp_ms}\n\n\
         This signature will not trigger any blockchain transaction or cost any fees."
    )
}

async fn issue_challenge(ctx: Context) -> Response {
    let request: ChallengeRequest = match ctx.validated_json(&ChallengeRequest::schema()) {
        Ok(request) => request,
        Err(errors) => return errors.into_response(ctx.request().path()),
    };

    let issued = Utc::now();
    let expires = issued + chrono::Duration::minutes(CHALLENGE_TTL_MINUTES);
    Response::json(
        StatusCode::Ok,
        &json!({
            "challenge": challenge_message(&request.stellar_address, issued.timestamp_millis()),
            "expiresAt": expires.to_rfc3339_opts(SecondsFormat::Millis, true),
        }),
    )
}
