//! GET response caching.
//!
//! A request is cacheable when it is a `GET`, none of its `Cache-Control` lines
//! asks for `no-cache`, and it does not carry `X-Cache-Bypass: true`. Cacheable
//! responses are keyed per caller and URL by [`cache_key`].

use std::{pin::Pin, time::Duration};

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::{
    Method, Request, Response, StatusCode,
    cache::CacheService,
    context::Context,
    middleware::{Middleware, Next},
    router::Pattern,
};

/// Lifetime of a cached response.
pub const RESPONSE_TTL: Duration = Duration::from_millis(300_000);

/// Whether `request` may be answered from, and stored into, the response cache.
pub fn is_cacheable(request: &Request) -> bool {
    let headers = request.headers();
    request.method() == &Method::Get
        && !headers
            .get_all("cache-control")
            .any(|v| v.to_ascii_lowercase().contains("no-cache"))
        && headers.get("x-cache-bypass") != Some("true")
}

/// `"<user-id | anonymous>:<path>[?<query>]"`.
///
/// The query is decoded, stably sorted by key and re-encoded, so parameter
/// order on the wire does not split the cache while repeated keys keep their
/// relative order.
pub fn cache_key(request: &Request) -> String {
    let user = request
        .headers()
        .get("user-id")
        .filter(|id| !id.is_empty())
        .unwrap_or("anonymous");

    let mut pairs = request.query_pairs();
    if pairs.is_empty() {
        return format!("{user}:{}", request.path());
    }

    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{user}:{}?{query}", request.path())
}

/// A stored response body. UTF-8 bodies are kept as a JSON string; anything
/// else falls back to a byte array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CachedBody {
    Text(String),
    Binary(Vec<u8>),
}

impl CachedBody {
    fn from_bytes(bytes: &[u8]) -> Self {
        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => CachedBody::Text(text),
            Err(e) => CachedBody::Binary(e.into_bytes()),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            CachedBody::Text(text) => text.into_bytes(),
            CachedBody::Binary(bytes) => bytes,
        }
    }
}

/// The parts of a [`Response`] that are replayed on a hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub body: CachedBody,
}

impl CachedResponse {
    pub fn capture(response: &Response) -> Self {
        Self {
            status: response.status().as_u16(),
            content_type: response.headers().get("content-type").map(str::to_owned),
            body: CachedBody::from_bytes(response.body_ref()),
        }
    }

    pub fn into_response(self) -> Response {
        let status = StatusCode::try_from(self.status).unwrap_or(StatusCode::Ok);
        let mut response = Response::new(status).body_bytes(self.body.into_bytes());
        if let Some(content_type) = self.content_type {
            response.add_header("Content-Type", content_type);
        }
        response
    }
}

/// Serves cacheable `GET`s from a [`CacheService`] and stores successful
/// responses for [`RESPONSE_TTL`].
///
/// Hits never reach the handler and are marked `X-Cache: HIT`; freshly
/// stored responses are marked `X-Cache: MISS`. Cache failures are logged and
/// otherwise ignored. Entries are never invalidated here; they expire.
///
/// Lookups go through [`CacheService::peek`], so request URLs never land in
/// the per-key hit/miss statistics.
pub struct ResponseCacheMiddleware {
    cache: CacheService,
    ttl: Duration,
    excluded: Vec<Pattern>,
}

impl ResponseCacheMiddleware {
    pub fn new(cache: CacheService) -> Self {
        Self {
            cache,
            ttl: RESPONSE_TTL,
            excluded: Vec::new(),
        }
    }

    /// Never caches paths matching `pattern` (router syntax).
    #[must_use]
    pub fn exclude(mut self, pattern: &str) -> Self {
        self.excluded.push(Pattern::parse(pattern));
        self
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded.iter().any(|p| p.matches(path).is_some())
    }
}

impl Middleware for ResponseCacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        if !is_cacheable(ctx.request()) || self.is_excluded(ctx.request().path()) {
            return Box::pin(next.run(ctx));
        }

        let key = cache_key(ctx.request());
        let cache = self.cache.clone();
        let ttl = self.ttl;

        Box::pin(async move {
            match cache.peek::<CachedResponse>(&key).await {
                Ok(Some(cached)) => {
                    tracing::debug!(key = %key, "response cache hit");
                    return cached.into_response().header("X-Cache", "HIT");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "response cache lookup failed"),
            }

            let mut response = next.run(ctx).await;
            if !response.is_success() {
                return response;
            }

            match cache
                .set(&key, &CachedResponse::capture(&response), Some(ttl))
                .await
            {
                Ok(()) => response.add_header("X-Cache", "MISS"),
                Err(e) => tracing::warn!(key = %key, error = %e, "response cache store failed"),
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, testing::BrokenStore};
    use crate::middleware::{MiddlewareHandler, from_fn, from_middleware};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn request(method: &str, target: &str, headers: &str) -> Request {
        let raw = format!("{method} {target} HTTP/1.1\r\nHost: localhost\r\n{headers}\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn get(target: &str) -> Request {
        request("GET", target, "")
    }

    struct Harness {
        cache: MiddlewareHandler,
        calls: Arc<AtomicUsize>,
        status: StatusCode,
    }

    impl Harness {
        fn new(service: CacheService, status: StatusCode) -> Self {
            Self::with(ResponseCacheMiddleware::new(service), status)
        }

        fn with(middleware: ResponseCacheMiddleware, status: StatusCode) -> Self {
            Self {
                cache: from_middleware(Arc::new(middleware)),
                calls: Arc::new(AtomicUsize::new(0)),
                status,
            }
        }

        fn memory() -> Self {
            Self::new(CacheService::new(Arc::new(MemoryCache::new())), StatusCode::Ok)
        }

        async fn send(&self, req: Request) -> Response {
            let calls = Arc::clone(&self.calls);
            let status = self.status;
            let handler = from_fn(move |ctx: Context, _next: Next| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let path = ctx.request().path().to_owned();
                async move { Response::json(status, &serde_json::json!({ "path": path, "n": n })) }
            });
            Next::new(vec![self.cache.clone(), handler])
                .run(Context::new(req))
                .await
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn cacheability_rules() {
        assert!(is_cacheable(&get("/quests")));
        assert!(!is_cacheable(&request("POST", "/quests", "")));
        assert!(!is_cacheable(&request("GET", "/quests", "Cache-Control: max-age=0, no-cache\r\n")));
        assert!(!is_cacheable(&request("GET", "/quests", "X-Cache-Bypass: true\r\n")));
        assert!(is_cacheable(&request("GET", "/quests", "X-Cache-Bypass: TRUE\r\n")));
        assert!(is_cacheable(&request("GET", "/quests", "Cache-Control: max-age=60\r\n")));
    }

    #[test]
    fn no_cache_on_any_cache_control_line_disables_caching() {
        let headers = "Cache-Control: max-age=60\r\nCache-Control: no-cache\r\n";
        assert!(!is_cacheable(&request("GET", "/quests", headers)));
        assert!(!is_cacheable(&request("GET", "/quests", "Cache-Control: No-Cache\r\n")));
    }

    #[test]
    fn key_defaults_to_anonymous_without_query() {
        assert_eq!(cache_key(&get("/quests")), "anonymous:/quests");
        assert_eq!(
            cache_key(&request("GET", "/quests", "user-id: u-42\r\n")),
            "u-42:/quests"
        );
    }

    #[test]
    fn key_sorts_query_stably() {
        let key = cache_key(&get("/quests?status=active&b=2&a=1&b=1"));
        assert_eq!(key, "anonymous:/quests?a=1&b=2&b=1&status=active");
        assert_eq!(
            cache_key(&get("/quests?a=1&status=active&b=2&b=1")),
            key
        );
    }

    #[test]
    fn key_reencodes_decoded_values() {
        assert_eq!(
            cache_key(&get("/search?q=hello%20world")),
            "anonymous:/search?q=hello+world"
        );
    }

    #[test]
    fn captured_response_replays() {
        let original = Response::json(StatusCode::Created, &serde_json::json!({"id": 1}));
        let replayed = CachedResponse::capture(&original).into_response();
        assert_eq!(replayed.status(), StatusCode::Created);
        assert_eq!(replayed.headers().get("content-type"), Some("application/json"));
        assert_eq!(replayed.body_ref(), original.body_ref());
    }

    #[test]
    fn text_bodies_are_stored_as_strings() {
        let original = Response::json(StatusCode::Ok, &serde_json::json!({"quest": "q-1"}));
        let stored = serde_json::to_value(CachedResponse::capture(&original)).unwrap();
        assert_eq!(stored["body"], r#"{"quest":"q-1"}"#);
        assert_eq!(stored["contentType"], "application/json");

        let restored: CachedResponse = serde_json::from_value(stored).unwrap();
        assert_eq!(restored.into_response().body_ref(), original.body_ref());
    }

    #[test]
    fn binary_bodies_survive_storage() {
        let original = Response::new(StatusCode::Ok).body_bytes(vec![0xff, 0x00, 0xfe]);
        let cached = CachedResponse::capture(&original);
        assert_eq!(cached.body, CachedBody::Binary(vec![0xff, 0x00, 0xfe]));

        let encoded = serde_json::to_vec(&cached).unwrap();
        let restored: CachedResponse = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(restored.into_response().body_ref(), &[0xff, 0x00, 0xfe]);
    }

    #[tokio::test]
    async fn identical_gets_invoke_handler_once() {
        let h = Harness::memory();
        let first = h.send(get("/quests?page=1")).await;
        assert_eq!(first.headers().get("x-cache"), Some("MISS"));

        let second = h.send(get("/quests?page=1")).await;
        assert_eq!(second.headers().get("x-cache"), Some("HIT"));
        assert_eq!(second.status(), StatusCode::Ok);
        assert_eq!(second.body_ref(), first.body_ref());
        assert_eq!(second.headers().get("content-type"), Some("application/json"));
        assert_eq!(h.calls(), 1);
    }

    #[tokio::test]
    async fn users_do_not_share_entries() {
        let h = Harness::memory();
        h.send(request("GET", "/profile", "user-id: a\r\n")).await;
        h.send(request("GET", "/profile", "user-id: b\r\n")).await;
        assert_eq!(h.calls(), 2);
    }

    #[tokio::test]
    async fn bypass_headers_never_hit() {
        let h = Harness::memory();
        h.send(get("/quests")).await;
        for headers in ["Cache-Control: no-cache\r\n", "X-Cache-Bypass: true\r\n"] {
            let res = h.send(request("GET", "/quests", headers)).await;
            assert!(res.headers().get("x-cache").is_none());
        }
        assert_eq!(h.calls(), 3);
    }

    #[tokio::test]
    async fn non_get_is_untouched() {
        let h = Harness::memory();
        for _ in 0..2 {
            let res = h.send(request("POST", "/submissions", "")).await;
            assert!(res.headers().get("x-cache").is_none());
        }
        assert_eq!(h.calls(), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let h = Harness::new(
            CacheService::new(Arc::new(MemoryCache::new())),
            StatusCode::NotFound,
        );
        h.send(get("/quests/404")).await;
        let res = h.send(get("/quests/404")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
        assert_eq!(h.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let h = Harness::memory();
        h.send(get("/quests")).await;
        tokio::time::advance(RESPONSE_TTL - Duration::from_secs(1)).await;
        h.send(get("/quests")).await;
        assert_eq!(h.calls(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let res = h.send(get("/quests")).await;
        assert_eq!(res.headers().get("x-cache"), Some("MISS"));
        assert_eq!(h.calls(), 2);
    }

    #[tokio::test]
    async fn backend_errors_are_swallowed() {
        let h = Harness::new(CacheService::new(Arc::new(BrokenStore)), StatusCode::Ok);
        for n in 1..=2 {
            let res = h.send(get("/quests")).await;
            assert_eq!(res.status(), StatusCode::Ok);
            assert!(res.headers().get("x-cache").is_none());
            assert_eq!(h.calls(), n);
        }
    }

    #[tokio::test]
    async fn response_lookups_leave_stats_empty() {
        let service = CacheService::new(Arc::new(MemoryCache::new()));
        let h = Harness::new(service.clone(), StatusCode::Ok);
        h.send(get("/quests")).await;
        let res = h.send(get("/quests")).await;
        assert_eq!(res.headers().get("x-cache"), Some("HIT"));
        for n in 0..50 {
            h.send(get(&format!("/quests/{n}"))).await;
        }
        assert!(service.all_stats().is_empty());
    }

    #[tokio::test]
    async fn excluded_paths_bypass_the_cache() {
        let service = CacheService::new(Arc::new(MemoryCache::new()));
        let h = Harness::with(
            ResponseCacheMiddleware::new(service).exclude("/cache/*"),
            StatusCode::Ok,
        );
        h.send(get("/cache/stats")).await;
        let res = h.send(get("/cache/stats")).await;
        assert!(res.headers().get("x-cache").is_none());
        h.send(get("/quests")).await;
        h.send(get("/quests")).await;
        assert_eq!(h.calls(), 3);
    }
}
