//! Middleware pipeline: composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, enabling request inspection, short-circuit
//! responses, and response decoration without coupling handlers to infrastructure
//! concerns. Admission control (throttling) and response caching are both built
//! as middleware on top of these types.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] / [`from_fn`]: build a [`MiddlewareHandler`].
//! - [`Pipeline`]: an ordered middleware stack terminated by a [`Router`].
//! - [`LoggerMiddleware`]: built-in access logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Request, Response, context::Context, router::Router};

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware (or returns a fallback `500` response when the chain is exhausted
/// without any middleware generating a response).
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
pub struct Next {
    middlewares: Vec<MiddlewareHandler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use earngate::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Converts an async closure into a [`MiddlewareHandler`].
///
/// Handy for terminal stages and tests, where a full [`Middleware`] impl is
/// more ceremony than the logic warrants.
pub fn from_fn<F, Fut>(f: F) -> MiddlewareHandler
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(
        move |ctx: Context, next: Next| -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(f(ctx, next))
        },
    )
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// If no handler remains (i.e. the chain is exhausted without producing a
    /// response), a `500 Internal Server Error` response is returned as a safe
    /// fallback.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(crate::StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`
///   (a throttled request, a cache hit).
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy (rate-limit headers, cache population).
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future.
/// - Implementations **should not** hold `&mut` references to shared state across
///   an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// An ordered middleware stack terminated by a [`Router`].
///
/// Middleware run in the order they were added; the router runs last and
/// ignores its `Next`.
///
/// # Examples
///
/// ```rust,no_run
/// use earngate::{Router, Response, StatusCode};
/// use earngate::middleware::{LoggerMiddleware, Pipeline};
///
/// let mut router = Router::new();
/// router.get("/health", |_ctx| async { Response::new(StatusCode::Ok) });
///
/// let pipeline = Pipeline::new(router).layer(LoggerMiddleware);
/// ```
pub struct Pipeline {
    middlewares: Vec<MiddlewareHandler>,
    router: Arc<Router>,
}

impl Pipeline {
    pub fn new(router: Router) -> Self {
        Self {
            middlewares: Vec::new(),
            router: Arc::new(router),
        }
    }

    /// Appends `middleware` to the end of the stack (just before the router).
    #[must_use]
    pub fn layer<M>(self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.layer_arc(Arc::new(middleware))
    }

    /// Appends a shared middleware instance.
    #[must_use]
    pub fn layer_arc<M>(mut self, middleware: Arc<M>) -> Self
    where
        M: Middleware + 'static,
    {
        self.middlewares.push(from_middleware(middleware));
        self
    }

    /// Runs one request through every middleware and then the router.
    pub async fn handle(&self, request: Request) -> Response {
        let router = Arc::clone(&self.router);
        let mut chain = self.middlewares.clone();
        chain.push(from_fn(move |ctx: Context, _next: Next| {
            let router = Arc::clone(&router);
            async move { router.dispatch(ctx).await }
        }));

        Next::new(chain).run(Context::new(request)).await
    }
}

/// Built-in middleware that logs each request's method, path, status, and latency.
///
/// Emits a single `tracing::info!` record after the downstream handler completes.
/// `LoggerMiddleware` never short-circuits.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            tracing::info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                latency_ms = start.elapsed().as_millis() as u64,
                "request completed"
            );

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn get(path: &str) -> Request {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle(
            &self,
            ctx: Context,
            next: Next,
        ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            let tag = self.0;
            Box::pin(async move {
                let mut res = next.run(ctx).await;
                res.add_header("X-Trace", tag);
                res
            })
        }
    }

    #[tokio::test]
    async fn empty_chain_falls_back_to_500() {
        let res = Next::new(vec![]).run(Context::new(get("/"))).await;
        assert_eq!(res.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let chain = vec![
            from_fn(|_ctx: Context, _next: Next| async { Response::new(StatusCode::Forbidden) }),
            from_fn(move |_ctx: Context, _next: Next| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Response::new(StatusCode::Ok) }
            }),
        ];
        let res = Next::new(chain).run(Context::new(get("/"))).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pipeline_runs_layers_in_order_then_routes() {
        let mut router = Router::new();
        router.get("/quests/:id", |ctx: Context| async move {
            let id = ctx.params().get("id").unwrap_or("").to_owned();
            Response::new(StatusCode::Ok).body(id)
        });

        let pipeline = Pipeline::new(router)
            .layer(LoggerMiddleware)
            .layer(Tag("outer"))
            .layer(Tag("inner"));

        let res = pipeline.handle(get("/quests/17")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.body_ref(), b"17");
        // Decoration happens on the way out, innermost first.
        let tags: Vec<_> = res.headers().get_all("x-trace").collect();
        assert_eq!(tags, vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn pipeline_unknown_route_is_404() {
        let pipeline = Pipeline::new(Router::new()).layer(LoggerMiddleware);
        let res = pipeline.handle(get("/missing")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
    }
}
