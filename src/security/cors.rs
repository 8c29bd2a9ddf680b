//! Cross-Origin Resource Sharing for the browser front end.

use std::pin::Pin;

use crate::{
    Method, Response, StatusCode,
    context::Context,
    middleware::{Middleware, Next},
};

/// CORS middleware: validates `Origin` against an allow-list, answers
/// preflight requests, and decorates actual responses.
///
/// - No `Origin`, or an origin outside the allow-list: the request passes
///   through untouched.
/// - `OPTIONS` preflight: short-circuits with `204 No Content`.
/// - Otherwise the handler runs and the `Access-Control-*` headers are appended.
///
/// Specific origins are echoed back with `Access-Control-Allow-Credentials: true`
/// and `Vary: Origin`; the `*` wildcard gets neither.
///
/// # Examples
///
/// ```rust
/// use earngate::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new(["https://app.stellarearn.io"]).allow_header("X-Request-ID");
/// ```
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    exposed_headers: Vec<String>,
}

impl CorsMiddleware {
    /// A policy for `origins` with the methods and headers the API uses.
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let strings = |items: &[&str]| items.iter().map(|s| (*s).to_owned()).collect();
        Self {
            allowed_origins: origins.into_iter().map(Into::into).collect(),
            allowed_methods: strings(&["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]),
            allowed_headers: strings(&[
                "Content-Type",
                "Authorization",
                "Cache-Control",
                "X-Cache-Bypass",
                "user-id",
            ]),
            exposed_headers: strings(&[
                "X-Cache",
                "X-RateLimit-Limit",
                "X-RateLimit-Remaining",
                "X-RateLimit-Reset",
                "Retry-After",
            ]),
        }
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    #[must_use]
    pub fn expose_header(mut self, header: impl Into<String>) -> Self {
        self.exposed_headers.push(header.into());
        self
    }

    fn allowed_origin(&self, origin: &str) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else {
            self.allowed_origins
                .iter()
                .find(|o| o.as_str() == origin)
                .cloned()
        }
    }
}

fn decorate(resp: &mut Response, origin: &str) {
    resp.add_header("Access-Control-Allow-Origin", origin);
    if origin != "*" {
        resp.add_header("Access-Control-Allow-Credentials", "true");
        resp.add_header("Vary", "Origin");
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let Some(origin) = ctx
            .request()
            .headers()
            .get("origin")
            .and_then(|o| self.allowed_origin(o))
        else {
            return Box::pin(next.run(ctx));
        };

        if ctx.request().method() == &Method::Options {
            let mut resp = Response::new(StatusCode::NoContent)
                .header("Access-Control-Allow-Methods", self.allowed_methods.join(", "))
                .header("Access-Control-Allow-Headers", self.allowed_headers.join(", "))
                .header("Access-Control-Max-Age", "3600");
            decorate(&mut resp, &origin);
            return Box::pin(async move { resp });
        }

        let exposed = self.exposed_headers.join(", ");
        Box::pin(async move {
            let mut resp = next.run(ctx).await;
            decorate(&mut resp, &origin);
            resp.add_header("Access-Control-Expose-Headers", exposed);
            resp
        })
    }
}
