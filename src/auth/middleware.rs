//! Soft authentication: attach a [`Principal`] for requests that carry a valid
//! bearer token, and let everything else through unauthenticated.

use std::{pin::Pin, sync::Arc};

use crate::{
    Response,
    auth::{Principal, TokenVerifier, token_claims},
    context::Context,
    middleware::{Middleware, Next},
};

/// Verifies `Authorization: Bearer` tokens and attaches the resulting principal.
///
/// Never rejects: a missing or invalid token simply leaves
/// [`Context::principal`] empty, and endpoints that require a caller check
/// for one themselves.
pub struct AuthenticationMiddleware {
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthenticationMiddleware {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }
}

impl Middleware for AuthenticationMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let verifier = Arc::clone(&self.verifier);

        Box::pin(async move {
            let mut ctx = ctx;
            if ctx.principal().is_none() {
                if let Some(claims) = token_claims(&mut ctx, verifier.as_ref()) {
                    let principal = Principal::from_claims(&claims);
                    tracing::debug!(
                        caller = principal.identifier().unwrap_or("-"),
                        role = ?principal.role,
                        "request authenticated"
                    );
                    ctx.set_principal(principal);
                }
            }
            next.run(ctx).await
        })
    }
}
