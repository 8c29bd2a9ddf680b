//! Authentication primitives: principals, bearer-token claims, and token verification.
//!
//! Verification sits behind the [`TokenVerifier`] trait so admission policy can be
//! exercised against a stub; [`JwtVerifier`] is the production HS256 implementation.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::Context;
use crate::http::Headers;

pub mod middleware;

pub use middleware::AuthenticationMiddleware;

/// Caller role as carried in the `role` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Verifier,
    User,
    /// Any role string this service does not recognize.
    #[serde(other)]
    Unknown,
}

/// The authenticated caller attached to a request by an upstream stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: Option<String>,
    pub stellar_address: Option<String>,
    pub subject: Option<String>,
    pub role: Role,
}

impl Principal {
    /// A plain user principal identified by `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            stellar_address: None,
            subject: None,
            role: Role::User,
        }
    }

    /// Builds a principal from verified token claims.
    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            id: claims.sub.clone(),
            stellar_address: claims.stellar_address.clone(),
            subject: claims.sub.clone(),
            role: claims.role.unwrap_or(Role::User),
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub fn with_stellar_address(mut self, address: impl Into<String>) -> Self {
        self.stellar_address = Some(address.into());
        self
    }

    /// The first available identifier: `id`, then `stellarAddress`, then `sub`.
    pub fn identifier(&self) -> Option<&str> {
        [&self.id, &self.stellar_address, &self.subject]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// JWT payload issued by the StellarEarn auth service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stellar_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub exp: u64,
}

impl Claims {
    /// The identity this token speaks for: `sub`, then `stellarAddress`.
    pub fn subject(&self) -> Option<&str> {
        [&self.sub, &self.stellar_address]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }
}

/// Errors produced while verifying a bearer token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token rejected: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    #[error("token verification is not configured")]
    NotConfigured,
}

/// Verifies a bearer token and returns its claims.
pub trait TokenVerifier: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TokenError`] when the token is malformed, badly signed, or expired.
    fn verify(&self, token: &str) -> Result<Claims, TokenError>;
}

/// HS256 verifier backed by a shared secret.
pub struct JwtVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Signs `claims` with the same secret; used by the auth flow and by tests.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Invalid`] if the claims cannot be encoded.
    pub fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.encoding,
        )?)
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims)
    }
}

/// Verifier used when no secret is configured: every token is rejected.
pub struct DisabledVerifier;

impl TokenVerifier for DisabledVerifier {
    fn verify(&self, _token: &str) -> Result<Claims, TokenError> {
        Err(TokenError::NotConfigured)
    }
}

/// Extracts the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &Headers) -> Option<&str> {
    headers
        .get("authorization")?
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
}

/// Verifies the request's bearer token, if any, discarding verification failures.
fn verified_claims(headers: &Headers, verifier: &dyn TokenVerifier) -> Option<Claims> {
    let token = bearer_token(headers)?;
    match verifier.verify(token) {
        Ok(claims) => Some(claims),
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unverifiable bearer token");
            None
        }
    }
}

/// Outcome of checking a request's bearer token, kept in the context
/// extensions. `None` means there was no token or it did not verify.
#[derive(Debug, Clone)]
pub struct VerifiedToken(pub Option<Claims>);

/// Claims of the request's bearer token, verified at most once per request.
///
/// The first stage to ask records the outcome in the context; later stages
/// read it back instead of running the verifier again.
pub fn token_claims(ctx: &mut Context, verifier: &dyn TokenVerifier) -> Option<Claims> {
    if let Some(VerifiedToken(seen)) = ctx.extensions().get::<VerifiedToken>() {
        return seen.clone();
    }
    let claims = verified_claims(ctx.request().headers(), verifier);
    ctx.extensions_mut().insert(VerifiedToken(claims.clone()));
    claims
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const SECRET: &[u8] = b"test-only-key-not-used-in-production";

    /// A far-future expiry so test tokens stay valid.
    pub const FAR_FUTURE: u64 = 9_999_999_999;

    pub fn verifier() -> JwtVerifier {
        JwtVerifier::new(SECRET)
    }

    pub fn token(sub: Option<&str>, address: Option<&str>, role: Option<Role>) -> String {
        verifier()
            .sign(&Claims {
                sub: sub.map(str::to_owned),
                stellar_address: address.map(str::to_owned),
                role,
                exp: FAR_FUTURE,
            })
            .unwrap()
    }

    pub fn claims(sub: Option<&str>, role: Option<Role>) -> Claims {
        Claims {
            sub: sub.map(str::to_owned),
            role,
            exp: FAR_FUTURE,
            ..Claims::default()
        }
    }

    /// Test verifier that counts how often it is asked.
    #[derive(Default)]
    pub struct CountingVerifier {
        pub calls: std::sync::atomic::AtomicUsize,
    }

    impl CountingVerifier {
        pub fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl TokenVerifier for CountingVerifier {
        fn verify(&self, token: &str) -> Result<Claims, TokenError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            verifier().verify(token)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn jwt_round_trip_recovers_claims() {
        let token = token(Some("user-42"), Some("GABC"), Some(Role::Admin));
        let claims = verifier().verify(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("user-42"));
        assert_eq!(claims.stellar_address.as_deref(), Some("GABC"));
        assert_eq!(claims.role, Some(Role::Admin));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = token(Some("user-42"), None, None);
        let other = JwtVerifier::new(b"wrong-key");
        assert!(matches!(other.verify(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let v = verifier();
        let token = v
            .sign(&Claims {
                sub: Some("user-1".into()),
                exp: 1_000,
                ..Claims::default()
            })
            .unwrap();
        assert!(v.verify(&token).is_err());
    }

    #[test]
    fn unknown_role_still_decodes() {
        let claims: Claims =
            serde_json::from_str(r#"{"sub":"x","role":"superuser","exp":1}"#).unwrap();
        assert_eq!(claims.role, Some(Role::Unknown));
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut h = Headers::new();
        h.insert("Authorization", "Basic abc");
        assert_eq!(bearer_token(&h), None);

        let mut h = Headers::new();
        h.insert("authorization", "Bearer abc.def");
        assert_eq!(bearer_token(&h), Some("abc.def"));

        let mut h = Headers::new();
        h.insert("Authorization", "Bearer ");
        assert_eq!(bearer_token(&h), None);
    }

    #[test]
    fn principal_identifier_precedence() {
        let p = Principal {
            id: None,
            stellar_address: Some("GADDR".into()),
            subject: Some("sub-1".into()),
            role: Role::User,
        };
        assert_eq!(p.identifier(), Some("GADDR"));
        assert_eq!(Principal::new("id-1").identifier(), Some("id-1"));
    }

    #[test]
    fn token_is_verified_once_per_request() {
        let token = token(Some("u-3"), None, Some(Role::User));
        let raw = format!("GET / HTTP/1.1\r\nAuthorization: Bearer {token}\r\n\r\n");
        let mut ctx = Context::new(crate::Request::parse(raw.as_bytes()).unwrap().0);
        let counting = CountingVerifier::default();

        let first = token_claims(&mut ctx, &counting);
        let second = token_claims(&mut ctx, &counting);
        assert_eq!(first.as_ref().and_then(Claims::subject), Some("u-3"));
        assert_eq!(first, second);
        assert_eq!(counting.calls(), 1);
    }

    #[test]
    fn failed_verification_is_remembered() {
        let raw = "GET / HTTP/1.1\r\nAuthorization: Bearer a.b.c\r\n\r\n";
        let mut ctx = Context::new(crate::Request::parse(raw.as_bytes()).unwrap().0);
        let counting = CountingVerifier::default();

        assert_eq!(token_claims(&mut ctx, &counting), None);
        assert_eq!(token_claims(&mut ctx, &counting), None);
        assert_eq!(counting.calls(), 1);
    }

    #[test]
    fn claims_subject_prefers_sub() {
        let c = Claims {
            sub: Some("s".into()),
            stellar_address: Some("G".into()),
            ..Claims::default()
        };
        assert_eq!(c.subject(), Some("s"));
        let c = Claims {
            stellar_address: Some("G".into()),
            ..Claims::default()
        };
        assert_eq!(c.subject(), Some("G"));
    }
}
