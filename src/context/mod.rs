//! Per-request context: the parsed request, path parameters, typed extensions,
//! and the authenticated principal.
//!
//! The principal is a first-class field rather than an extension: admission
//! stages such as [`ThrottlerMiddleware`](crate::security::ThrottlerMiddleware)
//! read it through [`Context::principal`] and hand it to the pure policy
//! functions as an explicit argument.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use serde::de::DeserializeOwned;

use crate::Request;
use crate::auth::Principal;
use crate::validation::{self, Schema, ValidationErrors};

/// Type-erased request extensions map, used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value of the same type
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Get a value from the extensions map
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Remove a value from the extensions map
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Path parameters extracted from the matched route
#[derive(Default, Debug, Clone)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }
}

/// Per-request state handed to every middleware and handler.
pub struct Context {
    request: Request,
    params: PathParams,
    extensions: Extensions,
    principal: Option<Principal>,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self::with_params(request, PathParams::new())
    }

    /// Create a context carrying the parameters captured by the router
    pub fn with_params(request: Request, params: PathParams) -> Self {
        Self {
            request,
            params,
            extensions: Extensions::new(),
            principal: None,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// Replaces the path parameters; used by the router once a route matches.
    pub(crate) fn set_params(&mut self, params: PathParams) {
        self.params = params;
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The authenticated caller, if an upstream stage attached one.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn set_principal(&mut self, principal: Principal) {
        self.principal = Some(principal);
    }

    /// Deserializes the raw body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }

    /// Parses, sanitizes and validates the body against `schema`, then
    /// deserializes it into `T`.
    ///
    /// Every failing field is reported at once; a body that is not JSON at all
    /// is reported under the `body` key.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationErrors`] when the body is malformed or any
    /// constraint in `schema` fails.
    pub fn validated_json<T>(&self, schema: &Schema) -> Result<T, ValidationErrors>
    where
        T: DeserializeOwned,
    {
        let raw: serde_json::Value = serde_json::from_slice(self.request.body())
            .map_err(|_| ValidationErrors::single("body", "request body must be valid JSON"))?;
        let value = validation::sanitize(raw);

        validation::validate(schema, &value)?;

        serde_json::from_value(value)
            .map_err(|e| ValidationErrors::single("body", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::validation::Constraint;
    use serde::Deserialize;

    fn post(body: &str) -> Context {
        let raw = format!(
            "POST /submissions HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(req)
    }

    #[derive(Debug, Deserialize)]
    struct Note {
        text: String,
    }

    #[test]
    fn extensions_store_one_value_per_type() {
        let mut ext = Extensions::new();
        ext.insert(5u32);
        ext.insert(9u32);
        assert_eq!(ext.get::<u32>(), Some(&9));
        assert_eq!(ext.remove::<u32>(), Some(9));
        assert!(ext.get::<u32>().is_none());
    }

    #[test]
    fn principal_is_explicit() {
        let mut ctx = post("{}");
        assert!(ctx.principal().is_none());
        ctx.set_principal(Principal::new("u-1").with_role(Role::Admin));
        assert_eq!(ctx.principal().map(|p| p.role), Some(Role::Admin));
    }

    #[test]
    fn validated_json_sanitizes_before_checking() {
        let ctx = post(r#"{"text":"  <b>hello</b>  "}"#);
        let schema = Schema::new().field("text", [Constraint::IsString, Constraint::NotEmpty]);
        let note: Note = ctx.validated_json(&schema).unwrap();
        assert_eq!(note.text, "hello");
    }

    #[test]
    fn validated_json_reports_malformed_body() {
        let ctx = post("not json");
        let err = ctx.validated_json::<Note>(&Schema::new()).unwrap_err();
        assert_eq!(err.messages("body"), ["request body must be valid JSON"]);
    }

    #[test]
    fn validated_json_collects_field_failures() {
        let ctx = post(r#"{"text":""}"#);
        let schema = Schema::new().field("text", [Constraint::NotEmpty]);
        let err = ctx.validated_json::<Note>(&schema).unwrap_err();
        assert_eq!(err.messages("text"), ["text should not be empty"]);
    }
}
