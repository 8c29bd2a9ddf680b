use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::{Response, StatusCode};

/// Every failing constraint of a payload, grouped by field path.
///
/// Nested fields are addressed with `.` (`reward.amount`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Error)]
#[serde(transparent)]
#[error("validation failed for {}", .fields.keys().cloned().collect::<Vec<_>>().join(", "))]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    /// Folds `other` in, prefixing each of its fields with `prefix.`.
    pub fn merge_nested(&mut self, prefix: &str, other: ValidationErrors) {
        for (field, messages) in other.fields {
            self.fields
                .entry(format!("{prefix}.{field}"))
                .or_default()
                .extend(messages);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of failing fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Messages recorded for `field`, empty if it passed.
    pub fn messages(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn fields(&self) -> &BTreeMap<String, Vec<String>> {
        &self.fields
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }

    /// Renders the structured `400 Bad Request` body for a request to `path`.
    pub fn into_response(self, path: &str) -> Response {
        tracing::warn!(path = %path, fields = ?self.fields.keys().collect::<Vec<_>>(), "validation failed");
        Response::json(
            StatusCode::BadRequest,
            &serde_json::json!({
                "statusCode": 400,
                "message": "Validation failed",
                "errors": self.fields,
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "path": path,
            }),
        )
    }
}
