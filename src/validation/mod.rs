//! Declarative payload validation.
//!
//! A [`Schema`] lists the constraints on each field of a JSON object.
//! [`validate`] runs all of them and reports every failure at once, so a
//! client sees the full list of problems in a single `400`.
//!
//! ```
//! use earngate::validation::{Constraint, Schema, validate};
//! use serde_json::json;
//!
//! let schema = Schema::new()
//!     .field("status", [Constraint::IsString])
//!     .field("reason", [Constraint::required_if("status", "PAUSED")]);
//!
//! assert!(validate(&schema, &json!({ "status": "ACTIVE" })).is_ok());
//! let err = validate(&schema, &json!({ "status": "PAUSED" })).unwrap_err();
//! assert_eq!(err.messages("reason"), ["reason is required when status is PAUSED"]);
//! ```

mod constraint;
mod errors;
pub mod formats;
mod sanitize;

use serde_json::{Map, Value};

pub use constraint::{Constraint, ElementPredicate};
pub use errors::ValidationErrors;
pub use sanitize::{sanitize, sanitize_str};

#[derive(Debug, Clone)]
struct FieldRule {
    name: String,
    constraints: Vec<Constraint>,
    nested: Option<Schema>,
}

/// Ordered constraints for the fields of one JSON object.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<FieldRule>,
    forbid_unknown: bool,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, constraints: impl IntoIterator<Item = Constraint>) -> Self {
        self.fields.push(FieldRule {
            name: name.into(),
            constraints: constraints.into_iter().collect(),
            nested: None,
        });
        self
    }

    /// A field holding an object validated by `schema`. Its failures are
    /// reported as `name.child`.
    #[must_use]
    pub fn nested(
        mut self,
        name: impl Into<String>,
        constraints: impl IntoIterator<Item = Constraint>,
        schema: Schema,
    ) -> Self {
        self.fields.push(FieldRule {
            name: name.into(),
            constraints: constraints.into_iter().collect(),
            nested: Some(schema),
        });
        self
    }

    /// Rejects properties the schema does not declare, reporting
    /// `property <name> should not exist` under each one.
    #[must_use]
    pub fn forbid_unknown(mut self) -> Self {
        self.forbid_unknown = true;
        self
    }

    fn declares(&self, name: &str) -> bool {
        self.fields.iter().any(|rule| rule.name == name)
    }

    fn check_object(&self, object: &Map<String, Value>) -> ValidationErrors {
        let mut errors = ValidationErrors::new();

        if self.forbid_unknown {
            for key in object.keys().filter(|key| !self.declares(key)) {
                errors.add(key.clone(), format!("property {key} should not exist"));
            }
        }

        for rule in &self.fields {
            let value = object.get(&rule.name);
            let absent = matches!(value, None | Some(Value::Null));
            if absent && rule.constraints.iter().any(Constraint::is_optional) {
                continue;
            }

            for constraint in &rule.constraints {
                if let Err(message) = constraint.check(&rule.name, value, object) {
                    errors.add(rule.name.clone(), message);
                }
            }

            if let (Some(schema), Some(Value::Object(child))) = (&rule.nested, value) {
                errors.merge_nested(&rule.name, schema.check_object(child));
            }
        }

        errors
    }
}

/// Runs `schema` against `value`. A non-object value is validated as if every
/// field were absent.
///
/// # Errors
///
/// Returns every failing field and message.
pub fn validate(schema: &Schema, value: &Value) -> Result<(), ValidationErrors> {
    let empty = Map::new();
    let object = value.as_object().unwrap_or(&empty);
    schema.check_object(object).into_result()
}
