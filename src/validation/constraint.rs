use std::{collections::HashSet, fmt, sync::Arc};

use serde_json::{Map, Value};

use super::formats::{is_proof_hash, is_stellar_address, is_uuid};

/// Predicate applied to every element by [`Constraint::Elements`].
#[derive(Clone)]
pub struct ElementPredicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>);

impl ElementPredicate {
    pub fn new(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn test(&self, value: &Value) -> bool {
        (self.0)(value)
    }
}

impl fmt::Debug for ElementPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ElementPredicate(..)")
    }
}

/// A single declarative rule on one field of a JSON object.
///
/// Cross-field rules (`RequiredIf`, `RequiredIfPresent`, `Match`) see the
/// enclosing object; all others see only the field's value.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Skip every other constraint on the field when it is absent or `null`.
    Optional,
    NotEmpty,
    IsString,
    /// Minimum length of a string, in characters.
    MinLength(usize),
    /// Maximum length of a string, in characters.
    MaxLength(usize),
    IsUuid,
    IsStellarAddress,
    IsProofHash,
    /// Minimum number of array elements.
    MinSize(usize),
    /// Maximum number of array elements.
    MaxSize(usize),
    /// No two array elements are deeply equal.
    Unique,
    Elements(ElementPredicate),
    /// Present and non-empty whenever `object[other] == value`.
    RequiredIf { other: String, value: Value },
    /// Present and non-empty whenever `object[other]` is truthy.
    RequiredIfPresent(String),
    /// Strictly equal to `object[other]`.
    Match(String),
    /// Any constraint, reported with a fixed message instead of its own.
    WithMessage(Box<Constraint>, String),
}

impl Constraint {
    pub fn elements(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Constraint::Elements(ElementPredicate::new(f))
    }

    pub fn required_if(other: impl Into<String>, value: impl Into<Value>) -> Self {
        Constraint::RequiredIf {
            other: other.into(),
            value: value.into(),
        }
    }

    pub fn required_if_present(other: impl Into<String>) -> Self {
        Constraint::RequiredIfPresent(other.into())
    }

    pub fn matches(other: impl Into<String>) -> Self {
        Constraint::Match(other.into())
    }

    #[must_use]
    pub fn with_message(self, message: impl Into<String>) -> Self {
        match self {
            Constraint::WithMessage(inner, _) => Constraint::WithMessage(inner, message.into()),
            other => Constraint::WithMessage(Box::new(other), message.into()),
        }
    }

    pub(crate) fn is_optional(&self) -> bool {
        match self {
            Constraint::Optional => true,
            Constraint::WithMessage(inner, _) => inner.is_optional(),
            _ => false,
        }
    }

    /// Checks `value` (the field as found in `object`, `None` when absent) and
    /// returns the failure message.
    pub(crate) fn check(
        &self,
        field: &str,
        value: Option<&Value>,
        object: &Map<String, Value>,
    ) -> Result<(), String> {
        let ok = match self {
            Constraint::Optional => true,
            Constraint::NotEmpty => !is_blank(value),
            Constraint::IsString => matches!(value, Some(Value::String(_))),
            Constraint::MinLength(n) => as_str(value).is_some_and(|s| s.chars().count() >= *n),
            Constraint::MaxLength(n) => as_str(value).is_some_and(|s| s.chars().count() <= *n),
            Constraint::IsUuid => as_str(value).is_some_and(is_uuid),
            Constraint::IsStellarAddress => as_str(value).is_some_and(is_stellar_address),
            Constraint::IsProofHash => as_str(value).is_some_and(is_proof_hash),
            Constraint::MinSize(n) => as_array(value).is_some_and(|a| a.len() >= *n),
            Constraint::MaxSize(n) => as_array(value).is_some_and(|a| a.len() <= *n),
            Constraint::Unique => as_array(value).is_some_and(|a| all_distinct(a)),
            Constraint::Elements(pred) => as_array(value).is_some_and(|a| a.iter().all(|v| pred.test(v))),
            Constraint::RequiredIf { other, value: expected } => {
                object.get(other) != Some(expected) || !is_blank(value)
            }
            Constraint::RequiredIfPresent(other) => {
                !object.get(other).is_some_and(is_truthy) || !is_blank(value)
            }
            Constraint::Match(other) => value == object.get(other),
            Constraint::WithMessage(inner, message) => {
                return inner.check(field, value, object).map_err(|_| message.clone());
            }
        };

        if ok { Ok(()) } else { Err(self.message(field)) }
    }

    fn message(&self, field: &str) -> String {
        match self {
            Constraint::Optional => String::new(),
            Constraint::NotEmpty => format!("{field} should not be empty"),
            Constraint::IsString => format!("{field} must be a string"),
            Constraint::MinLength(n) => {
                format!("{field} must be longer than or equal to {n} characters")
            }
            Constraint::MaxLength(n) => {
                format!("{field} must be shorter than or equal to {n} characters")
            }
            Constraint::IsUuid => format!("{field} must be a UUID"),
            Constraint::IsStellarAddress => {
                format!("{field} must be a valid Stellar public key address")
            }
            Constraint::IsProofHash => format!(
                "{field} must be a valid proof hash (SHA-256, IPFS CID, or Arweave transaction ID)"
            ),
            Constraint::MinSize(n) => format!("{field} must have at least {n} elements"),
            Constraint::MaxSize(n) => format!("{field} must have at most {n} elements"),
            Constraint::Unique => format!("{field} must contain unique elements"),
            Constraint::Elements(_) => format!("All elements in {field} must be valid"),
            Constraint::RequiredIf { other, value } => {
                format!("{field} is required when {other} is {}", display_value(value))
            }
            Constraint::RequiredIfPresent(other) => {
                format!("{field} is required when {other} is present")
            }
            Constraint::Match(other) => format!("{field} must match {other}"),
            Constraint::WithMessage(_, message) => message.clone(),
        }
    }
}

fn as_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str)
}

fn as_array(value: Option<&Value>) -> Option<&Vec<Value>> {
    value.and_then(Value::as_array)
}

/// Absent, `null` or `""`.
pub(crate) fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// JavaScript truthiness: everything but `null`, `false`, `0`, `NaN` and `""`.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn all_distinct(items: &[Value]) -> bool {
    let mut seen = HashSet::with_capacity(items.len());
    items.iter().all(|item| seen.insert(canonical(item)))
}

/// Text form under which deeply equal values coincide. Integral numbers render
/// the same whether written as `1` or `1.0`; object keys are sorted.
fn canonical(value: &Value) -> String {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return i.to_string();
            }
            if let Some(u) = n.as_u64() {
                return u.to_string();
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => (f as i64).to_string(),
                _ => n.to_string(),
            }
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, String)> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let inner: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{v}", Value::from(k.as_str())))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        other => other.to_string(),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
