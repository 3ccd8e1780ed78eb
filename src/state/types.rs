//! State type definitions
//!
//! Defines the snapshot representation, field kind classification and the
//! update payload accepted by the store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Field name to value mapping, iterated in insertion order
pub type Snapshot = serde_json::Map<String, Value>;

/// Semantic kind of a state field, fixed by the first value observed for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Ordered list of elements
    Sequence,
    /// Open-ended key/value mapping
    Record,
    /// Numeric scalar
    Number,
    /// Anything else (string, boolean, null)
    Scalar,
}

impl FieldKind {
    /// Classify a value. Never fails: unrecognized shapes are scalars.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Array(_) => FieldKind::Sequence,
            Value::Object(_) => FieldKind::Record,
            Value::Number(_) => FieldKind::Number,
            _ => FieldKind::Scalar,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Sequence => "sequence",
            FieldKind::Record => "record",
            FieldKind::Number => "number",
            FieldKind::Scalar => "scalar",
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

type ComputeFn = Box<dyn FnOnce(&Value) -> Result<Value> + Send>;

/// Update applied to a single field by [`Store::mutate`](super::Store::mutate)
pub enum Update {
    /// Replace the field with a literal value
    Replace(Value),
    /// Derive the new value from the current one
    Compute(ComputeFn),
}

impl Update {
    /// Build an update from an infallible function of the current value
    pub fn compute<F>(f: F) -> Self
    where
        F: FnOnce(&Value) -> Value + Send + 'static,
    {
        Update::Compute(Box::new(move |current| Ok(f(current))))
    }

    /// Build an update from a function that may reject the current value
    pub fn try_compute<F>(f: F) -> Self
    where
        F: FnOnce(&Value) -> Result<Value> + Send + 'static,
    {
        Update::Compute(Box::new(f))
    }

    pub(crate) fn apply(self, current: &Value) -> Result<Value> {
        match self {
            Update::Replace(value) => Ok(value),
            Update::Compute(f) => f(current),
        }
    }
}

impl From<Value> for Update {
    fn from(value: Value) -> Self {
        Update::Replace(value)
    }
}

impl std::fmt::Debug for Update {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Update::Replace(value) => f.debug_tuple("Replace").field(value).finish(),
            Update::Compute(_) => f.write_str("Compute(..)"),
        }
    }
}

/// Equality used by conditional waiters.
///
/// Structural JSON equality, except that numbers compare by numeric value so
/// `5` and `5.0` are equal.
pub fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x == y;
            }
            x.as_f64() == y.as_f64()
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| strict_eq(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| strict_eq(v, w)))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification() {
        assert_eq!(FieldKind::of(&json!([])), FieldKind::Sequence);
        assert_eq!(FieldKind::of(&json!({"a": 1})), FieldKind::Record);
        assert_eq!(FieldKind::of(&json!(3.5)), FieldKind::Number);
        assert_eq!(FieldKind::of(&json!("x")), FieldKind::Scalar);
        assert_eq!(FieldKind::of(&json!(true)), FieldKind::Scalar);
        assert_eq!(FieldKind::of(&Value::Null), FieldKind::Scalar);
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&FieldKind::Record).unwrap(), "\"record\"");
        assert_eq!(FieldKind::Sequence.to_string(), "sequence");
    }

    #[test]
    fn test_strict_eq_numbers() {
        assert!(strict_eq(&json!(5), &json!(5.0)));
        assert!(strict_eq(&json!(-3), &json!(-3)));
        assert!(!strict_eq(&json!(5), &json!(6)));
        assert!(!strict_eq(&json!(5), &json!("5")));
    }

    #[test]
    fn test_strict_eq_nested() {
        assert!(strict_eq(&json!({"a": [1, 2.0]}), &json!({"a": [1.0, 2]})));
        assert!(!strict_eq(&json!([1, 2]), &json!([1, 2, 3])));
        assert!(!strict_eq(&json!({"a": 1}), &json!({"b": 1})));
        assert!(strict_eq(&Value::Null, &Value::Null));
    }

    #[test]
    fn test_update_apply() {
        let replaced = Update::Replace(json!(1)).apply(&json!(0)).unwrap();
        assert_eq!(replaced, json!(1));

        let computed = Update::compute(|v| json!(v.as_i64().unwrap_or(0) * 2))
            .apply(&json!(21))
            .unwrap();
        assert_eq!(computed, json!(42));

        let rejected = Update::try_compute(|_| {
            Err(crate::error::StoreError::UnknownKey {
                key: "x".to_string(),
            })
        })
        .apply(&json!(0));
        assert!(rejected.is_err());
    }
}
