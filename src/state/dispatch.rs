//! Dispatcher factory - per-field mutation operations shaped by field kind
//!
//! Each field of the initial snapshot gets a [`Dispatcher`] whose operation
//! set is chosen once from the field's [`FieldKind`]. Operations never hold
//! on to a value captured at build time: anything that depends on the live
//! value (push, increment, merge) is expressed as an [`Update::Compute`] and
//! evaluated by the store against the current value.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Number, Value};

use super::types::{FieldKind, Snapshot, Update};
use crate::error::{Result, StoreError};

/// Mutation callback shared by every dispatcher built from one snapshot
pub type MutateFn = Arc<dyn Fn(&str, Update) -> Result<()> + Send + Sync>;

/// Dispatchers keyed by field name
pub type Dispatchers = BTreeMap<String, Dispatcher>;

/// Build one dispatcher per field of `initial`, all routed through `mutate`
pub fn build_dispatchers(initial: &Snapshot, mutate: MutateFn) -> Dispatchers {
    initial
        .iter()
        .map(|(key, value)| {
            let dispatcher = Dispatcher::new(key, FieldKind::of(value), mutate.clone());
            (key.clone(), dispatcher)
        })
        .collect()
}

/// Key plus the shared mutation callback
#[derive(Clone)]
struct Binding {
    key: String,
    mutate: MutateFn,
}

impl Binding {
    fn replace(&self, value: Value) -> Result<()> {
        (self.mutate)(&self.key, Update::Replace(value))
    }

    fn compute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&str, &Value) -> Result<Value> + Send + 'static,
    {
        let key = self.key.clone();
        (self.mutate)(&self.key, Update::try_compute(move |current| f(&key, current)))
    }
}

/// Operation set bound to one field
#[derive(Clone)]
pub enum Dispatcher {
    Sequence(SequenceOps),
    Record(RecordOps),
    Number(NumberOps),
    Scalar(ScalarOps),
}

impl Dispatcher {
    /// Create the dispatcher matching `kind` for `key`
    pub fn new(key: &str, kind: FieldKind, mutate: MutateFn) -> Self {
        let binding = Binding {
            key: key.to_string(),
            mutate,
        };
        match kind {
            FieldKind::Sequence => Dispatcher::Sequence(SequenceOps { binding }),
            FieldKind::Record => Dispatcher::Record(RecordOps { binding }),
            FieldKind::Number => Dispatcher::Number(NumberOps { binding }),
            FieldKind::Scalar => Dispatcher::Scalar(ScalarOps { binding }),
        }
    }

    /// Field this dispatcher mutates
    pub fn key(&self) -> &str {
        &self.binding().key
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Dispatcher::Sequence(_) => FieldKind::Sequence,
            Dispatcher::Record(_) => FieldKind::Record,
            Dispatcher::Number(_) => FieldKind::Number,
            Dispatcher::Scalar(_) => FieldKind::Scalar,
        }
    }

    /// Names of the operations exposed for this field
    pub fn operations(&self) -> &'static [&'static str] {
        match self {
            Dispatcher::Sequence(_) => &["set", "push", "pop", "insert"],
            Dispatcher::Record(_) => &["set", "update"],
            Dispatcher::Number(_) => &["set", "increment", "decrement"],
            Dispatcher::Scalar(_) => &["set"],
        }
    }

    /// Replace the whole value, whatever the kind
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        self.binding().replace(value.into())
    }

    pub fn as_sequence(&self) -> Option<&SequenceOps> {
        match self {
            Dispatcher::Sequence(ops) => Some(ops),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RecordOps> {
        match self {
            Dispatcher::Record(ops) => Some(ops),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&NumberOps> {
        match self {
            Dispatcher::Number(ops) => Some(ops),
            _ => None,
        }
    }

    fn binding(&self) -> &Binding {
        match self {
            Dispatcher::Sequence(ops) => &ops.binding,
            Dispatcher::Record(ops) => &ops.binding,
            Dispatcher::Number(ops) => &ops.binding,
            Dispatcher::Scalar(ops) => &ops.binding,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("key", &self.key())
            .field("kind", &self.kind())
            .finish()
    }
}

fn mismatch(key: &str, expected: FieldKind) -> StoreError {
    StoreError::KindMismatch {
        key: key.to_string(),
        expected,
    }
}

fn expect_array(key: &str, current: &Value) -> Result<Vec<Value>> {
    match current {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(mismatch(key, FieldKind::Sequence)),
    }
}

/// Operations for sequence fields
#[derive(Clone)]
pub struct SequenceOps {
    binding: Binding,
}

impl SequenceOps {
    pub fn set(&self, items: Vec<Value>) -> Result<()> {
        self.binding.replace(Value::Array(items))
    }

    /// Append one element
    pub fn push(&self, elem: impl Into<Value>) -> Result<()> {
        let elem = elem.into();
        self.binding.compute(move |key, current| {
            let mut items = expect_array(key, current)?;
            items.push(elem);
            Ok(Value::Array(items))
        })
    }

    /// Remove the last element. An empty sequence stays empty.
    pub fn pop(&self) -> Result<()> {
        self.binding.compute(|key, current| {
            let mut items = expect_array(key, current)?;
            items.pop();
            Ok(Value::Array(items))
        })
    }

    /// Insert at `index`, shifting later elements right. Past the end appends.
    pub fn insert(&self, index: usize, elem: impl Into<Value>) -> Result<()> {
        let elem = elem.into();
        self.binding.compute(move |key, current| {
            let mut items = expect_array(key, current)?;
            let index = index.min(items.len());
            items.insert(index, elem);
            Ok(Value::Array(items))
        })
    }
}

/// Operations for record fields
#[derive(Clone)]
pub struct RecordOps {
    binding: Binding,
}

impl RecordOps {
    pub fn set(&self, record: Map<String, Value>) -> Result<()> {
        self.binding.replace(Value::Object(record))
    }

    /// Shallow merge: top-level entries of `partial` overwrite or extend the record
    pub fn update(&self, partial: Map<String, Value>) -> Result<()> {
        self.binding.compute(move |key, current| {
            let Value::Object(record) = current else {
                return Err(mismatch(key, FieldKind::Record));
            };
            let mut merged = record.clone();
            merged.extend(partial);
            Ok(Value::Object(merged))
        })
    }
}

/// Step for [`NumberOps::increment_by`] and [`NumberOps::decrement_by`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Amount {
    Int(i64),
    Float(f64),
}

macro_rules! amount_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Amount {
                fn from(n: $ty) -> Self {
                    Amount::Int(i64::from(n))
                }
            }
        )*
    };
}

amount_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Amount {
    fn from(n: f32) -> Self {
        Amount::Float(f64::from(n))
    }
}

impl From<f64> for Amount {
    fn from(n: f64) -> Self {
        Amount::Float(n)
    }
}

impl From<Number> for Amount {
    fn from(n: Number) -> Self {
        match n.as_i64() {
            Some(i) => Amount::Int(i),
            None => Amount::Float(n.as_f64().unwrap_or(f64::NAN)),
        }
    }
}

/// Operations for number fields
#[derive(Clone)]
pub struct NumberOps {
    binding: Binding,
}

impl NumberOps {
    pub fn set(&self, n: impl Into<Number>) -> Result<()> {
        self.binding.replace(Value::Number(n.into()))
    }

    pub fn increment(&self) -> Result<()> {
        self.increment_by(1)
    }

    pub fn decrement(&self) -> Result<()> {
        self.decrement_by(1)
    }

    pub fn increment_by(&self, amount: impl Into<Amount>) -> Result<()> {
        let amount = amount.into();
        self.binding
            .compute(move |key, current| add(key, current, amount, false))
    }

    pub fn decrement_by(&self, amount: impl Into<Amount>) -> Result<()> {
        let amount = amount.into();
        self.binding
            .compute(move |key, current| add(key, current, amount, true))
    }
}

/// Checked i64 arithmetic when both sides are integers, f64 otherwise.
///
/// Integer overflow is an error rather than a silent switch to floats.
fn add(key: &str, current: &Value, amount: Amount, subtract: bool) -> Result<Value> {
    let Value::Number(n) = current else {
        return Err(mismatch(key, FieldKind::Number));
    };
    let overflow = || StoreError::NumberOverflow {
        key: key.to_string(),
    };

    if let (Some(a), Amount::Int(b)) = (n.as_i64(), amount) {
        let result = if subtract {
            a.checked_sub(b)
        } else {
            a.checked_add(b)
        };
        return result.map(Value::from).ok_or_else(overflow);
    }

    let a = n.as_f64().ok_or_else(overflow)?;
    let b = match amount {
        Amount::Int(b) => b as f64,
        Amount::Float(b) => b,
    };
    let result = if subtract { a - b } else { a + b };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(overflow)
}

/// Operations for scalar fields
#[derive(Clone)]
pub struct ScalarOps {
    binding: Binding,
}

impl ScalarOps {
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        self.binding.replace(value.into())
    }
}
