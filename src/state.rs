//! State management module - shared reactive state with typed dispatchers
//!
//! This module provides the store that owns the single shared state object,
//! the per-field dispatchers generated from its initial shape, and the
//! listener bookkeeping (change listeners, conditional waiters, global
//! subscribers) that drives replication to connected clients.

mod dispatch;
mod store;
mod types;

pub use dispatch::{
    build_dispatchers, Amount, Dispatcher, Dispatchers, MutateFn, NumberOps, RecordOps,
    ScalarOps, SequenceOps,
};
pub use store::{Store, Subscription, WeakStore, WhenValue};
pub use types::{strict_eq, FieldKind, Snapshot, Update};
