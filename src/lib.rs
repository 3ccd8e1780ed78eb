//! livestate - reactive shared state replicated over WebSocket
//!
//! A single [`Store`] holds the state object. Code mutates fields through
//! kind-specific [`Dispatcher`]s or [`Store::mutate`]; listeners fire
//! synchronously and the [`SyncBridge`] pushes the snapshot to every
//! connected client, applying the updates clients send back.

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod state;

pub use bridge::{ClientId, Envelope, Frame, Inbound, SyncBridge, SyncOptions};
pub use config::AppConfig;
pub use error::{ConfigError, StoreError};
pub use state::{Amount, Dispatcher, FieldKind, Snapshot, Store, Subscription, Update, WhenValue};
