//! Error types for store operations and configuration loading

use thiserror::Error;

use crate::state::FieldKind;

/// Errors surfaced by [`Store::mutate`](crate::state::Store::mutate) and dispatcher operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Unknown state key: {key}")]
    UnknownKey { key: String },

    #[error("State key '{key}' holds a value that is not a {expected}")]
    KindMismatch { key: String, expected: FieldKind },

    #[error("Arithmetic on state key '{key}' produced a non-finite number")]
    NumberOverflow { key: String },

    /// Raised after every listener has run, when at least one of them panicked
    #[error("{failures} listener(s) panicked while handling a change to '{key}'")]
    ListenerPanicked { key: String, failures: usize },
}

impl StoreError {
    /// Key the failed operation targeted
    pub fn key(&self) -> &str {
        match self {
            Self::UnknownKey { key }
            | Self::KindMismatch { key, .. }
            | Self::NumberOverflow { key }
            | Self::ListenerPanicked { key, .. } => key,
        }
    }
}

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("initial_state must be a mapping of field names to values")]
    InitialStateNotMapping,

    #[error("server.ws_path must start with '/': {path}")]
    InvalidWsPath { path: String },
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
