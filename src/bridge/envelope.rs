//! Wire envelope shared by outbound broadcasts and inbound client updates

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::state::Snapshot;

/// `{"key": "<field>", "value": <json>}`
///
/// Both fields are required; `value` may be `null`. Extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub key: String,
    pub value: Value,
}

impl Envelope {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Encode one envelope per snapshot field, in snapshot order
pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<String> {
    snapshot
        .iter()
        .filter_map(|(key, value)| {
            // Borrowed form avoids cloning every value per broadcast
            let envelope = EnvelopeRef { key, value };
            match serde_json::to_string(&envelope) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to encode state envelope");
                    None
                }
            }
        })
        .collect()
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    key: &'a str,
    value: &'a Value,
}
