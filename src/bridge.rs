//! Socket synchronization bridge - replicates the store to connected clients
//!
//! The bridge owns the set of connected clients and nothing else. It
//! subscribes once to the store; on every mutation it sends the whole
//! snapshot, one envelope per field, to every client (including the one
//! whose message caused the mutation). Inbound text frames are decoded as
//! envelopes and fed back into [`Store::mutate`].
//!
//! The bridge is transport-agnostic: a client is an outbound text queue. The
//! task owning the real socket drains the queue and reports open, message
//! and close events (see [`crate::api`] for the axum WebSocket wiring).

mod envelope;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::StoreError;
use crate::state::{Snapshot, Store, Subscription, Update};

pub use envelope::{encode_snapshot, Envelope};

/// Outbound text queue of one client
pub type ClientSender = mpsc::UnboundedSender<String>;

/// Identifier of a connected client, allocated in connection order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Inbound frame as delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// What happened to an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Applied to the store and fanned out
    Applied,
    /// Non-text frame
    Ignored,
    /// Not a `{key, value}` envelope
    Malformed,
    /// Key is not a field of the state
    UnknownKey,
    /// Applied, but the store reported a failure
    Failed(StoreError),
}

/// Bridge behavior switches
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Push the whole snapshot to a client as soon as it connects
    pub sync_on_connect: bool,
}

struct ConnectedClient {
    tx: ClientSender,
    connected_at: DateTime<Utc>,
}

type ClientMap = BTreeMap<ClientId, ConnectedClient>;

/// Socket event handlers bound to one store
#[derive(Clone)]
pub struct SyncBridge {
    store: Store,
    clients: Arc<RwLock<ClientMap>>,
    next_id: Arc<AtomicU64>,
    options: SyncOptions,
    subscription: Arc<Subscription>,
}

impl SyncBridge {
    /// Subscribe to `store` and return the handler bundle
    pub fn attach(store: Store, options: SyncOptions) -> Self {
        let clients: Arc<RwLock<ClientMap>> = Arc::new(RwLock::new(ClientMap::new()));

        // Weak store handle: the store owns this closure
        let weak_store = store.downgrade();
        let fanout_clients = clients.clone();
        let subscription = store.subscribe(move || {
            let Some(store) = weak_store.upgrade() else {
                return;
            };
            broadcast(&store.state(), &fanout_clients.read());
        });

        info!(
            fields = store.keys().len(),
            sync_on_connect = options.sync_on_connect,
            "Sync bridge attached"
        );

        Self {
            store,
            clients,
            next_id: Arc::new(AtomicU64::new(1)),
            options,
            subscription: Arc::new(subscription),
        }
    }

    /// Register a newly opened connection
    pub fn on_open(&self, tx: ClientSender) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let connected = {
            // Held across the initial sync so no broadcast can slip in between
            let mut clients = self.clients.write();
            if self.options.sync_on_connect {
                send_all(id, &tx, &encode_snapshot(&self.store.state()));
            }
            clients.insert(
                id,
                ConnectedClient {
                    tx,
                    connected_at: Utc::now(),
                },
            );
            clients.len()
        };
        debug!(client = %id, connected, "Client connected");
        id
    }

    /// Remove a client. Returns false if it was already gone.
    pub fn on_close(&self, id: ClientId) -> bool {
        let removed = self.clients.write().remove(&id);
        match removed {
            Some(client) => {
                let duration = Utc::now() - client.connected_at;
                debug!(
                    client = %id,
                    connected_secs = duration.num_seconds(),
                    "Client disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Handle one inbound frame from `id`
    pub fn on_message(&self, id: ClientId, frame: Frame) -> Inbound {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => {
                trace!(client = %id, bytes = data.len(), "Ignoring binary frame");
                return Inbound::Ignored;
            }
        };

        let envelope = match Envelope::decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(client = %id, error = %e, "Dropping malformed message");
                return Inbound::Malformed;
            }
        };

        trace!(client = %id, key = %envelope.key, "Inbound update");
        match self
            .store
            .mutate(&envelope.key, Update::Replace(envelope.value))
        {
            Ok(()) => Inbound::Applied,
            Err(StoreError::UnknownKey { key }) => {
                debug!(client = %id, key = %key, "Dropping message for unknown key");
                Inbound::UnknownKey
            }
            Err(e) => {
                warn!(client = %id, error = %e, "Inbound update failed");
                Inbound::Failed(e)
            }
        }
    }

    /// Convenience for transports handing over raw text
    pub fn on_text(&self, id: ClientId, text: impl Into<String>) -> Inbound {
        self.on_message(id, Frame::Text(text.into()))
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_connected(&self, id: ClientId) -> bool {
        self.clients.read().contains_key(&id)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Stop replicating store mutations. Clients stay registered.
    pub fn detach(&self) {
        self.subscription.unsubscribe();
        info!("Sync bridge detached");
    }
}

/// Send every field of `snapshot` to every client, in connection order
fn broadcast(snapshot: &Snapshot, clients: &ClientMap) {
    if clients.is_empty() {
        return;
    }
    let messages = encode_snapshot(snapshot);
    for (id, client) in clients {
        send_all(*id, &client.tx, &messages);
    }
    trace!(
        clients = clients.len(),
        fields = messages.len(),
        "Snapshot broadcast"
    );
}

fn send_all(id: ClientId, tx: &ClientSender, messages: &[String]) {
    for message in messages {
        // A closed queue means the socket task is exiting and will call on_close
        if tx.send(message.clone()).is_err() {
            debug!(client = %id, "Send to closed client");
            return;
        }
    }
}
