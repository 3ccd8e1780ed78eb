//! Store - Shared state object with key listeners, waiters and subscribers
//!
//! Owns the canonical snapshot and notifies, in order, the change listeners
//! and conditional waiters registered on the mutated key, then every global
//! subscriber.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use super::dispatch::{build_dispatchers, Dispatcher, Dispatchers, MutateFn};
use super::types::{strict_eq, FieldKind, Snapshot, Update};
use crate::error::{Result, StoreError};

type ChangeFn = Arc<dyn Fn(&Value) + Send + Sync>;
type WaiterFn = Box<dyn FnOnce(&Value) + Send>;
type SubscriberFn = Arc<dyn Fn() + Send + Sync>;

/// One-shot callback armed until the key reaches `expected`
struct Waiter {
    expected: Value,
    callback: Mutex<Option<WaiterFn>>,
}

#[derive(Clone)]
enum KeyListener {
    Change(ChangeFn),
    Waiter(Arc<Waiter>),
}

#[derive(Clone)]
struct ListenerEntry {
    id: u64,
    listener: KeyListener,
}

struct StoreInner {
    /// Snapshot the store was created from; fixes each field's kind
    initial: Snapshot,
    state: RwLock<Snapshot>,
    listeners: RwLock<HashMap<String, Vec<ListenerEntry>>>,
    subscribers: RwLock<Vec<(u64, SubscriberFn)>>,
    next_id: AtomicU64,
    /// Serializes whole mutations (apply + notify). Re-entrant so listeners
    /// running on the mutating thread may mutate again.
    mutation_lock: ReentrantMutex<()>,
}

/// Shared state store
///
/// Cheap to clone: all clones share the same snapshot and listener lists.
/// Data locks are never held while callbacks run, so callbacks may read the
/// store back or mutate it.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// Non-owning reference to a [`Store`], used by long-lived subscribers
#[derive(Clone)]
pub struct WeakStore {
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

impl Store {
    /// Create a store from its initial snapshot
    pub fn new(initial: Snapshot) -> Self {
        debug!(fields = initial.len(), "Store created");
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(initial.clone()),
                initial,
                listeners: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                mutation_lock: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Clone of the current snapshot
    pub fn state(&self) -> Snapshot {
        self.inner.state.read().clone()
    }

    /// Current value of one field
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.state.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.state.read().contains_key(key)
    }

    /// Field names in snapshot order
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.read().keys().cloned().collect()
    }

    /// Kind of a field, as classified from the initial snapshot
    pub fn kind_of(&self, key: &str) -> Option<FieldKind> {
        self.inner.initial.get(key).map(FieldKind::of)
    }

    /// Apply `update` to `key` and notify listeners.
    ///
    /// The snapshot is replaced before any listener runs. Key listeners and
    /// waiters fire in registration order, then global subscribers. A
    /// panicking callback does not stop the others; the mutation still
    /// stands and `ListenerPanicked` is returned once everyone has run.
    pub fn mutate(&self, key: &str, update: impl Into<Update>) -> Result<()> {
        let _serial = self.inner.mutation_lock.lock();

        let current = self.get(key).ok_or_else(|| StoreError::UnknownKey {
            key: key.to_string(),
        })?;
        let next = update.into().apply(&current)?;

        {
            let mut state = self.inner.state.write();
            match state.get_mut(key) {
                Some(slot) => *slot = next.clone(),
                None => {
                    return Err(StoreError::UnknownKey {
                        key: key.to_string(),
                    })
                }
            }
        }
        trace!(key, value = %next, "State mutated");

        let failures = self.notify_key(key, &next) + self.notify_subscribers(key);
        if failures > 0 {
            return Err(StoreError::ListenerPanicked {
                key: key.to_string(),
                failures,
            });
        }
        Ok(())
    }

    /// Register a listener fired with the new value on every change to `key`
    pub fn on_state_change<F>(&self, key: &str, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.push_listener(key, KeyListener::Change(Arc::new(callback)));
    }

    /// Deferred action fired once `key` holds `expected`
    pub fn when_value_is(&self, key: &str, expected: impl Into<Value>) -> WhenValue {
        WhenValue {
            store: self.clone(),
            key: key.to_string(),
            expected: expected.into(),
        }
    }

    /// Register a listener fired after every mutation, whatever the key
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.subscribers.write().push((id, Arc::new(listener)));
        Subscription {
            id,
            store: self.downgrade(),
        }
    }

    /// Number of key listeners and pending waiters on `key`
    pub fn listener_count(&self, key: &str) -> usize {
        self.inner
            .listeners
            .read()
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Dispatchers for every field, shaped by the initial snapshot
    pub fn dispatchers(&self) -> Dispatchers {
        build_dispatchers(&self.inner.initial, self.mutate_fn())
    }

    /// Dispatcher for one field
    pub fn dispatcher(&self, key: &str) -> Option<Dispatcher> {
        let kind = self.kind_of(key)?;
        Some(Dispatcher::new(key, kind, self.mutate_fn()))
    }

    fn mutate_fn(&self) -> MutateFn {
        let store = self.clone();
        Arc::new(move |key: &str, update: Update| store.mutate(key, update))
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push_listener(&self, key: &str, listener: KeyListener) -> u64 {
        let id = self.next_id();
        self.inner
            .listeners
            .write()
            .entry(key.to_string())
            .or_default()
            .push(ListenerEntry { id, listener });
        id
    }

    fn remove_listener(&self, key: &str, id: u64) {
        let mut listeners = self.inner.listeners.write();
        if let Some(entries) = listeners.get_mut(key) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                listeners.remove(key);
            }
        }
    }

    fn remove_subscriber(&self, id: u64) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    /// Fire key-scoped listeners; returns how many panicked
    fn notify_key(&self, key: &str, value: &Value) -> usize {
        // Listeners added while firing wait for the next mutation
        let entries = self
            .inner
            .listeners
            .read()
            .get(key)
            .cloned()
            .unwrap_or_default();

        let mut failures = 0;
        for entry in entries {
            match entry.listener {
                KeyListener::Change(callback) => {
                    if !run_guarded(key, || callback(value)) {
                        failures += 1;
                    }
                }
                KeyListener::Waiter(waiter) => {
                    if !strict_eq(value, &waiter.expected) {
                        continue;
                    }
                    let Some(callback) = waiter.callback.lock().take() else {
                        continue;
                    };
                    self.remove_listener(key, entry.id);
                    if !run_guarded(key, move || callback(value)) {
                        failures += 1;
                    }
                }
            }
        }
        failures
    }

    fn notify_subscribers(&self, key: &str) -> usize {
        let subscribers: Vec<SubscriberFn> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();

        let mut failures = 0;
        for subscriber in subscribers {
            if !run_guarded(key, || subscriber()) {
                failures += 1;
            }
        }
        failures
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state", &*self.inner.state.read())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Run one callback inside its own panic boundary
fn run_guarded(key: &str, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(key, %reason, "State listener panicked");
            false
        }
    }
}

/// Handle returned by [`Store::subscribe`]
///
/// Dropping it keeps the subscription alive; call [`unsubscribe`](Self::unsubscribe).
pub struct Subscription {
    id: u64,
    store: WeakStore,
}

impl Subscription {
    /// Remove the subscriber. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(store) = self.store.upgrade() {
            if store.remove_subscriber(self.id) {
                trace!(id = self.id, "Subscriber removed");
            }
        }
    }
}

/// Deferred result of [`Store::when_value_is`]
#[must_use = "nothing is registered until `then` or `wait` is called"]
pub struct WhenValue {
    store: Store,
    key: String,
    expected: Value,
}

impl WhenValue {
    /// Run `callback` once the key holds the expected value.
    ///
    /// Fires immediately, before returning, when it already does. Otherwise
    /// a waiter is registered; it has no timeout and stays registered until
    /// matched.
    pub fn then<F>(self, callback: F)
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        let store = self.store;
        let immediate = {
            // Check and register atomically with respect to other mutations
            let _serial = store.inner.mutation_lock.lock();
            match store.get(&self.key) {
                Some(current) if strict_eq(&current, &self.expected) => Some((current, callback)),
                current => {
                    if current.is_none() {
                        warn!(key = %self.key, "Waiting on a key that is not in the state");
                    }
                    let waiter = Waiter {
                        expected: self.expected,
                        callback: Mutex::new(Some(Box::new(callback))),
                    };
                    store.push_listener(&self.key, KeyListener::Waiter(Arc::new(waiter)));
                    None
                }
            }
        };

        if let Some((current, callback)) = immediate {
            callback(&current);
        }
    }

    /// Async form of [`then`](Self::then). Resolves to the matched value, or
    /// `None` if the store is dropped first.
    ///
    /// The waiter is registered when `wait` is called, not on first poll, so
    /// a match that happens before the future is awaited is still observed.
    pub fn wait(self) -> impl Future<Output = Option<Value>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.then(move |value| {
            let _ = tx.send(value.clone());
        });
        async move { rx.await.ok() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn make_store() -> Store {
        let initial = json!({"count": 0, "tags": ["a"], "active": false});
        match initial {
            Value::Object(map) => Store::new(map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_mutate_replace_and_compute() {
        let store = make_store();

        store.mutate("active", json!(true)).unwrap();
        store
            .mutate("count", Update::compute(|v| json!(v.as_i64().unwrap() + 2)))
            .unwrap();

        assert_eq!(store.get("active"), Some(json!(true)));
        assert_eq!(store.get("count"), Some(json!(2)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let store = make_store();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        store.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = store.mutate("missing", json!(1)).unwrap_err();
        assert_eq!(err.key(), "missing");
        assert!(matches!(err, StoreError::UnknownKey { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!store.contains_key("missing"));
    }

    #[test]
    fn test_listener_order_key_then_global() {
        let store = make_store();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        store.on_state_change("count", move |_| l.lock().push("A"));
        let l = log.clone();
        store.subscribe(move || l.lock().push("global"));
        let l = log.clone();
        store.on_state_change("count", move |_| l.lock().push("B"));

        store.mutate("count", json!(1)).unwrap();
        assert_eq!(*log.lock(), vec!["A", "B", "global"]);
    }

    #[test]
    fn test_listener_fires_without_equality_check() {
        let store = make_store();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        store.on_state_change("active", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.mutate("active", json!(false)).unwrap();
        store.mutate("active", json!(false)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_reads_back_updated_state() {
        let store = make_store();
        let seen = Arc::new(Mutex::new(None));

        let reader = store.clone();
        let slot = seen.clone();
        store.on_state_change("count", move |value| {
            *slot.lock() = Some((value.clone(), reader.get("count")));
        });

        store.mutate("count", json!(9)).unwrap();
        assert_eq!(*seen.lock(), Some((json!(9), Some(json!(9)))));
    }

    #[test]
    fn test_listener_may_mutate_reentrantly() {
        let store = make_store();
        let writer = store.clone();
        store.on_state_change("count", move |value| {
            if value.as_i64() == Some(1) {
                writer.mutate("active", json!(true)).unwrap();
            }
        });

        store.mutate("count", json!(1)).unwrap();
        assert_eq!(store.get("active"), Some(json!(true)));
    }

    #[test]
    fn test_when_value_is_fires_immediately() {
        let store = make_store();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        store.when_value_is("count", 0).then(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.listener_count("count"), 0);
    }

    #[test]
    fn test_when_value_is_one_shot() {
        let store = make_store();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        store.when_value_is("count", 3).then(move |value| {
            assert_eq!(value, &json!(3));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(store.listener_count("count"), 1);

        store.mutate("count", json!(2)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        store.mutate("count", json!(3)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.listener_count("count"), 0);

        store.mutate("count", json!(0)).unwrap();
        store.mutate("count", json!(3)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiter_keeps_registration_order_with_listeners() {
        let store = make_store();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        store.on_state_change("active", move |_| l.lock().push("first"));
        let l = log.clone();
        store
            .when_value_is("active", true)
            .then(move |_| l.lock().push("waiter"));
        let l = log.clone();
        store.on_state_change("active", move |_| l.lock().push("last"));

        store.mutate("active", json!(true)).unwrap();
        assert_eq!(*log.lock(), vec!["first", "waiter", "last"]);
    }

    #[test]
    fn test_unmatched_waiter_stays_registered() {
        let store = make_store();
        store.when_value_is("count", 100).then(|_| {});
        store.mutate("count", json!(1)).unwrap();
        assert_eq!(store.listener_count("count"), 1);
    }

    #[tokio::test]
    async fn test_when_value_is_wait() {
        let store = make_store();
        let waiter = tokio::spawn(store.when_value_is("active", true).wait());

        tokio::task::yield_now().await;
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            writer.mutate("active", json!(true)).unwrap();
        });

        let value = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
        assert_eq!(value, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_wait_registers_before_first_poll() {
        let store = make_store();
        let matched = store.when_value_is("active", true).wait();
        assert_eq!(store.listener_count("active"), 1);

        // Value passes through the expected state before anyone awaits
        store.mutate("active", json!(true)).unwrap();
        store.mutate("active", json!(false)).unwrap();
        assert_eq!(store.listener_count("active"), 0);

        let value = tokio::time::timeout(std::time::Duration::from_millis(500), matched)
            .await
            .expect("waiter missed the transient match");
        assert_eq!(value, Some(json!(true)));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let store = make_store();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let first = store.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = calls.clone();
        let _second = store.subscribe(move || {
            counter.fetch_add(10, Ordering::SeqCst);
        });

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(store.subscriber_count(), 1);

        store.mutate("count", json!(1)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let store = make_store();
        let calls = Arc::new(AtomicUsize::new(0));

        store.on_state_change("count", |_| panic!("listener failure"));
        let counter = calls.clone();
        store.on_state_change("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = calls.clone();
        store.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = store.mutate("count", json!(4)).unwrap_err();
        assert_eq!(
            err,
            StoreError::ListenerPanicked {
                key: "count".to_string(),
                failures: 1,
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get("count"), Some(json!(4)));
    }

    #[test]
    fn test_dispatchers_route_through_store() {
        let store = make_store();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let log = changes.clone();
        store.on_state_change("tags", move |value| log.lock().push(value.clone()));

        let dispatchers = store.dispatchers();
        assert_eq!(dispatchers.len(), 3);
        dispatchers["tags"].as_sequence().unwrap().push("b").unwrap();
        dispatchers["count"].as_number().unwrap().increment_by(5).unwrap();

        assert_eq!(*changes.lock(), vec![json!(["a", "b"])]);
        assert_eq!(store.get("count"), Some(json!(5)));
        assert_eq!(
            store.dispatcher("active").map(|d| d.kind()),
            Some(FieldKind::Scalar)
        );
        assert!(store.dispatcher("missing").is_none());
    }

    #[test]
    fn test_snapshot_order_preserved() {
        let store = make_store();
        store.mutate("count", json!(1)).unwrap();
        assert_eq!(store.keys(), vec!["count", "tags", "active"]);
    }

    #[test]
    fn test_concurrent_increments_are_serialized() {
        let store = make_store();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = store.dispatcher("count").unwrap();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        counter.as_number().unwrap().increment().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("count"), Some(json!(800)));
    }
}
