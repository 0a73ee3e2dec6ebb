//! Observable state owned by a single component instance.
//!
//! A `StateCell` holds the most recent value and replays it to every new
//! subscriber ("behavior" semantics). There is no buffering: subscribers only
//! ever see the latest value at the moment they are notified.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::{FlowError, Result};
use crate::types::Value;

/// Callback invoked with the current value of a cell.
pub type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by `StateCell::subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// A single mutable value with last-value retrieval and change subscription.
///
/// Subscribers run synchronously, in subscription order, on the thread that
/// calls `update`. They are called from a snapshot with no lock on the
/// subscriber list held, so a callback may read the cell and subscribe or
/// unsubscribe on it. Updates are serialized: a callback must not update
/// the cell it is subscribed to.
pub struct StateCell<T> {
    key: String,
    value: watch::Sender<T>,
    subscribers: Mutex<Vec<(Subscription, Subscriber<T>)>>,
    updates: Mutex<()>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> StateCell<T> {
    pub fn new(key: impl Into<String>, initial: T) -> Self {
        let (value, _) = watch::channel(initial);
        Self {
            key: key.into(),
            value,
            subscribers: Mutex::new(Vec::new()),
            updates: Mutex::new(()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    /// Replace the value and notify subscribers in registration order.
    pub fn update(&self, value: T) {
        let _serial = self
            .updates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot: Vec<Subscriber<T>> = {
            let subscribers = self.lock_subscribers();
            self.value.send_replace(value.clone());
            subscribers.iter().map(|(_, callback)| callback.clone()).collect()
        };
        for callback in snapshot {
            callback(&value);
        }
    }

    /// Register a callback. It is invoked once immediately with the current
    /// value, then on every subsequent `update`.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Subscriber<T> = Arc::new(callback);
        let current = {
            let mut subscribers = self.lock_subscribers();
            subscribers.push((id, callback.clone()));
            self.get()
        };
        callback(&current);
        id
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut subscribers = self.lock_subscribers();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != subscription);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    /// An async receiver that always observes the latest value.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.value.subscribe()
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<(Subscription, Subscriber<T>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for StateCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCell")
            .field("key", &self.key)
            .field("value", &*self.value.borrow())
            .finish()
    }
}

/// Per-instance context handed to a component: its name and its state cells.
///
/// Each component instance owns exactly one context, so a component can
/// only reach its own state.
pub struct ComponentContext {
    name: String,
    cells: Mutex<HashMap<String, Arc<StateCell<Value>>>>,
}

impl ComponentContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the owning component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a cell, or return the existing one if `key` is already present.
    /// The initial value is ignored in the latter case.
    pub fn create_state(&self, key: &str, initial: Value) -> Arc<StateCell<Value>> {
        self.lock_cells()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(StateCell::new(key, initial)))
            .clone()
    }

    /// Look up a cell without creating it.
    pub fn get_state(&self, key: &str) -> Option<Arc<StateCell<Value>>> {
        self.lock_cells().get(key).cloned()
    }

    /// Current value of a cell, if it exists.
    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.get_state(key).map(|cell| cell.get())
    }

    /// Update an existing cell.
    ///
    /// Fails with `UnknownStateKey` if the key was never created; callers
    /// must `create_state` first.
    pub fn update_state(&self, key: &str, value: Value) -> Result<()> {
        let cell = self
            .get_state(key)
            .ok_or_else(|| FlowError::UnknownStateKey {
                component: self.name.clone(),
                key: key.to_string(),
            })?;
        cell.update(value);
        Ok(())
    }

    /// Keys of all cells, sorted.
    pub fn state_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock_cells().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock_cells(&self) -> MutexGuard<'_, HashMap<String, Arc<StateCell<Value>>>> {
        self.cells
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentContext")
            .field("name", &self.name)
            .field("state_keys", &self.state_keys())
            .finish()
    }
}
