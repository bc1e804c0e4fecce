use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::request::StoreId;

/// Why a fetch was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// The caller asked for a new or changed request.
    RequestChange,
    /// The underlying store was mutated and cached data was dropped.
    StoreMutation,
}

/// Payload delivered to store listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub store_id: StoreId,
    pub trigger: Trigger,
}

/// Callback invoked when a store mutates. Compared by `Arc` identity.
pub type Listener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

/// Per-store registry of mutation listeners.
#[derive(Default)]
pub struct Subscriber {
    listeners: DashMap<StoreId, Vec<Listener>>,
}

impl Subscriber {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invokes every listener registered for `store_id`.
    ///
    /// Listeners run after the registry lock is released, so they may add or
    /// remove listeners themselves.
    pub fn notify(&self, store_id: &str) {
        let listeners = self
            .listeners
            .get(store_id)
            .map(|listeners| listeners.clone())
            .unwrap_or_default();

        tracing::debug!(store_id, listeners = listeners.len(), "notifying store change");

        let change = StoreChange {
            store_id: store_id.to_owned(),
            trigger: Trigger::StoreMutation,
        };
        for listener in &listeners {
            listener(&change);
        }
    }

    pub fn add_listener(&self, store_id: &str, listener: Listener) {
        self.listeners
            .entry(store_id.to_owned())
            .or_default()
            .push(listener);
    }

    /// Removes `listener` from `store_id`. Unknown listeners are ignored.
    pub fn remove_listener(&self, store_id: &str, listener: &Listener) {
        if let Some(mut listeners) = self.listeners.get_mut(store_id) {
            listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        }
    }

    pub fn listener_count(&self, store_id: &str) -> usize {
        self.listeners.get(store_id).map_or(0, |listeners| listeners.len())
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("stores", &self.listeners.len())
            .finish()
    }
}
