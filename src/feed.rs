//! Entity state notifications from the home-automation side.
//!
//! The platform owns entities and their states; devices that mirror an
//! entity subscribe here by entity id and get every change delivered.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub entity_id: String,
    pub old_state: Option<String>,
    /// `None` when the entity was removed.
    pub new_state: Option<String>,
}

impl StateChange {
    pub fn new(entity_id: impl Into<String>, new_state: Option<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            old_state: None,
            new_state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Default)]
pub struct StateFeed {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<String, Vec<(SubscriptionId, StateListener)>>>,
    // last published state per entity, to fill in `old_state`
    states: RwLock<HashMap<String, Option<String>>>,
}

impl StateFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        entity_id: &str,
        listener: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(entity_id.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        tracing::debug!(entity_id, "Subscribed to state changes");
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let mut found = false;
        listeners.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|(sub, _)| *sub != id);
            found |= subscribers.len() != before;
            !subscribers.is_empty()
        });
        found
    }

    /// Record a new state for `entity_id` and notify its subscribers.
    /// Returns the number of listeners called.
    pub fn publish(&self, entity_id: &str, new_state: Option<String>) -> usize {
        let old_state = self
            .states
            .write()
            .insert(entity_id.to_string(), new_state.clone())
            .flatten();
        self.dispatch(&StateChange {
            entity_id: entity_id.to_string(),
            old_state,
            new_state,
        })
    }

    /// Deliver a fully formed change. Listeners run without any feed lock held.
    pub fn dispatch(&self, change: &StateChange) -> usize {
        let subscribers: Vec<StateListener> = self
            .listeners
            .read()
            .get(&change.entity_id)
            .map(|subs| subs.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in &subscribers {
            listener(change);
        }
        subscribers.len()
    }

    pub fn state(&self, entity_id: &str) -> Option<String> {
        self.states.read().get(entity_id).cloned().flatten()
    }
}
