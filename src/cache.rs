//! Time-bounded cache for record processors.
//!
//! Values are scoped per workflow (or queue) and expire against an injected
//! clock, so one workflow's entries never serve another and expiry is
//! testable. The hook processor keeps the payloads it accepted here.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Slot<V> {
    value: V,
    stored_at: DateTime<Utc>,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<(String, K), Slot<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The cached value for `key` in `workflow`, unless it has expired.
    pub fn get(&self, workflow: &str, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot_key = (workflow.to_string(), key.clone());

        let fresh = slots
            .get(&slot_key)
            .map(|slot| self.is_fresh(slot.stored_at, now))?;
        if fresh {
            slots.get(&slot_key).map(|slot| slot.value.clone())
        } else {
            slots.remove(&slot_key);
            None
        }
    }

    pub fn insert(&self, workflow: &str, key: K, value: V) {
        let stored_at = self.clock.now();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert((workflow.to_string(), key), Slot { value, stored_at });
    }

    pub fn invalidate(&self, workflow: &str, key: &K) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&(workflow.to_string(), key.clone()));
    }

    fn is_fresh(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - stored_at).to_std().unwrap_or_default() < self.ttl
    }
}
