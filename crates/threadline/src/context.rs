//! Parent conversation → most recently active sub-conversation.
//!
//! Updated by inbound traffic and read by the routing resolver. Entries live
//! for the process lifetime only; the map is bounded and evicts the least
//! recently updated parent when full.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct ContextEntry {
    sub_id: String,
    /// Monotonic update sequence, higher is newer.
    updated_at: u64,
}

#[derive(Debug)]
pub struct ContextStore {
    entries: DashMap<String, ContextEntry>,
    capacity: usize,
    clock: AtomicU64,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl ContextStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    /// Record `sub_id` as the active sub-conversation of `parent_id`. Last writer wins.
    pub fn update(&self, parent_id: &str, sub_id: &str) {
        let updated_at = self.clock.fetch_add(1, Ordering::Relaxed);
        let previous = self.entries.insert(
            parent_id.to_string(),
            ContextEntry {
                sub_id: sub_id.to_string(),
                updated_at,
            },
        );
        if previous.is_none() && self.entries.len() > self.capacity {
            self.evict_oldest();
        }
    }

    /// Forget the mapping for `parent_id`, returning what it pointed at.
    pub fn clear(&self, parent_id: &str) -> Option<String> {
        self.entries.remove(parent_id).map(|(_, entry)| entry.sub_id)
    }

    pub fn get(&self, parent_id: &str) -> Option<String> {
        self.entries.get(parent_id).map(|entry| entry.sub_id.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        // Collect the key first; removing while iterating would deadlock the shard.
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().updated_at)
            .map(|entry| entry.key().clone());
        if let Some(parent_id) = oldest {
            self.entries.remove(&parent_id);
            debug!(parent_id = %parent_id, "Evicted oldest context entry");
        }
    }
}
