use std::collections::{BTreeMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Lifecycle state an instance publishes about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Joining,
    Active,
    Leaving,
    Left,
}

/// One instance's published membership record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub id: String,
    pub address: String,
    pub state: InstanceState,
    /// Ring positions owned by this instance. Sorted, drawn once at first
    /// registration, stable across heartbeats.
    pub tokens: Vec<u64>,
    /// Unix milliseconds of first registration.
    pub registered_at: u64,
    /// Unix milliseconds of the most recent successful write.
    pub heartbeat_at: u64,
}

impl InstanceEntry {
    /// A freshly created entry, before the register delegates have run.
    pub fn joining(id: &str, address: &str) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: id.to_string(),
            address: address.to_string(),
            state: InstanceState::Joining,
            tokens: Vec::new(),
            registered_at: now,
            heartbeat_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == InstanceState::Active
    }

    pub fn heartbeat_age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.heartbeat_at)
    }
}

/// All known instances, keyed by instance id.
///
/// A descriptor is read-only once constructed; every observed change replaces
/// the whole value. Token sets of `Active` instances are pairwise disjoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RingDescriptor {
    pub instances: BTreeMap<String, InstanceEntry>,
}

impl RingDescriptor {
    pub fn get(&self, id: &str) -> Option<&InstanceEntry> {
        self.instances.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut InstanceEntry> {
        self.instances.get_mut(id)
    }

    pub fn insert(&mut self, entry: InstanceEntry) {
        self.instances.insert(entry.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<InstanceEntry> {
        self.instances.remove(id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn active(&self) -> impl Iterator<Item = &InstanceEntry> {
        self.instances.values().filter(|e| e.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn active_ids(&self) -> HashSet<String> {
        self.active().map(|e| e.id.clone()).collect()
    }

    /// Tokens owned by any registered instance, regardless of state. New
    /// draws avoid this whole set so an activating `Joining` peer can never
    /// end up sharing a position with anyone.
    pub fn taken_tokens(&self) -> HashSet<u64> {
        self.instances
            .values()
            .flat_map(|e| e.tokens.iter().copied())
            .collect()
    }
}

pub(crate) fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
