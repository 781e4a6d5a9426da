use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::{watch, Mutex};

use crate::descriptor::RingDescriptor;
use crate::Error;

/// A descriptor snapshot together with the store version that committed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub version: u64,
    pub descriptor: RingDescriptor,
}

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write committed at this version.
    Committed(u64),
    /// The stored version no longer matches; re-read and retry.
    Conflict,
}

/// Client contract for the shared coordination store holding the ring
/// descriptor.
///
/// The store is the single source of truth; everything held locally is a
/// read-only cache of it. Writers never hold locks across instances: lost
/// updates are prevented by the version check in [`KvStore::cas`].
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Latest committed descriptor for `key`, or `None` if never written.
    async fn get(&self, key: &str) -> Result<Option<Versioned>, Error>;

    /// Conditional write. `expected_version: None` means "create only if
    /// absent". Returns [`CasOutcome::Conflict`] when the stored version has
    /// moved on; that is routine, not an error.
    async fn cas(
        &self,
        key: &str,
        expected_version: Option<u64>,
        descriptor: &RingDescriptor,
    ) -> Result<CasOutcome, Error>;

    /// Infinite stream of committed snapshots for `key`. Intermediate values
    /// may be coalesced; the latest committed value is always delivered.
    /// Cancel by dropping the stream.
    async fn watch(&self, key: &str) -> BoxStream<'static, Versioned>;
}

struct Slot {
    version: u64,
    raw: Vec<u8>,
    tx: watch::Sender<Option<Versioned>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            version: 0,
            raw: Vec::new(),
            tx,
        }
    }
}

/// In-process [`KvStore`] used by tests and single-process deployments.
///
/// Values are held serialized so the store behaves like the remote one it
/// stands in for: what comes back out is what round-tripped the codec, not a
/// shared pointer.
#[derive(Clone, Default)]
pub struct MemoryStore {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, Error> {
        let slots = self.slots.lock().await;
        match slots.get(key) {
            Some(slot) if slot.version > 0 => {
                let descriptor = serde_json::from_slice(&slot.raw)?;
                Ok(Some(Versioned {
                    version: slot.version,
                    descriptor,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn cas(
        &self,
        key: &str,
        expected_version: Option<u64>,
        descriptor: &RingDescriptor,
    ) -> Result<CasOutcome, Error> {
        let raw = serde_json::to_vec(descriptor)?;
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(key.to_string()).or_insert_with(Slot::new);

        let current = (slot.version > 0).then_some(slot.version);
        if current != expected_version {
            return Ok(CasOutcome::Conflict);
        }

        slot.version += 1;
        slot.raw = raw;
        slot.tx.send_replace(Some(Versioned {
            version: slot.version,
            descriptor: descriptor.clone(),
        }));
        Ok(CasOutcome::Committed(slot.version))
    }

    async fn watch(&self, key: &str) -> BoxStream<'static, Versioned> {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(key.to_string()).or_insert_with(Slot::new);
        let rx = slot.tx.subscribe();
        let initial = rx.borrow().clone();
        drop(slots);

        Box::pin(futures_util::stream::unfold(
            (rx, initial),
            |(mut rx, pending)| async move {
                if let Some(v) = pending {
                    return Some((v, (rx, None)));
                }
                loop {
                    // Err means the store itself was dropped; end the stream.
                    if rx.changed().await.is_err() {
                        return None;
                    }
                    let latest = rx.borrow_and_update().clone();
                    if let Some(v) = latest {
                        return Some((v, (rx, None)));
                    }
                }
            },
        ))
    }
}
