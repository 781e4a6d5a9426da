use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::descriptor::RingDescriptor;

/// An owning instance, as returned from a ring read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub id: String,
    pub address: String,
}

/// Precomputed view of one descriptor generation: the sorted token ring over
/// `Active` instances. Immutable; rebuilt wholesale on every change.
#[derive(Debug)]
struct RingSnapshot {
    descriptor: Arc<RingDescriptor>,
    members: Vec<Owner>,
    /// Sorted by token; the second field indexes into `members`.
    tokens: Vec<(u64, usize)>,
}

impl RingSnapshot {
    fn build(descriptor: RingDescriptor) -> Self {
        let mut members = Vec::new();
        let mut tokens = Vec::new();
        for entry in descriptor.active() {
            let idx = members.len();
            members.push(Owner {
                id: entry.id.clone(),
                address: entry.address.clone(),
            });
            tokens.extend(entry.tokens.iter().map(|&t| (t, idx)));
        }
        tokens.sort_unstable_by_key(|&(t, _)| t);
        Self {
            descriptor: Arc::new(descriptor),
            members,
            tokens,
        }
    }
}

/// Consistent hash ring over the latest descriptor snapshot.
///
/// Cheap to clone and share across request handlers: every read is a
/// lock-free atomic pointer load, so lookups never block the heartbeat loop
/// or each other.
#[derive(Clone)]
pub struct HashRing {
    shared: Arc<ArcSwap<RingSnapshot>>,
}

impl HashRing {
    pub fn new(descriptor: RingDescriptor) -> Self {
        Self {
            shared: Arc::new(ArcSwap::from_pointee(RingSnapshot::build(descriptor))),
        }
    }

    pub(crate) fn update(&self, descriptor: RingDescriptor) {
        self.shared.store(Arc::new(RingSnapshot::build(descriptor)));
    }

    /// The instances owning `key`, in ring order, at most `replication_factor`
    /// of them and all distinct.
    ///
    /// Walks clockwise from the first token at or after the key's hash,
    /// collecting each token's owner once. With fewer than
    /// `replication_factor` active instances the result is partial; an empty
    /// ring yields an empty vec. Neither case is an error: callers decide
    /// what "no owner available" means for them.
    pub fn get(&self, key: &str, replication_factor: usize) -> Vec<Owner> {
        let snapshot = self.shared.load();
        if snapshot.tokens.is_empty() || replication_factor == 0 {
            return Vec::new();
        }

        let hash = hash_key(key);
        let start = snapshot.tokens.partition_point(|&(t, _)| t < hash);

        let mut owners = Vec::with_capacity(replication_factor.min(snapshot.members.len()));
        let mut seen = vec![false; snapshot.members.len()];
        for step in 0..snapshot.tokens.len() {
            let (_, idx) = snapshot.tokens[(start + step) % snapshot.tokens.len()];
            if seen[idx] {
                continue;
            }
            seen[idx] = true;
            owners.push(snapshot.members[idx].clone());
            if owners.len() == replication_factor {
                break;
            }
        }
        owners
    }

    /// Whether `instance_id` is among the owners of `key`.
    pub fn is_owner(&self, key: &str, instance_id: &str, replication_factor: usize) -> bool {
        self.get(key, replication_factor)
            .iter()
            .any(|o| o.id == instance_id)
    }

    /// Number of `Active` instances in the current snapshot.
    pub fn instance_count(&self) -> usize {
        self.shared.load().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.load().members.is_empty()
    }

    /// The descriptor backing the current snapshot.
    pub fn descriptor(&self) -> Arc<RingDescriptor> {
        self.shared.load().descriptor.clone()
    }
}

#[inline]
fn hash_key(key: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in key.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
