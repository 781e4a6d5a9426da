use std::collections::BTreeSet;
use std::time::Duration;

use crate::descriptor::{InstanceEntry, InstanceState, RingDescriptor};
use crate::Error;

/// Total draw budget per token when generating a token set. With 64-bit
/// tokens the first draw virtually always lands; the budget exists so a
/// pathological store state fails registration instead of spinning.
const TOKEN_DRAW_ATTEMPTS_PER_TOKEN: usize = 16;

/// A lifecycle policy, invoked by [`InstanceLifecycle`] at well-defined
/// points. All hooks default to no-ops so policies implement only what they
/// care about.
///
/// [`InstanceLifecycle`]: crate::InstanceLifecycle
pub trait LifecycleDelegate: Send + Sync {
    /// Runs while the first registration write is being prepared. `entry` is
    /// this instance's own entry, not yet inserted into `descriptor`.
    fn on_register(
        &self,
        _descriptor: &RingDescriptor,
        _entry: &mut InstanceEntry,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Runs on every heartbeat cycle, after this instance's own timestamp has
    /// been refreshed and before the descriptor is written back.
    fn on_heartbeat(&self, _descriptor: &mut RingDescriptor, _own_id: &str, _now_ms: u64) {}

    /// Runs while the departure write is being prepared.
    fn on_stop(&self, _descriptor: &mut RingDescriptor, _own_id: &str) {}
}

/// Ordered list of policies sharing the hook interface, invoked in sequence.
/// Any subset composes; there is no base policy.
#[derive(Default)]
pub struct DelegateChain {
    delegates: Vec<Box<dyn LifecycleDelegate>>,
}

impl DelegateChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, delegate: impl LifecycleDelegate + 'static) -> Self {
        self.delegates.push(Box::new(delegate));
        self
    }

    /// The production chain, in its fixed order: token assignment,
    /// leave-on-stop, auto-forget.
    pub fn standard(token_count: usize, forget_after: Duration) -> Self {
        Self::new()
            .with(TokenRegisterDelegate::new(token_count))
            .with(LeaveOnStopDelegate)
            .with(AutoForgetDelegate::new(forget_after))
    }

    pub(crate) fn on_register(
        &self,
        descriptor: &RingDescriptor,
        entry: &mut InstanceEntry,
    ) -> Result<(), Error> {
        for delegate in &self.delegates {
            delegate.on_register(descriptor, entry)?;
        }
        Ok(())
    }

    pub(crate) fn on_heartbeat(&self, descriptor: &mut RingDescriptor, own_id: &str, now_ms: u64) {
        for delegate in &self.delegates {
            delegate.on_heartbeat(descriptor, own_id, now_ms);
        }
    }

    pub(crate) fn on_stop(&self, descriptor: &mut RingDescriptor, own_id: &str) {
        for delegate in &self.delegates {
            delegate.on_stop(descriptor, own_id);
        }
    }
}

/// Draws this instance's token set at first registration and marks it
/// `Active` immediately: there is no separate readiness signal, so an
/// instance that registered is an instance that serves.
///
/// An entry that already carries tokens (same-id restart) keeps them, so the
/// keyspace mapping survives a crash-restart.
pub struct TokenRegisterDelegate {
    token_count: usize,
}

impl TokenRegisterDelegate {
    pub fn new(token_count: usize) -> Self {
        Self { token_count }
    }
}

impl LifecycleDelegate for TokenRegisterDelegate {
    fn on_register(
        &self,
        descriptor: &RingDescriptor,
        entry: &mut InstanceEntry,
    ) -> Result<(), Error> {
        if entry.tokens.is_empty() {
            entry.tokens = draw_tokens(self.token_count, descriptor)?;
            tracing::info!(
                id = %entry.id,
                tokens = entry.tokens.len(),
                "Assigned token set"
            );
        } else {
            tracing::info!(
                id = %entry.id,
                tokens = entry.tokens.len(),
                "Keeping token set from previous registration"
            );
        }
        entry.state = InstanceState::Active;
        Ok(())
    }
}

fn draw_tokens(count: usize, descriptor: &RingDescriptor) -> Result<Vec<u64>, Error> {
    let taken = descriptor.taken_tokens();
    let budget = count.saturating_mul(TOKEN_DRAW_ATTEMPTS_PER_TOKEN);
    let mut tokens = BTreeSet::new();
    let mut attempts = 0;
    while tokens.len() < count {
        if attempts == budget {
            return Err(Error::TokenGeneration { attempts });
        }
        attempts += 1;
        let candidate = rand::random::<u64>();
        if taken.contains(&candidate) {
            continue;
        }
        tokens.insert(candidate);
    }
    Ok(tokens.into_iter().collect())
}

/// Removes this instance's own entry the moment it asks to leave, so the
/// ring stops routing to a gracefully-stopping instance immediately instead
/// of after a heartbeat timeout.
pub struct LeaveOnStopDelegate;

impl LifecycleDelegate for LeaveOnStopDelegate {
    fn on_stop(&self, descriptor: &mut RingDescriptor, own_id: &str) {
        if descriptor.remove(own_id).is_some() {
            tracing::info!(id = %own_id, "Removed own entry on stop");
        }
    }
}

/// Evicts peers whose heartbeat has gone stale.
///
/// Every instance runs this scan on its own heartbeat cycle, over the full
/// descriptor: dead instances are reclaimed by whichever survivor writes
/// first, with no central authority. The scanning instance never evicts its
/// own entry.
pub struct AutoForgetDelegate {
    forget_after: Duration,
}

impl AutoForgetDelegate {
    pub fn new(forget_after: Duration) -> Self {
        Self { forget_after }
    }
}

impl LifecycleDelegate for AutoForgetDelegate {
    fn on_heartbeat(&self, descriptor: &mut RingDescriptor, own_id: &str, now_ms: u64) {
        let threshold_ms = self.forget_after.as_millis() as u64;
        let stale: Vec<String> = descriptor
            .instances
            .values()
            .filter(|e| e.id != own_id && e.heartbeat_age_ms(now_ms) > threshold_ms)
            .map(|e| e.id.clone())
            .collect();
        for id in stale {
            descriptor.remove(&id);
            tracing::warn!(
                id = %id,
                forget_after_secs = self.forget_after.as_secs(),
                "Forgot instance with stale heartbeat"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, tokens: Vec<u64>, heartbeat_at: u64) -> InstanceEntry {
        InstanceEntry {
            id: id.to_string(),
            address: format!("{id}:9000"),
            state: InstanceState::Active,
            tokens,
            registered_at: 0,
            heartbeat_at,
        }
    }

    #[test]
    fn test_register_assigns_requested_token_count() {
        let mut descriptor = RingDescriptor::default();
        descriptor.insert(entry("peer", vec![1, 2, 3], 0));

        let mut joining = InstanceEntry::joining("me", "127.0.0.1:9000");
        TokenRegisterDelegate::new(128)
            .on_register(&descriptor, &mut joining)
            .unwrap();

        assert_eq!(joining.tokens.len(), 128);
        assert_eq!(joining.state, InstanceState::Active);
    }

    #[test]
    fn test_register_tokens_are_sorted_and_disjoint_from_peers() {
        let mut descriptor = RingDescriptor::default();
        descriptor.insert(entry("peer", vec![1, 2, 3], 0));

        let mut joining = InstanceEntry::joining("me", "127.0.0.1:9000");
        TokenRegisterDelegate::new(64)
            .on_register(&descriptor, &mut joining)
            .unwrap();

        assert!(joining.tokens.windows(2).all(|w| w[0] < w[1]));
        let taken = descriptor.taken_tokens();
        assert!(joining.tokens.iter().all(|t| !taken.contains(t)));
    }

    #[test]
    fn test_register_keeps_tokens_on_restart() {
        let descriptor = RingDescriptor::default();
        let mut restarting = entry("me", vec![10, 20, 30], 0);
        restarting.state = InstanceState::Joining;

        TokenRegisterDelegate::new(128)
            .on_register(&descriptor, &mut restarting)
            .unwrap();

        assert_eq!(restarting.tokens, vec![10, 20, 30]);
        assert_eq!(restarting.state, InstanceState::Active);
    }

    #[test]
    fn test_leave_on_stop_removes_own_entry_only() {
        let mut descriptor = RingDescriptor::default();
        descriptor.insert(entry("me", vec![1], 0));
        descriptor.insert(entry("peer", vec![2], 0));

        LeaveOnStopDelegate.on_stop(&mut descriptor, "me");

        assert!(descriptor.get("me").is_none());
        assert!(descriptor.get("peer").is_some());
    }

    #[test]
    fn test_auto_forget_evicts_only_stale_peers() {
        let now = 100_000;
        let mut descriptor = RingDescriptor::default();
        descriptor.insert(entry("me", vec![1], 0)); // own entry, arbitrarily stale
        descriptor.insert(entry("dead", vec![2], now - 61_000));
        descriptor.insert(entry("alive", vec![3], now - 1_000));

        AutoForgetDelegate::new(Duration::from_secs(60)).on_heartbeat(&mut descriptor, "me", now);

        assert!(descriptor.get("me").is_some(), "never forgets itself");
        assert!(descriptor.get("dead").is_none());
        assert!(descriptor.get("alive").is_some());
    }

    #[test]
    fn test_auto_forget_threshold_is_exclusive() {
        let now = 100_000;
        let mut descriptor = RingDescriptor::default();
        descriptor.insert(entry("edge", vec![1], now - 60_000));

        AutoForgetDelegate::new(Duration::from_secs(60)).on_heartbeat(&mut descriptor, "me", now);

        assert!(
            descriptor.get("edge").is_some(),
            "exactly-at-threshold is not yet stale"
        );
    }

    #[test]
    fn test_standard_chain_runs_policies_in_order() {
        let now = 100_000;
        let chain = DelegateChain::standard(32, Duration::from_secs(60));

        let mut descriptor = RingDescriptor::default();
        descriptor.insert(entry("dead", vec![1], now - 120_000));

        let mut joining = InstanceEntry::joining("me", "127.0.0.1:9000");
        chain.on_register(&descriptor, &mut joining).unwrap();
        assert_eq!(joining.tokens.len(), 32);
        assert_eq!(joining.state, InstanceState::Active);

        descriptor.insert(joining);
        chain.on_heartbeat(&mut descriptor, "me", now);
        assert!(descriptor.get("dead").is_none());
        assert!(descriptor.get("me").is_some());

        chain.on_stop(&mut descriptor, "me");
        assert!(descriptor.get("me").is_none());
    }
}
