use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RingConfig;
use crate::delegate::DelegateChain;
use crate::descriptor::{current_timestamp_ms, InstanceEntry, InstanceState, RingDescriptor};
use crate::kv::{CasOutcome, KvStore};
use crate::ring::HashRing;
use crate::Error;

/// Compare-and-swap attempts before initial registration gives up. Losing
/// this many races in a row at startup means the store is churning too hard
/// to join safely; failing is better than serving unregistered.
const REGISTER_CAS_RETRIES: usize = 8;

/// Compare-and-swap attempts within one heartbeat cycle. Exhausting them
/// skips the cycle; the next tick re-reads from scratch.
const HEARTBEAT_CAS_RETRIES: usize = 3;

/// Delay before resubscribing after the watch stream ends.
const WATCH_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Membership change event, broadcast after the local ring has been updated.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
}

/// This process's representation in the ring.
///
/// Registers the instance on start, keeps its entry fresh from a background
/// heartbeat task, mirrors every descriptor change into a shared ring
/// snapshot from a background watch task, and drives orderly departure on
/// [`stop`](Self::stop). It is the only writer of this instance's own entry.
pub struct InstanceLifecycle {
    config: RingConfig,
    store: Arc<dyn KvStore>,
    ring: HashRing,
    chain: Arc<DelegateChain>,
    state_tx: watch::Sender<InstanceState>,
    cancel_token: CancellationToken,
    heartbeat_handle: Option<JoinHandle<()>>,
    watch_handle: Option<JoinHandle<()>>,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl InstanceLifecycle {
    /// Register this instance and start the heartbeat and watch tasks, with
    /// the standard delegate chain built from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, token assignment
    /// exhausts its draw budget, or registration cannot win a
    /// compare-and-swap race. All are fatal: the process must not serve.
    pub async fn start(config: RingConfig, store: Arc<dyn KvStore>) -> Result<Self, Error> {
        let chain = DelegateChain::standard(config.token_count, config.forget_after);
        Self::start_with_chain(config, store, chain).await
    }

    /// Start with a custom delegate chain.
    ///
    /// # Errors
    ///
    /// As [`start`](Self::start).
    pub async fn start_with_chain(
        config: RingConfig,
        store: Arc<dyn KvStore>,
        chain: DelegateChain,
    ) -> Result<Self, Error> {
        config.validate()?;
        let chain = Arc::new(chain);

        let (descriptor, entry) = Self::register(&config, store.as_ref(), &chain).await?;
        let ring = HashRing::new(descriptor);

        let cancel_token = CancellationToken::new();
        let (event_tx, _) = broadcast::channel(16);
        let (state_tx, _) = watch::channel(InstanceState::Active);

        let heartbeat_handle = Self::spawn_heartbeat_task(
            config.clone(),
            store.clone(),
            ring.clone(),
            chain.clone(),
            entry,
            cancel_token.clone(),
        );
        let watch_handle = Self::spawn_watch_task(
            config.descriptor_key.clone(),
            store.clone(),
            ring.clone(),
            cancel_token.clone(),
            event_tx.clone(),
        );

        tracing::info!(
            id = %config.instance_id,
            address = %config.address(),
            "Instance registered and active"
        );

        Ok(Self {
            config,
            store,
            ring,
            chain,
            state_tx,
            cancel_token,
            heartbeat_handle: Some(heartbeat_handle),
            watch_handle: Some(watch_handle),
            event_tx,
        })
    }

    async fn register(
        config: &RingConfig,
        store: &dyn KvStore,
        chain: &DelegateChain,
    ) -> Result<(RingDescriptor, InstanceEntry), Error> {
        for _ in 0..REGISTER_CAS_RETRIES {
            let current = store.get(&config.descriptor_key).await?;
            let (mut descriptor, version) = match current {
                Some(v) => (v.descriptor, Some(v.version)),
                None => (RingDescriptor::default(), None),
            };

            let mut entry = match descriptor.get(&config.instance_id) {
                // Same-id restart: adopt the surviving entry so the token set
                // (and with it the keyspace mapping) is preserved.
                Some(existing) => {
                    let mut e = existing.clone();
                    e.address = config.address();
                    e.heartbeat_at = current_timestamp_ms();
                    e
                }
                None => InstanceEntry::joining(&config.instance_id, &config.address()),
            };
            chain.on_register(&descriptor, &mut entry)?;
            descriptor.insert(entry.clone());

            match store.cas(&config.descriptor_key, version, &descriptor).await? {
                CasOutcome::Committed(_) => return Ok((descriptor, entry)),
                CasOutcome::Conflict => {
                    tracing::debug!(
                        id = %config.instance_id,
                        "Registration write lost a race, retrying"
                    );
                }
            }
        }
        Err(Error::RegistrationContended {
            attempts: REGISTER_CAS_RETRIES,
        })
    }

    fn spawn_heartbeat_task(
        config: RingConfig,
        store: Arc<dyn KvStore>,
        ring: HashRing,
        chain: Arc<DelegateChain>,
        template: InstanceEntry,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.heartbeat_interval);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!("Heartbeat task shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        match Self::heartbeat_once(&config, store.as_ref(), &ring, &chain, &template).await {
                            Ok(()) => consecutive_failures = 0,
                            Err(e) => {
                                consecutive_failures += 1;
                                let backoff_ms = 100 * 2u64.pow(consecutive_failures.min(6));
                                tracing::error!(
                                    failures = consecutive_failures,
                                    backoff_ms,
                                    "Heartbeat failed: {}, backing off",
                                    e
                                );
                                tokio::select! {
                                    _ = cancel_token.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// One heartbeat cycle: refresh our own timestamp, let the delegates scan
    /// the descriptor, write it back under compare-and-swap.
    ///
    /// A conflict (a peer wrote between our read and our write) re-reads and
    /// retries; exhausting the retries skips the cycle, leaving the previous
    /// entry standing until the next interval. Only store I/O errors
    /// propagate to the caller's backoff.
    async fn heartbeat_once(
        config: &RingConfig,
        store: &dyn KvStore,
        ring: &HashRing,
        chain: &DelegateChain,
        template: &InstanceEntry,
    ) -> Result<(), Error> {
        for _ in 0..HEARTBEAT_CAS_RETRIES {
            let now = current_timestamp_ms();
            let current = store.get(&config.descriptor_key).await?;
            let (mut descriptor, version) = match current {
                Some(v) => (v.descriptor, Some(v.version)),
                None => (RingDescriptor::default(), None),
            };

            match descriptor.get_mut(&config.instance_id) {
                Some(entry) => entry.heartbeat_at = now,
                None => {
                    // A peer's auto-forget evicted us (or the descriptor
                    // vanished). Re-publish the registered entry with its
                    // original tokens.
                    tracing::warn!(
                        id = %config.instance_id,
                        "Own entry missing from descriptor, re-registering"
                    );
                    let mut entry = template.clone();
                    entry.heartbeat_at = now;
                    descriptor.insert(entry);
                }
            }
            chain.on_heartbeat(&mut descriptor, &config.instance_id, now);

            match store.cas(&config.descriptor_key, version, &descriptor).await? {
                CasOutcome::Committed(_) => {
                    ring.update(descriptor);
                    return Ok(());
                }
                CasOutcome::Conflict => continue,
            }
        }

        tracing::warn!(
            id = %config.instance_id,
            retries = HEARTBEAT_CAS_RETRIES,
            "Heartbeat lost every compare-and-swap race, skipping this cycle"
        );
        Ok(())
    }

    fn spawn_watch_task(
        key: String,
        store: Arc<dyn KvStore>,
        ring: HashRing,
        cancel_token: CancellationToken,
        event_tx: broadcast::Sender<MembershipEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut known: HashSet<String> = ring.descriptor().active_ids();

            'resubscribe: loop {
                let mut stream = store.watch(&key).await;
                loop {
                    tokio::select! {
                        _ = cancel_token.cancelled() => {
                            tracing::debug!("Watch task shutting down");
                            return;
                        }
                        item = stream.next() => {
                            match item {
                                Some(versioned) => {
                                    let current = versioned.descriptor.active_ids();
                                    for id in current.difference(&known) {
                                        tracing::debug!(id = %id, "Instance joined");
                                        let _ = event_tx.send(MembershipEvent::Joined(id.clone()));
                                    }
                                    for id in known.difference(&current) {
                                        tracing::debug!(id = %id, "Instance left");
                                        let _ = event_tx.send(MembershipEvent::Left(id.clone()));
                                    }
                                    known = current;
                                    ring.update(versioned.descriptor);
                                }
                                None => {
                                    tracing::warn!("Watch stream ended, resubscribing");
                                    tokio::select! {
                                        _ = cancel_token.cancelled() => return,
                                        _ = tokio::time::sleep(WATCH_RESUBSCRIBE_DELAY) => {}
                                    }
                                    continue 'resubscribe;
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Leave the ring and shut down, blocking at most `timeout` for the
    /// departure write.
    ///
    /// Background tasks are stopped first so a late heartbeat cannot
    /// re-publish the entry after it was removed. A departure that fails or
    /// times out is logged and otherwise ignored: peers reclaim this
    /// instance's capacity through auto-forget, and process exit must never
    /// hang on the store.
    pub async fn stop(mut self, timeout: Duration) -> Result<(), Error> {
        self.state_tx.send_replace(InstanceState::Leaving);
        tracing::info!(id = %self.config.instance_id, "Leaving the ring");

        self.cancel_token.cancel();
        if let Some(handle) = self.heartbeat_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.watch_handle.take() {
            let _ = handle.await;
        }

        match tokio::time::timeout(timeout, self.leave()).await {
            Ok(Ok(())) => {
                tracing::info!(id = %self.config.instance_id, "Departure complete");
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    id = %self.config.instance_id,
                    "Departure write failed: {}, peers will forget this instance",
                    e
                );
            }
            Err(_) => {
                tracing::warn!(
                    id = %self.config.instance_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Departure timed out, peers will forget this instance"
                );
            }
        }

        // The grace period has elapsed either way; locally this instance is
        // gone and exit must not hang on the store.
        self.state_tx.send_replace(InstanceState::Left);
        Ok(())
    }

    /// The departure write. Conflicts re-read and retry; the overall wait is
    /// bounded by the caller's timeout.
    async fn leave(&self) -> Result<(), Error> {
        loop {
            let Some(current) = self.store.get(&self.config.descriptor_key).await? else {
                return Ok(());
            };
            let mut descriptor = current.descriptor;
            self.chain.on_stop(&mut descriptor, &self.config.instance_id);

            match self
                .store
                .cas(&self.config.descriptor_key, Some(current.version), &descriptor)
                .await?
            {
                CasOutcome::Committed(_) => {
                    self.ring.update(descriptor);
                    return Ok(());
                }
                CasOutcome::Conflict => continue,
            }
        }
    }

    /// Shared, lock-free handle onto the latest ring snapshot.
    pub fn ring(&self) -> HashRing {
        self.ring.clone()
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Whether this instance is among the owners of `key`, at the configured
    /// replication factor. False on an empty ring: no owner is available,
    /// which is the caller's problem to interpret.
    pub fn should_handle(&self, key: &str) -> bool {
        self.ring
            .is_owner(key, &self.config.instance_id, self.config.replication_factor)
    }

    /// Subscribe to membership change events. Events are broadcast after the
    /// ring snapshot has been updated.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Observe this instance's local lifecycle state.
    pub fn state(&self) -> watch::Receiver<InstanceState> {
        self.state_tx.subscribe()
    }
}

impl Drop for InstanceLifecycle {
    fn drop(&mut self) {
        if !self.cancel_token.is_cancelled() {
            self.cancel_token.cancel();
            tracing::debug!(
                id = %self.config.instance_id,
                "InstanceLifecycle dropped without stop, peers will forget this instance"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn test_config(id: &str, port: u16) -> RingConfig {
        let mut cfg = RingConfig::new("127.0.0.1", port);
        cfg.instance_id = id.to_string();
        cfg.heartbeat_interval = Duration::from_millis(50);
        cfg.forget_after = Duration::from_millis(500);
        cfg.token_count = 16;
        cfg
    }

    #[tokio::test]
    async fn test_start_registers_active_entry_with_tokens() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = InstanceLifecycle::start(test_config("a", 9000), store.clone())
            .await
            .unwrap();

        let stored = store.get("cache/ring").await.unwrap().unwrap();
        let entry = stored.descriptor.get("a").unwrap();
        assert_eq!(entry.state, InstanceState::Active);
        assert_eq!(entry.tokens.len(), 16);
        assert_eq!(entry.address, "127.0.0.1:9000");

        lifecycle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_solo_instance_owns_every_key() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = InstanceLifecycle::start(test_config("a", 9000), store)
            .await
            .unwrap();

        for i in 0..50 {
            assert!(lifecycle.should_handle(&format!("key-{i}")));
        }

        lifecycle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_removes_entry_from_store() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = InstanceLifecycle::start(test_config("a", 9000), store.clone())
            .await
            .unwrap();

        lifecycle.stop(Duration::from_secs(1)).await.unwrap();

        let stored = store.get("cache/ring").await.unwrap().unwrap();
        assert!(stored.descriptor.get("a").is_none());
    }

    #[tokio::test]
    async fn test_second_instance_draws_disjoint_tokens() {
        let store = Arc::new(MemoryStore::new());
        let a = InstanceLifecycle::start(test_config("a", 9000), store.clone())
            .await
            .unwrap();
        let b = InstanceLifecycle::start(test_config("b", 9001), store.clone())
            .await
            .unwrap();

        let stored = store.get("cache/ring").await.unwrap().unwrap();
        let tokens_a: std::collections::HashSet<u64> = stored
            .descriptor
            .get("a")
            .unwrap()
            .tokens
            .iter()
            .copied()
            .collect();
        let tokens_b = &stored.descriptor.get("b").unwrap().tokens;
        assert!(tokens_b.iter().all(|t| !tokens_a.contains(t)));

        a.stop(Duration::from_secs(1)).await.unwrap();
        b.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_keeps_previous_tokens() {
        let store = Arc::new(MemoryStore::new());
        let first = InstanceLifecycle::start(test_config("a", 9000), store.clone())
            .await
            .unwrap();
        let tokens_before = store
            .get("cache/ring")
            .await
            .unwrap()
            .unwrap()
            .descriptor
            .get("a")
            .unwrap()
            .tokens
            .clone();

        // Crash: drop without a departure write.
        drop(first);

        let second = InstanceLifecycle::start(test_config("a", 9000), store.clone())
            .await
            .unwrap();
        let tokens_after = store
            .get("cache/ring")
            .await
            .unwrap()
            .unwrap()
            .descriptor
            .get("a")
            .unwrap()
            .tokens
            .clone();

        assert_eq!(tokens_before, tokens_after);
        second.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_state_transitions_on_stop() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = InstanceLifecycle::start(test_config("a", 9000), store)
            .await
            .unwrap();

        let state = lifecycle.state();
        assert_eq!(*state.borrow(), InstanceState::Active);

        lifecycle.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(*state.borrow(), InstanceState::Left);
    }
}
