//! Coordination-store-backed cache cluster membership with token-based
//! consistent hashing.
//!
//! This crate provides:
//! - A token ring: every instance owns a fixed number of random positions on
//!   a 64-bit hash circle, and a key's owners are the first distinct active
//!   instances clockwise from the key's hash
//! - A per-process instance lifecycle: register, heartbeat, graceful leave
//! - Composable lifecycle policies: token assignment, leave-on-stop, and
//!   auto-forget of dead peers
//! - Lock-free ring reads via atomic snapshot swaps
//!
//! The shared coordination store is consumed through the [`KvStore`] trait
//! (get, compare-and-swap, watch) and is not implemented here beyond
//! [`MemoryStore`], an in-process stand-in for tests and single-process use.
//!
//! # Example
//!
//! ```rust,ignore
//! use cache_ring::{InstanceLifecycle, MemoryStore, RingConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!
//!     // Register with the ring and start heartbeating
//!     let lifecycle = InstanceLifecycle::start(RingConfig::from_env()?, store).await?;
//!
//!     // Look up the owners of a key
//!     for owner in lifecycle.ring().get("user:42", 2) {
//!         // route to owner.address
//!     }
//!
//!     // Graceful shutdown - removes this instance from the ring
//!     lifecycle.stop(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Churn
//!
//! Ownership follows tokens, so adding or removing one instance remaps only
//! the keys between that instance's tokens and their ring neighbors, about
//! 1/N of the keyspace for an N-instance fleet.
//!
//! # Failure Detection
//!
//! - **Graceful shutdown**: the departing instance removes its own entry;
//!   peers observe the change through the store watch immediately
//! - **Crash/kill -9**: surviving instances evict the entry once its
//!   heartbeat age exceeds the forget threshold (default 1 minute)

mod config;
mod delegate;
mod descriptor;
mod error;
mod kv;
mod lifecycle;
mod ring;

pub use config::RingConfig;
pub use delegate::{
    AutoForgetDelegate, DelegateChain, LeaveOnStopDelegate, LifecycleDelegate,
    TokenRegisterDelegate,
};
pub use descriptor::{InstanceEntry, InstanceState, RingDescriptor};
pub use error::Error;
pub use kv::{CasOutcome, KvStore, MemoryStore, Versioned};
pub use lifecycle::{InstanceLifecycle, MembershipEvent};
pub use ring::{HashRing, Owner};
