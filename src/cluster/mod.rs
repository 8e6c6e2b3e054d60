//! Cluster State Module
//!
//! Tracks which agents are alive and what they provide.
//!
//! ## Core Mechanisms
//! - **Agent table**: identity -> services, tags, status and last-seen timestamp,
//!   kept behind a pluggable [`store::StateStore`] (memory or sled).
//! - **Inverted indices**: service path -> identities and tag -> identities for
//!   fast candidate lookup during routing.
//! - **Eviction**: a single idempotent `evict(identity, reason)` shared by the
//!   reaper sweep, lazy eviction during routing, liveness rounds and remote
//!   deletes, so the eviction hooks fire at most once per member.

pub mod state;
pub mod store;
pub mod types;

pub use state::{ClusterState, EvictionHook};
pub use store::{MemoryStore, SledStore, StateStore};
pub use types::{AgentRecord, EvictionReason, HeartbeatOutcome, MergeSummary};

#[cfg(test)]
mod tests;
