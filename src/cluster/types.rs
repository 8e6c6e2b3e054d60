use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use tokio::time::Instant;

/// Everything the mapper knows about one cluster member.
///
/// `last_seen` is a monotonic timestamp; it is never put on the wire or on
/// disk and is refreshed to "now" whenever a record is received from a peer
/// or loaded from storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub services: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    /// Opaque load indicator, numeric or string.
    pub status: Value,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl AgentRecord {
    pub fn new<S, T>(services: S, tags: T, status: Value) -> Self
    where
        S: IntoIterator<Item = String>,
        T: IntoIterator<Item = String>,
    {
        Self {
            services: services.into_iter().collect(),
            tags: tags.into_iter().collect(),
            status,
            last_seen: Some(Instant::now()),
        }
    }

    /// Numeric view of `status` for load comparisons. Anything that is not a
    /// number (or a numeric string) sorts after every real load.
    pub fn load(&self) -> f64 {
        match &self.status {
            Value::Number(n) => n.as_f64().unwrap_or(f64::INFINITY),
            Value::String(s) => s.trim().parse().unwrap_or(f64::INFINITY),
            _ => f64::INFINITY,
        }
    }

    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.tags.contains(tag))
    }
}

/// Why a member left the cluster table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// No heartbeat within `agent_timeout` (reaper sweep or lazy routing check).
    Timeout,
    /// The agent sent an UnRegister.
    Unregistered,
    /// The agent did not answer a master liveness round.
    MissedPing,
    /// A peer mapper told us the agent is gone.
    Remote,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EvictionReason::Timeout => "timeout",
            EvictionReason::Unregistered => "unregistered",
            EvictionReason::MissedPing => "missed ping",
            EvictionReason::Remote => "remote delete",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Refreshed,
    /// The identity is not in the table; the caller decides whether to
    /// auto-register or ask the agent to advertise again.
    UnknownAgent,
}

/// Counts from a full-state reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub upserted: usize,
    pub removed: usize,
}
