use super::store::StateStore;
use super::types::{AgentRecord, EvictionReason, HeartbeatOutcome, MergeSummary};

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Called once per eviction, whichever path observed it first.
pub type EvictionHook = Arc<dyn Fn(&str, EvictionReason) + Send + Sync>;

/// The mapper's view of the cluster: the agent table plus inverted indices
/// from service path and tag to identities.
pub struct ClusterState {
    store: Box<dyn StateStore>,
    service_index: DashMap<String, BTreeSet<String>>,
    tag_index: DashMap<String, BTreeSet<String>>,
    agent_timeout: Duration,
    hooks: RwLock<Vec<EvictionHook>>,
}

impl ClusterState {
    pub fn new(store: Box<dyn StateStore>, agent_timeout: Duration) -> Arc<Self> {
        let state = Self {
            store,
            service_index: DashMap::new(),
            tag_index: DashMap::new(),
            agent_timeout,
            hooks: RwLock::new(Vec::new()),
        };

        for (identity, record) in state.store.entries() {
            state.index(&identity, &record);
        }

        Arc::new(state)
    }

    pub fn agent_timeout(&self) -> Duration {
        self.agent_timeout
    }

    pub fn on_eviction(&self, hook: EvictionHook) {
        self.hooks.write().push(hook);
    }

    /// Upserts a member with a full replace of services, tags and status.
    pub fn register(
        &self,
        identity: &str,
        services: Vec<String>,
        tags: Vec<String>,
        status: Value,
    ) -> Result<Option<AgentRecord>> {
        self.upsert(identity, AgentRecord::new(services, tags, status))
    }

    /// Stores `record` as-is apart from refreshing its timestamp.
    pub fn upsert(&self, identity: &str, mut record: AgentRecord) -> Result<Option<AgentRecord>> {
        record.last_seen = Some(Instant::now());
        self.index(identity, &record);

        let previous = self.store.put(identity, record.clone())?;
        if let Some(previous) = &previous {
            self.unindex_stale(identity, previous, &record);
        } else {
            tracing::info!("Agent {} joined ({} services)", identity, record.services.len());
        }

        Ok(previous)
    }

    /// Refreshes status and timestamp in place. A member evicted concurrently
    /// stays evicted.
    pub fn heartbeat(&self, identity: &str, mut status: Value) -> Result<HeartbeatOutcome> {
        let now = Instant::now();
        let refreshed = self.store.update(identity, &mut |record| {
            record.status = std::mem::take(&mut status);
            record.last_seen = Some(now);
        })?;

        if refreshed {
            Ok(HeartbeatOutcome::Refreshed)
        } else {
            Ok(HeartbeatOutcome::UnknownAgent)
        }
    }

    /// Marks every member as seen at `now`. Returns how many were touched.
    pub fn touch_all(&self, now: Instant) -> Result<usize> {
        let mut touched = 0;
        for identity in self.identities() {
            if self
                .store
                .update(&identity, &mut |record| record.last_seen = Some(now))?
            {
                touched += 1;
            }
        }
        Ok(touched)
    }

    pub fn unregister(&self, identity: &str) -> bool {
        self.evict(identity, EvictionReason::Unregistered)
    }

    pub fn lookup(&self, identity: &str) -> Option<AgentRecord> {
        self.store.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.store.get(identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.store.entries().into_iter().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> BTreeMap<String, AgentRecord> {
        self.store.entries().into_iter().collect()
    }

    /// Members providing `service` and carrying every tag in `tags`, ordered
    /// by identity. Timed-out members are included; see
    /// [`live_agents_providing`](Self::live_agents_providing).
    pub fn agents_providing(&self, service: &str, tags: &[String]) -> Vec<(String, AgentRecord)> {
        let Some(candidates) = self.service_index.get(service).map(|ids| ids.clone()) else {
            return Vec::new();
        };

        let mut matches = Vec::with_capacity(candidates.len());
        for identity in candidates {
            if !tags.is_empty() && !self.tagged_with_all(&identity, tags) {
                continue;
            }
            if let Some(record) = self.store.get(&identity) {
                matches.push((identity, record));
            }
        }

        matches
    }

    /// Like `agents_providing`, but evicts every timed-out match on the way.
    pub fn live_agents_providing(
        &self,
        service: &str,
        tags: &[String],
        now: Instant,
    ) -> Vec<(String, AgentRecord)> {
        self.agents_providing(service, tags)
            .into_iter()
            .filter(|(identity, record)| {
                if Self::is_timed_out(record, now, self.agent_timeout) {
                    tracing::warn!(
                        "Agent {} timed out during selection for {}, evicting",
                        identity,
                        service
                    );
                    self.evict(identity, EvictionReason::Timeout);
                    false
                } else {
                    true
                }
            })
            .collect()
    }

    pub fn is_timed_out(record: &AgentRecord, now: Instant, timeout: Duration) -> bool {
        match record.last_seen {
            Some(last_seen) => now.saturating_duration_since(last_seen) > timeout,
            None => false,
        }
    }

    /// Removes a member. Idempotent: hooks fire only for the call that
    /// actually removed the record.
    pub fn evict(&self, identity: &str, reason: EvictionReason) -> bool {
        let removed = match self.store.remove(identity) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!("Failed to remove {} from agent store: {}", identity, e);
                return false;
            }
        };

        let Some(record) = removed else {
            tracing::trace!("Eviction of {} ({}) was a no-op", identity, reason);
            return false;
        };

        self.unindex(identity, &record);
        tracing::info!("Agent {} left the cluster ({})", identity, reason);

        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook(identity, reason);
        }

        true
    }

    /// Full-state reconciliation: members absent from `incoming` are deleted,
    /// everything in `incoming` is upserted.
    pub fn merge(&self, incoming: BTreeMap<String, AgentRecord>) -> Result<MergeSummary> {
        let mut summary = MergeSummary::default();

        for identity in self.identities() {
            if !incoming.contains_key(&identity) && self.evict(&identity, EvictionReason::Remote) {
                summary.removed += 1;
            }
        }

        for (identity, record) in incoming {
            self.upsert(&identity, record)?;
            summary.upserted += 1;
        }

        tracing::info!(
            "Merged cluster state: {} upserted, {} removed",
            summary.upserted,
            summary.removed
        );

        Ok(summary)
    }

    fn tagged_with_all(&self, identity: &str, tags: &[String]) -> bool {
        tags.iter().all(|tag| {
            self.tag_index
                .get(tag)
                .map(|ids| ids.contains(identity))
                .unwrap_or(false)
        })
    }

    fn index(&self, identity: &str, record: &AgentRecord) {
        for service in &record.services {
            self.service_index
                .entry(service.clone())
                .or_default()
                .insert(identity.to_string());
        }
        for tag in &record.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(identity.to_string());
        }
    }

    fn unindex_stale(&self, identity: &str, previous: &AgentRecord, current: &AgentRecord) {
        for service in previous.services.difference(&current.services) {
            Self::remove_from(&self.service_index, service, identity);
        }
        for tag in previous.tags.difference(&current.tags) {
            Self::remove_from(&self.tag_index, tag, identity);
        }
    }

    fn unindex(&self, identity: &str, record: &AgentRecord) {
        for service in &record.services {
            Self::remove_from(&self.service_index, service, identity);
        }
        for tag in &record.tags {
            Self::remove_from(&self.tag_index, tag, identity);
        }
    }

    fn remove_from(index: &DashMap<String, BTreeSet<String>>, key: &str, identity: &str) {
        if let Some(mut ids) = index.get_mut(key) {
            ids.remove(identity);
        }
        index.remove_if(key, |_, ids| ids.is_empty());
    }
}
