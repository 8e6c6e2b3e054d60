use super::{DEFAULT_SELECTOR, Selector};
use crate::cluster::{AgentRecord, ClusterState};
use crate::packet::Request;

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Selection algorithms over the live providers in [`ClusterState`].
pub struct RoutingPolicy {
    cluster: Arc<ClusterState>,
    /// Rotation cursor per service string. Process-local.
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoutingPolicy {
    pub fn new(cluster: Arc<ClusterState>) -> Self {
        Self {
            cluster,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn candidates(&self, service: &str, tags: &[String]) -> Vec<(String, AgentRecord)> {
        self.cluster
            .live_agents_providing(service, tags, Instant::now())
    }

    pub fn all(&self, service: &str, tags: &[String]) -> Vec<String> {
        self.candidates(service, tags)
            .into_iter()
            .map(|(identity, _)| identity)
            .collect()
    }

    pub fn random(&self, service: &str, tags: &[String]) -> Vec<String> {
        let mut candidates = self.candidates(service, tags);
        if candidates.is_empty() {
            return Vec::new();
        }

        let pick = rand::thread_rng().gen_range(0..candidates.len());
        vec![candidates.swap_remove(pick).0]
    }

    /// Lowest numeric status wins; ties go to the first candidate in
    /// identity order.
    pub fn least_loaded(&self, service: &str, tags: &[String]) -> Vec<String> {
        let mut best: Option<(String, f64)> = None;

        for (identity, record) in self.candidates(service, tags) {
            let load = record.load();
            match &best {
                Some((_, lowest)) if load >= *lowest => {}
                _ => best = Some((identity, load)),
            }
        }

        best.map(|(identity, _)| vec![identity]).unwrap_or_default()
    }

    /// Returns the candidate at the service's cursor, then advances it.
    /// The cursor wraps to 0 whenever it has run past the candidate set.
    pub fn round_robin(&self, service: &str, tags: &[String]) -> Vec<String> {
        let candidates = self.candidates(service, tags);
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(service.to_string()).or_insert(0);
        if *cursor >= candidates.len() {
            *cursor = 0;
        }

        let picked = candidates[*cursor].0.clone();
        *cursor += 1;

        vec![picked]
    }

    pub fn select(&self, selector: Selector, service: &str, tags: &[String]) -> Vec<String> {
        let targets = match selector {
            Selector::All => self.all(service, tags),
            Selector::Random => self.random(service, tags),
            Selector::LeastLoaded => self.least_loaded(service, tags),
            Selector::RoundRobin => self.round_robin(service, tags),
        };

        tracing::debug!("{} selected {:?} for {}", selector, targets, service);
        targets
    }

    /// Targets for `request`: its explicit target, else the outcome of its
    /// selector (or [`DEFAULT_SELECTOR`]).
    pub fn targets_for(&self, request: &Request) -> Vec<String> {
        if let Some(target) = &request.target {
            return vec![target.clone()];
        }

        let selector = request.selector.unwrap_or(DEFAULT_SELECTOR);
        self.select(selector, &request.service_path(), &request.tags)
    }
}
