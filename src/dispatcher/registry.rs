//! Actor Registry
//!
//! Maps actor prefixes (e.g. `"calc"`) to their [`Actor`] so a request path
//! like `/calc/add` can be resolved without hardcoding any actor in the
//! dispatcher. Built once at agent start and passed to the dispatcher.

use super::actor::Actor;

use dashmap::DashMap;
use std::sync::Arc;

pub struct ActorRegistry {
    actors: DashMap<String, Arc<Actor>>,
}

impl ActorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `actor` under its prefix, replacing any previous one.
    pub fn register(&self, actor: Actor) {
        let prefix = actor.prefix().to_string();
        let services = actor.services();

        if self.actors.insert(prefix.clone(), Arc::new(actor)).is_some() {
            tracing::warn!("Replaced actor registered under /{}", prefix);
        }

        tracing::info!("Registered actor /{} ({} operations)", prefix, services.len());
    }

    pub fn get(&self, prefix: &str) -> Option<Arc<Actor>> {
        self.actors.get(prefix).map(|entry| entry.value().clone())
    }

    pub fn has_actor(&self, prefix: &str) -> bool {
        self.actors.contains_key(prefix)
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    pub fn list_actors(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self
            .actors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        prefixes.sort();
        prefixes
    }

    /// Every service path provided by the registered actors, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .actors
            .iter()
            .flat_map(|entry| entry.value().services())
            .collect();
        services.sort();
        services
    }
}

impl Default for ActorRegistry {
    fn default() -> Self {
        Self {
            actors: DashMap::new(),
        }
    }
}
