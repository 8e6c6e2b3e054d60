//! State Store Backends
//!
//! The agent table lives behind [`StateStore`] so the mapper can keep it in
//! memory or persist it. `SledStore` writes through to disk and keeps a
//! DashMap cache so reads never touch sled.

use super::types::AgentRecord;

use anyhow::Result;
use dashmap::DashMap;
use std::path::Path;
use tokio::time::Instant;

pub trait StateStore: Send + Sync {
    fn get(&self, identity: &str) -> Option<AgentRecord>;

    /// Inserts or replaces, returning the previous record.
    fn put(&self, identity: &str, record: AgentRecord) -> Result<Option<AgentRecord>>;

    fn remove(&self, identity: &str) -> Result<Option<AgentRecord>>;

    /// Applies `apply` to the stored record in place, holding the entry for
    /// the whole update. Returns `false` when `identity` is absent.
    fn update(&self, identity: &str, apply: &mut dyn FnMut(&mut AgentRecord)) -> Result<bool>;

    fn entries(&self) -> Vec<(String, AgentRecord)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, AgentRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, identity: &str) -> Option<AgentRecord> {
        self.records.get(identity).map(|entry| entry.value().clone())
    }

    fn put(&self, identity: &str, record: AgentRecord) -> Result<Option<AgentRecord>> {
        Ok(self.records.insert(identity.to_string(), record))
    }

    fn remove(&self, identity: &str) -> Result<Option<AgentRecord>> {
        Ok(self.records.remove(identity).map(|(_, record)| record))
    }

    fn update(&self, identity: &str, apply: &mut dyn FnMut(&mut AgentRecord)) -> Result<bool> {
        match self.records.get_mut(identity) {
            Some(mut entry) => {
                apply(entry.value_mut());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn entries(&self) -> Vec<(String, AgentRecord)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Disk-backed agent table. Records are stored as JSON under their identity.
pub struct SledStore {
    db: sled::Db,
    cache: DashMap<String, AgentRecord>,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let cache = DashMap::new();
        let now = Instant::now();

        for item in db.iter() {
            let (key, value) = item?;
            let identity = String::from_utf8(key.to_vec())?;
            match serde_json::from_slice::<AgentRecord>(&value) {
                Ok(mut record) => {
                    record.last_seen = Some(now);
                    cache.insert(identity, record);
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable stored record for {}: {}", identity, e);
                }
            }
        }

        tracing::info!(
            "Opened agent store at {} ({} records)",
            path.as_ref().display(),
            cache.len()
        );

        Ok(Self { db, cache })
    }
}

impl StateStore for SledStore {
    fn get(&self, identity: &str) -> Option<AgentRecord> {
        self.cache.get(identity).map(|entry| entry.value().clone())
    }

    fn put(&self, identity: &str, record: AgentRecord) -> Result<Option<AgentRecord>> {
        let encoded = serde_json::to_vec(&record)?;
        self.db.insert(identity.as_bytes(), encoded)?;
        Ok(self.cache.insert(identity.to_string(), record))
    }

    fn remove(&self, identity: &str) -> Result<Option<AgentRecord>> {
        self.db.remove(identity.as_bytes())?;
        Ok(self.cache.remove(identity).map(|(_, record)| record))
    }

    fn update(&self, identity: &str, apply: &mut dyn FnMut(&mut AgentRecord)) -> Result<bool> {
        let Some(mut entry) = self.cache.get_mut(identity) else {
            return Ok(false);
        };

        apply(entry.value_mut());
        let encoded = serde_json::to_vec(entry.value())?;
        self.db.insert(identity.as_bytes(), encoded)?;
        Ok(true)
    }

    fn entries(&self) -> Vec<(String, AgentRecord)> {
        self.cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.cache.len()
    }
}

impl Drop for SledStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            tracing::warn!("Failed to flush agent store: {}", e);
        }
    }
}
