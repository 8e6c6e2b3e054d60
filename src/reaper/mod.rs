//! Timeout Reaper
//!
//! A generic timeout registry. Entries carry a TTL and a callback; a periodic
//! sweep invokes the callback of every entry whose deadline has passed and
//! removes the entry only if the callback returns `true`, so callers can
//! implement grace periods by declining.
//!
//! Sweeps snapshot the expired entries under the lock and run callbacks
//! outside it. An entry refreshed after the snapshot keeps its new deadline:
//! removal only happens if the entry is unchanged since the snapshot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type TimeoutCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct TimeoutEntry {
    ttl: Duration,
    deadline: Instant,
    generation: u64,
    callback: TimeoutCallback,
}

struct Inner {
    entries: HashMap<String, TimeoutEntry>,
    generation: u64,
}

pub struct Reaper {
    inner: Mutex<Inner>,
    interval: Duration,
}

impl Reaper {
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                generation: 0,
            }),
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts tracking `id` with a deadline of `now + ttl`, replacing any
    /// existing entry.
    pub fn register(&self, id: &str, ttl: Duration, callback: TimeoutCallback) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let generation = inner.generation;
        inner.entries.insert(
            id.to_string(),
            TimeoutEntry {
                ttl,
                deadline: Instant::now() + ttl,
                generation,
                callback,
            },
        );
    }

    /// Resets the deadline of `id`. Registers it when absent, so a refresh
    /// that races ahead of the registration is not lost.
    pub fn update(&self, id: &str, ttl: Duration, callback: TimeoutCallback) {
        if !self.contains(id) {
            tracing::trace!("Reaper update for untracked {}, registering", id);
        }
        self.register(id, ttl, callback);
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.inner.lock().entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self, id: &str) -> Option<Duration> {
        self.inner.lock().entries.get(id).map(|entry| entry.ttl)
    }

    /// Evaluates every entry once. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();

        let expired: Vec<(String, u64, TimeoutCallback)> = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .filter(|(_, entry)| now > entry.deadline)
                .map(|(id, entry)| (id.clone(), entry.generation, entry.callback.clone()))
                .collect()
        };

        let mut removed = 0;
        for (id, generation, callback) in expired {
            if !callback(&id) {
                tracing::debug!("Timeout callback for {} declined eviction", id);
                continue;
            }

            let mut inner = self.inner.lock();
            match inner.entries.get(&id).map(|entry| entry.generation) {
                Some(current) if current == generation => {
                    inner.entries.remove(&id);
                    removed += 1;
                }
                Some(_) => {
                    tracing::debug!("{} was refreshed during the sweep, keeping it", id);
                }
                // The callback unregistered it already.
                None => removed += 1,
            }
        }

        if removed > 0 {
            tracing::debug!("Reaper sweep removed {} entries", removed);
        }

        removed
    }

    /// Runs `sweep` every `interval` on its own task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;
                self.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests;
