//! In-process counter store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::backend::{Store, StoreError};
use super::clock::{Clock, SystemClock};
use super::counter::CounterEntry;
use super::key::RateLimitKey;

/// Counter store that keeps entries in process memory.
///
/// Each key is guarded by its map shard lock for the duration of the
/// read-modify-write, so increments on one key are linearizable. Expired
/// entries stay in place until a check replaces them or a sweep removes them.
pub struct LocalStore {
    entries: DashMap<RateLimitKey, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            entries: DashMap::new(),
            clock: Arc::new(clock),
        }
    }

    /// Get the current entry for a key, live or expired.
    pub fn get(&self, key: &RateLimitKey) -> Option<CounterEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Number of entries currently held, including expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove entries whose window has closed.
    ///
    /// Expiry is checked again under each entry's lock, so an entry that a
    /// concurrent check replaced with a fresh window is left alone.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<RateLimitKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .iter()
            .filter(|key| {
                self.entries
                    .remove_if(*key, |_, entry| entry.is_expired(now))
                    .is_some()
            })
            .count()
    }

    /// Start a background task that sweeps this store every `every`.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped. Dropping the returned handle stops it as well.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> Sweeper {
        let store: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Local store dropped, stopping sweeper");
                    break;
                };
                let removed = store.sweep_expired();
                debug!(
                    removed = removed,
                    remaining = store.len(),
                    "Swept expired counters"
                );
            }
        });

        Sweeper { handle }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn increment(
        &self,
        key: &RateLimitKey,
        window: Duration,
    ) -> Result<CounterEntry, StoreError> {
        let window = TimeDelta::from_std(window).map_err(|_| {
            warn!(key = %key, window = ?window, "Window out of range for local store");
            StoreError::Malformed(format!("window {:?} out of range", window))
        })?;
        let now = self.clock.now();

        let entry = *self
            .entries
            .entry(key.clone())
            .and_modify(|entry| {
                if entry.is_expired(now) {
                    trace!(key = %key, "Window closed, opening a new one");
                    *entry = CounterEntry::open(now, window);
                } else {
                    entry.count = entry.count.saturating_add(1);
                }
            })
            .or_insert_with(|| {
                debug!(key = %key, "Creating new rate limit counter");
                CounterEntry::open(now, window)
            });

        Ok(entry)
    }

    async fn sweep(&self) -> Result<usize, StoreError> {
        Ok(self.sweep_expired())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Handle to a running sweep task.
#[derive(Debug)]
pub struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Stop the sweep task.
    pub fn stop(self) {
        drop(self);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
