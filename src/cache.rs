//! Live-flow table with per-entry idle eviction.
//!
//! Each entry owns one eviction task. Re-observing a flow moves the entry's
//! deadline forward; the task notices the later deadline when it wakes and
//! goes back to sleep instead of evicting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::models::TracedConnection;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_CONNECTIONS: usize = 1_000_000;

struct Entry {
    connection: TracedConnection,
    deadline: Instant,
    generation: u64,
}

type Entries = Mutex<HashMap<String, Entry>>;

pub struct ConnectionCache {
    entries: Arc<Entries>,
    idle_timeout: Duration,
    max_connections: AtomicUsize,
    generations: AtomicU64,
}

impl ConnectionCache {
    pub fn new(idle_timeout: Duration, max_connections: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
            max_connections: AtomicUsize::new(max_connections),
            generations: AtomicU64::new(0),
        }
    }

    /// Insert a flow or refresh its idle deadline. Must be called from within
    /// a tokio runtime.
    pub fn observe(&self, connection: TracedConnection) {
        let key = connection.key();
        let deadline = Instant::now() + self.idle_timeout;
        let mut entries = lock(&self.entries);

        if let Some(entry) = entries.get_mut(&key) {
            entry.deadline = deadline;
            trace!(%key, "refreshed connection");
            return;
        }

        // Soft memory bound: overflow drops everything rather than picking victims.
        if entries.len() > self.max_connections() {
            debug!(size = entries.len(), "connection cache over capacity, clearing");
            entries.clear();
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key.clone(),
            Entry {
                connection,
                deadline,
                generation,
            },
        );
        drop(entries);

        tokio::spawn(evict_when_idle(
            Arc::downgrade(&self.entries),
            key,
            generation,
            deadline,
        ));
    }

    pub fn connections(&self) -> Vec<TracedConnection> {
        lock(&self.entries)
            .values()
            .map(|entry| entry.connection.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Relaxed)
    }

    pub fn set_max_connections(&self, max: usize) {
        self.max_connections.store(max, Ordering::Relaxed);
    }
}

async fn evict_when_idle(entries: Weak<Entries>, key: String, generation: u64, mut deadline: Instant) {
    loop {
        time::sleep_until(deadline).await;

        let Some(entries) = entries.upgrade() else {
            return;
        };
        let mut entries = lock(&entries);

        match entries.get(&key) {
            Some(entry) if entry.generation != generation => return,
            Some(entry) if entry.deadline > deadline => deadline = entry.deadline,
            Some(_) => {
                entries.remove(&key);
                trace!(%key, "evicted idle connection");
                return;
            }
            None => return,
        }
    }
}

// A panic while holding the lock cannot leave the map half-updated, so a
// poisoned lock is still safe to use.
fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
