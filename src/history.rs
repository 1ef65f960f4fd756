use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::models::TracedConnection;

pub const DEFAULT_MAX_PACKETS: usize = 100;

struct State {
    entries: VecDeque<TracedConnection>,
    summarized: bool,
    capacity: usize,
}

/// Most-recent-first record of observed packets.
///
/// In summarized mode repeated flows are coalesced into a single entry whose
/// `length` accumulates, and the buffer is bounded by the number of distinct
/// flows instead of `capacity`.
pub struct PacketHistory {
    state: Mutex<State>,
}

impl PacketHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                summarized: false,
                capacity,
            }),
        }
    }

    pub fn record(&self, connection: TracedConnection) {
        let mut state = self.lock();

        if state.summarized {
            let key = connection.key();
            match state.entries.iter_mut().find(|entry| entry.key() == key) {
                Some(existing) => existing.length += connection.length,
                None => state.entries.push_front(connection),
            }
            return;
        }

        state.entries.push_front(connection);
        let capacity = state.capacity;
        state.entries.truncate(capacity);
    }

    pub fn packets(&self) -> Vec<TracedConnection> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Switch modes. Lengths recorded under one mode are not comparable with
    /// the other, so the history starts over.
    pub fn set_summarized(&self, summarized: bool) {
        let mut state = self.lock();
        state.summarized = summarized;
        state.entries.clear();
        debug!(summarized, "packet history reset");
    }

    pub fn is_summarized(&self) -> bool {
        self.lock().summarized
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.lock();
        state.capacity = capacity;
        if !state.summarized {
            state.entries.truncate(capacity);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
