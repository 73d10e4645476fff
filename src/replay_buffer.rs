//! Background-launch replay buffer (§5, Design Note 9): the host system may
//! deliver events (geofence triggers, widget quick-adds) while the
//! `SyncCoordinator` hasn't been constructed yet. A bounded, age-capped
//! in-memory queue buffers them; on startup the coordinator drains stale
//! entries first, then applies fresh ones in timestamp order.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A buffered event awaiting the coordinator's construction.
#[derive(Debug, Clone)]
pub struct BufferedEvent<T> {
    pub payload: T,
    pub enqueued_at: DateTime<Utc>,
}

pub struct ReplayBuffer<T> {
    max_age: Duration,
    entries: VecDeque<BufferedEvent<T>>,
}

impl<T> ReplayBuffer<T> {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age, entries: VecDeque::new() }
    }

    pub fn push(&mut self, payload: T, now: DateTime<Utc>) {
        self.entries.push_back(BufferedEvent { payload, enqueued_at: now });
    }

    /// Drains the buffer, dropping entries older than `max_age` relative to
    /// `now` and returning the rest in enqueue (timestamp) order.
    pub fn drain(&mut self, now: DateTime<Utc>) -> (Vec<BufferedEvent<T>>, usize) {
        let mut fresh = Vec::with_capacity(self.entries.len());
        let mut dropped = 0;
        for entry in self.entries.drain(..) {
            let age = (now - entry.enqueued_at).to_std().unwrap_or(Duration::ZERO);
            if age > self.max_age {
                dropped += 1;
            } else {
                fresh.push(entry);
            }
        }
        (fresh, dropped)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
