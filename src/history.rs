//! `sync_history` ring buffer (§6 Persisted state layout): the last N sync
//! pass outcomes, kept for diagnostics/support screens.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryStatus {
    Success,
    RateLimited,
    Offline,
    CaptivePortal,
    Error(ErrorKind),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub status: HistoryStatus,
    pub pushed: usize,
    pub pulled: usize,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
    pub error_detail: Option<String>,
}

/// Fixed-capacity ring buffer, default size 10 (§6).
pub struct SyncHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl SyncHistory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: VecDeque::with_capacity(capacity) }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Most recent entries first.
    pub fn recent(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pushed: usize) -> HistoryEntry {
        HistoryEntry {
            status: HistoryStatus::Success,
            pushed,
            pulled: 0,
            duration_ms: 10,
            finished_at: Utc::now(),
            error_detail: None,
        }
    }

    #[test]
    fn ring_buffer_drops_oldest_beyond_capacity() {
        let mut history = SyncHistory::new(10);
        for i in 0..12 {
            history.record(entry(i));
        }
        assert_eq!(history.len(), 10);
        let newest: Vec<_> = history.recent().map(|e| e.pushed).collect();
        assert_eq!(newest[0], 11);
        assert_eq!(newest[9], 2);
    }
}
