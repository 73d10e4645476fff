//! ProgressSink (§4.7): lazy, single-subscriber-per-key observable of sync
//! lifecycle events.
//!
//! Design Note 9 re-architects the teacher's mutable observable properties
//! and `on_progress`/`on_error`/`on_remote_delete` callback triad
//! (`less_db::sync::types::SyncManagerOptions`) into explicit message
//! passing: a `tokio::sync::watch` channel carrying the latest `SyncEvent`,
//! which the UI subscribes to instead of polling a property.

use tokio::sync::watch;

use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Idle,
    Checking,
    Syncing { synced: usize, total: usize },
    Pulling { applied: usize },
    RateLimited { retry_after_s: u64, pending: usize },
    Offline,
    CaptivePortal,
    Error { kind: ErrorKind, detail: Option<String> },
    Success { pushed: usize, pulled: usize, duration_ms: u64 },
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Publishing half, owned by the coordinator.
#[derive(Clone)]
pub struct ProgressSink {
    tx: watch::Sender<SyncEvent>,
}

/// Subscribing half, held by the UI / widgets / any other observer.
pub struct ProgressObserver {
    rx: watch::Receiver<SyncEvent>,
}

impl ProgressSink {
    pub fn new() -> (Self, ProgressObserver) {
        let (tx, rx) = watch::channel(SyncEvent::Idle);
        (Self { tx }, ProgressObserver { rx })
    }

    pub fn emit(&self, event: SyncEvent) {
        // `watch::Sender::send` only errors if every receiver was dropped;
        // a sync pass with no observers left is not itself an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> ProgressObserver {
        ProgressObserver { rx: self.tx.subscribe() }
    }
}

impl ProgressObserver {
    pub fn current(&self) -> SyncEvent {
        self.rx.borrow().clone()
    }

    /// Awaits the next emitted event distinct from the currently observed
    /// one.
    pub async fn changed(&mut self) -> Option<SyncEvent> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow().clone())
    }
}
