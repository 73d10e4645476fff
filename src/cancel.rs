//! Cooperative-cancellation signal, checked at every suspension point (§5):
//! network calls, transaction commits, backoff sleeps. `stop()` sets this;
//! `ChangeFeed`, `BootstrapFetcher`, and `SyncCoordinator` check it between
//! steps, and race `cancelled()` against in-flight requests via
//! `tokio::select!` so a cancelled pass abandons the request instead of
//! awaiting it to completion.

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel()` has been called. Intended to be raced via
    /// `tokio::select!` against an in-flight future so that future is
    /// dropped, not awaited, on cancellation.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.rx.clone();
        let _ = rx.changed().await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_immediately_once_already_cancelled() {
        let signal = CancelSignal::new();
        signal.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_a_later_cancel_call() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::task::yield_now().await;
        signal.cancel();
        task.await.unwrap();
    }
}
