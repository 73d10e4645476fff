//! SyncCoordinator (§4.1): the single-writer state machine that composes
//! every other component into one `trigger(reason)` entry point.
//!
//! Design Note 9 re-architects the teacher's actor-isolated manager
//! (`less_db::sync::manager::SyncManager`, inferred from its re-exports in
//! `sync::mod`) into a single owning struct guarded by an in-flight flag plus
//! a coalesce-bursts counter, rather than a dedicated actor task: every
//! public method takes `&self` and is safe to call concurrently, but only
//! one sync pass ever runs at a time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::bootstrap::BootstrapFetcher;
use crate::cancel::CancelSignal;
use crate::change_feed::ChangeFeed;
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError};
use crate::health::HealthCheck;
use crate::history::{HistoryEntry, HistoryStatus, SyncHistory};
use crate::mutation::{EntityKind, MutationKind, PendingMutation};
use crate::network::{BatchItem, BatchItemResult, BatchItemStatus, NetworkClient, NetworkError};
use crate::progress::{ProgressObserver, ProgressSink, SyncEvent};
use crate::queue::{CoalesceResult, MutationQueue};
use crate::store::{DataStore, DeleteMode, StoreError};

/// Why a pass was requested; carried through only for logging — the
/// algorithm itself (§4.1) does not branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Startup,
    LocalWrite,
    Periodic,
    NetworkRestored,
    Manual,
}

/// The result of one sync pass, also what `trigger()` returns to every
/// caller coalesced onto it.
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Success { pushed: usize, pulled: usize, duration_ms: u64 },
    RateLimited { retry_after_s: u64, pending: usize },
    Offline,
    CaptivePortal,
    Error { kind: ErrorKind, detail: Option<String> },
    Cancelled,
    /// Nothing pending and no due pull; `Idle` stayed `Idle` (§4.1).
    Skipped,
}

enum BatchItemOutcome {
    Pushed,
    Retry,
    ValidationFailed,
    Exhausted,
}

/// Single-flight state for `trigger()` (§4.1). Guarded by one mutex rather
/// than two independent atomics so "mark pending + subscribe" (a waiter) and
/// "check pending + clear in_flight" (the owner finishing its loop) can
/// never interleave: a waiter that observes `in_flight == true` is
/// guaranteed the owner's next check of `rerun_pending` happens after it,
/// since both go through the same lock. No lost wakeup.
#[derive(Default)]
struct RunState {
    in_flight: bool,
    rerun_pending: bool,
}

pub struct SyncCoordinator {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn DataStore>,
    client: Arc<dyn NetworkClient>,
    circuit_breaker: SyncMutex<CircuitBreaker>,
    health: AsyncMutex<HealthCheck>,
    progress: ProgressSink,
    history: SyncMutex<SyncHistory>,
    cancel: CancelSignal,
    run_state: SyncMutex<RunState>,
    outcome_tx: broadcast::Sender<PassOutcome>,
    stopped: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(config: SyncConfig, clock: Arc<dyn Clock>, store: Arc<dyn DataStore>, client: Arc<dyn NetworkClient>) -> (Self, ProgressObserver) {
        let (progress, observer) = ProgressSink::new();
        let circuit_breaker = CircuitBreaker::new(
            config.circuit_threshold,
            config.base_backoff.into(),
            config.max_backoff.into(),
            config.backoff_jitter.into(),
        );
        let health = HealthCheck::new(config.health_ttl.into());
        let history = SyncHistory::new(config.history_capacity);
        let (outcome_tx, _) = broadcast::channel(16);

        let coordinator = Self {
            config,
            clock,
            store,
            client,
            circuit_breaker: SyncMutex::new(circuit_breaker),
            health: AsyncMutex::new(health),
            progress,
            history: SyncMutex::new(history),
            cancel: CancelSignal::new(),
            run_state: SyncMutex::new(RunState::default()),
            outcome_tx,
            stopped: AtomicBool::new(false),
        };
        (coordinator, observer)
    }

    pub fn subscribe(&self) -> ProgressObserver {
        self.progress.subscribe()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().recent().cloned().collect()
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Requests cancellation at the coordinator's next suspension point
    /// (§5). Does not block for an in-flight pass to finish; terminal per
    /// §4.1 — this coordinator instance does not resume after `stop()`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub async fn perform_sync(&self) -> PassOutcome {
        self.trigger(TriggerReason::Manual).await
    }

    /// Single-flight, coalesce-bursts entry point. If a pass is already
    /// running, marks `rerun_pending` and waits on its outcome instead of
    /// starting a second concurrent pass (P1).
    ///
    /// Marking "pending" and subscribing to `outcome_tx` happen under
    /// `run_state`'s lock, as does the owner's "anyone pending?" check at
    /// the end of its loop — so a waiter can never subscribe *after* the
    /// owner has already looked and found nothing, which would otherwise
    /// leave it awaiting a broadcast message nobody sends again.
    pub async fn trigger(&self, reason: TriggerReason) -> PassOutcome {
        if self.stopped.load(Ordering::SeqCst) {
            return PassOutcome::Cancelled;
        }

        let subscription = {
            let mut state = self.run_state.lock();
            if state.in_flight {
                state.rerun_pending = true;
                Some(self.outcome_tx.subscribe())
            } else {
                state.in_flight = true;
                None
            }
        };

        if let Some(mut rx) = subscription {
            return rx.recv().await.unwrap_or(PassOutcome::Cancelled);
        }

        let mut outcome;
        loop {
            outcome = self.perform_sync_once(reason).await;
            let _ = self.outcome_tx.send(outcome.clone());

            let mut state = self.run_state.lock();
            if !state.rerun_pending {
                state.in_flight = false;
                break;
            }
            state.rerun_pending = false;
        }
        outcome
    }

    async fn perform_sync_once(&self, reason: TriggerReason) -> PassOutcome {
        let span = tracing::info_span!("sync_pass", ?reason);
        let _enter = span.enter();
        let start = self.clock.monotonic_now();
        tracing::info!("starting");

        let deadline = Duration::from(self.config.sync_total_deadline);
        let outcome = match tokio::time::timeout(deadline, self.run_pass()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(?deadline, "sync pass exceeded its deadline");
                PassOutcome::Error { kind: ErrorKind::Transient, detail: Some("sync pass exceeded its deadline".to_string()) }
            }
        };

        let duration_ms = self.clock.monotonic_now().saturating_duration_since(start).as_millis() as u64;
        let outcome = stamp_duration(outcome, duration_ms);
        self.record_history(&outcome, duration_ms);
        self.emit_terminal_progress(&outcome);
        tracing::info!(?outcome, duration_ms, "finished");
        outcome
    }

    async fn run_pass(&self) -> PassOutcome {
        if self.cancel.is_cancelled() {
            return PassOutcome::Cancelled;
        }

        let now_mono = self.clock.monotonic_now();
        {
            let mut breaker = self.circuit_breaker.lock();
            breaker.tick(now_mono);
            if breaker.is_tripped() {
                return self.rate_limited_outcome(breaker.backoff_remaining(now_mono));
            }
        }

        self.progress.emit(SyncEvent::Checking);
        let health_state = {
            let mut health = self.health.lock().await;
            health.probe(self.client.as_ref(), now_mono).await
        };

        if !health_state.reachable {
            return PassOutcome::Offline;
        }
        if health_state.captive_portal {
            return PassOutcome::CaptivePortal;
        }

        let pushed = match self.flush_phase().await {
            Ok(pushed) => pushed,
            Err(outcome) => return outcome,
        };

        if self.cancel.is_cancelled() {
            return PassOutcome::Cancelled;
        }

        let pulled = match self.pull_phase().await {
            Ok(pulled) => pulled,
            Err(outcome) => return outcome,
        };

        self.circuit_breaker.lock().on_success();
        PassOutcome::Success { pushed, pulled, duration_ms: 0 }
    }

    // ===== Flush phase (§4.2) =====

    async fn flush_phase(&self) -> Result<usize, PassOutcome> {
        let pending = self.store.list_pending_mutations(self.config.batch_size.saturating_mul(8)).map_err(|e| self.fatal_outcome(e))?;
        let total = pending.len();
        if pending.is_empty() {
            return Ok(0);
        }

        let original_ids: HashSet<Uuid> = pending.iter().map(|m| m.id).collect();
        let CoalesceResult { survivors, collapsed_targets } = MutationQueue::coalesce(pending);
        self.prune_coalesced(&original_ids, &survivors, &collapsed_targets)?;

        let batch = MutationQueue::new(self.config.batch_size).next_batch(survivors);
        if batch.is_empty() {
            return Ok(0);
        }

        let mut pushed = 0;
        if !batch.event_creates.is_empty() {
            pushed += self.send_event_batch(&batch.event_creates).await?;
            self.progress.emit(SyncEvent::Syncing { synced: pushed, total });
        }

        for mutation in &batch.singles {
            if self.cancel.is_cancelled() {
                return Err(PassOutcome::Cancelled);
            }
            if self.send_single(mutation).await? {
                pushed += 1;
            }
            self.progress.emit(SyncEvent::Syncing { synced: pushed, total });
        }

        Ok(pushed)
    }

    /// I1/I2: removes the now-stale duplicate pending rows that coalesced
    /// into a single survivor, and hard-removes the local row for any
    /// create+delete pair that collapsed to zero mutations.
    fn prune_coalesced(
        &self,
        original_ids: &HashSet<Uuid>,
        survivors: &[PendingMutation],
        collapsed_targets: &[(EntityKind, Uuid)],
    ) -> Result<(), PassOutcome> {
        let keep_ids: HashSet<Uuid> = survivors.iter().map(|m| m.id).collect();
        let stale_ids: Vec<Uuid> = original_ids.difference(&keep_ids).copied().collect();

        if !stale_ids.is_empty() || !collapsed_targets.is_empty() {
            let mut tx = self.store.begin_tx().map_err(|e| self.fatal_outcome(e))?;
            for id in &stale_ids {
                self.store.remove_pending(&mut tx, *id).map_err(|e| self.fatal_outcome(e))?;
            }
            for (entity, target_id) in collapsed_targets {
                self.store.delete_entity_by_id(&mut tx, *entity, *target_id, DeleteMode::Hard).map_err(|e| self.fatal_outcome(e))?;
            }
            self.store.commit_tx(tx).map_err(|e| self.fatal_outcome(e))?;
        }
        Ok(())
    }

    async fn send_event_batch(&self, mutations: &[PendingMutation]) -> Result<usize, PassOutcome> {
        let items: Vec<BatchItem> = mutations
            .iter()
            .map(|m| BatchItem { target_id: m.target_id, idempotency_key: m.idempotency_key.clone(), payload: m.payload.clone() })
            .collect();

        let response = match self.client.post_event_batch(&items).await {
            Ok(response) => response,
            Err(NetworkError::RateLimited { retry_after, .. }) => return Err(self.rate_limited_outcome(retry_after)),
            Err(NetworkError::Unauthorized { .. }) | Err(NetworkError::Forbidden { .. }) => {
                return Err(PassOutcome::Error { kind: ErrorKind::Unauthorized, detail: None })
            }
            Err(err) => {
                // Whole-batch transient failure: every item gets an attempt,
                // none are pushed. The pass continues to the pull phase.
                self.bump_attempts(mutations).map_err(|e| self.fatal_outcome(e))?;
                tracing::debug!(error = %err, "event batch failed transiently");
                return Ok(0);
            }
        };

        let by_id: HashMap<Uuid, &PendingMutation> = mutations.iter().map(|m| (m.target_id, m)).collect();
        let mut tx = self.store.begin_tx().map_err(|e| self.fatal_outcome(e))?;
        let mut pushed = 0;
        let mut last_error: Option<(ErrorKind, Option<String>)> = None;

        for item in &response.items {
            let Some(mutation) = by_id.get(&item.target_id) else { continue };
            match self.apply_batch_item(&mut tx, mutation, item) {
                Ok(BatchItemOutcome::Pushed) => pushed += 1,
                Ok(BatchItemOutcome::ValidationFailed) => {
                    last_error = Some((ErrorKind::ValidationFailed, item.error.as_ref().map(|p| p.title.clone())));
                }
                Ok(BatchItemOutcome::Exhausted) => {
                    last_error = Some((ErrorKind::Exhausted, Some(format!("mutation {} exhausted its retries", mutation.id))));
                }
                Ok(BatchItemOutcome::Retry) => {}
                Err(err) => {
                    let _ = self.store.rollback_tx(tx);
                    return Err(self.fatal_outcome(err));
                }
            }
        }

        self.store.commit_tx(tx).map_err(|e| self.fatal_outcome(e))?;
        if let Some((kind, detail)) = last_error {
            self.progress.emit(SyncEvent::Error { kind, detail });
        }
        Ok(pushed)
    }

    fn apply_batch_item(&self, tx: &mut crate::store::Tx, mutation: &PendingMutation, item: &BatchItemResult) -> Result<BatchItemOutcome, StoreError> {
        match item.status {
            BatchItemStatus::Ok => {
                if let Some(server_id) = item.server_id {
                    if server_id != mutation.target_id {
                        // I6: duplicate create replay reconciled to the server's existing row.
                        self.store.reconcile_id(tx, mutation.entity, mutation.target_id, server_id)?;
                    }
                }
                self.store.remove_pending(tx, mutation.id)?;
                Ok(BatchItemOutcome::Pushed)
            }
            BatchItemStatus::Failed => {
                let is_validation = item.error.as_ref().map(|p| !p.errors.is_empty()).unwrap_or(false);
                if is_validation {
                    self.store.quarantine_mutation(tx, mutation.id)?;
                    Ok(BatchItemOutcome::ValidationFailed)
                } else {
                    let attempts = self.store.increment_attempt(tx, mutation.id)?;
                    if attempts >= self.config.mutation_max_attempts {
                        self.store.quarantine_mutation(tx, mutation.id)?;
                        Ok(BatchItemOutcome::Exhausted)
                    } else {
                        Ok(BatchItemOutcome::Retry)
                    }
                }
            }
        }
    }

    fn bump_attempts(&self, mutations: &[PendingMutation]) -> Result<(), StoreError> {
        let mut tx = self.store.begin_tx()?;
        for mutation in mutations {
            let attempts = self.store.increment_attempt(&mut tx, mutation.id)?;
            if attempts >= self.config.mutation_max_attempts {
                self.store.quarantine_mutation(&mut tx, mutation.id)?;
            }
        }
        self.store.commit_tx(tx)
    }

    async fn send_single(&self, mutation: &PendingMutation) -> Result<bool, PassOutcome> {
        let result = self
            .client
            .send_single_mutation(mutation.entity, mutation.kind, mutation.target_id, &mutation.idempotency_key, &mutation.payload)
            .await;

        match result {
            Ok(server_id) => {
                let mut tx = self.store.begin_tx().map_err(|e| self.fatal_outcome(e))?;
                if let Some(server_id) = server_id {
                    if server_id != mutation.target_id {
                        self.store.reconcile_id(&mut tx, mutation.entity, mutation.target_id, server_id).map_err(|e| self.fatal_outcome(e))?;
                    }
                }
                if mutation.kind == MutationKind::Delete {
                    self.store.delete_entity_by_id(&mut tx, mutation.entity, mutation.target_id, DeleteMode::Hard).map_err(|e| self.fatal_outcome(e))?;
                }
                self.store.remove_pending(&mut tx, mutation.id).map_err(|e| self.fatal_outcome(e))?;
                self.store.commit_tx(tx).map_err(|e| self.fatal_outcome(e))?;
                Ok(true)
            }
            Err(NetworkError::RateLimited { retry_after, .. }) => Err(self.rate_limited_outcome(retry_after)),
            Err(NetworkError::Unauthorized { .. }) | Err(NetworkError::Forbidden { .. }) => {
                Err(PassOutcome::Error { kind: ErrorKind::Unauthorized, detail: None })
            }
            Err(NetworkError::ValidationFailed { problem }) => {
                let mut tx = self.store.begin_tx().map_err(|e| self.fatal_outcome(e))?;
                self.store.quarantine_mutation(&mut tx, mutation.id).map_err(|e| self.fatal_outcome(e))?;
                self.store.commit_tx(tx).map_err(|e| self.fatal_outcome(e))?;
                self.progress.emit(SyncEvent::Error { kind: ErrorKind::ValidationFailed, detail: Some(problem.title) });
                Ok(false)
            }
            // ConflictIgnored (I6): a duplicate create is treated as success.
            Err(NetworkError::Conflict { .. }) => {
                let mut tx = self.store.begin_tx().map_err(|e| self.fatal_outcome(e))?;
                self.store.remove_pending(&mut tx, mutation.id).map_err(|e| self.fatal_outcome(e))?;
                self.store.commit_tx(tx).map_err(|e| self.fatal_outcome(e))?;
                Ok(true)
            }
            Err(err) => {
                let mut tx = self.store.begin_tx().map_err(|e| self.fatal_outcome(e))?;
                let attempts = self.store.increment_attempt(&mut tx, mutation.id).map_err(|e| self.fatal_outcome(e))?;
                if attempts >= self.config.mutation_max_attempts {
                    self.store.quarantine_mutation(&mut tx, mutation.id).map_err(|e| self.fatal_outcome(e))?;
                }
                self.store.commit_tx(tx).map_err(|e| self.fatal_outcome(e))?;
                tracing::debug!(error = %err, mutation_id = %mutation.id, "transient single-mutation failure");
                Ok(false)
            }
        }
    }

    // ===== Pull / bootstrap phase (§4.3, §4.4) =====

    async fn pull_phase(&self) -> Result<usize, PassOutcome> {
        let cursor = self.store.load_cursor().map_err(|e| self.fatal_outcome(e))?;

        if cursor == 0 {
            let fetcher = BootstrapFetcher::new(self.client.as_ref(), self.store.as_ref(), self.config.pull_page_limit);
            let counts = fetcher.run(&self.cancel).await.map_err(|e| self.sync_error_outcome(e))?;
            let applied = counts.event_types + counts.geofences + counts.events + counts.property_defs;
            tracing::info!(?counts, "bootstrap complete");
            self.progress.emit(SyncEvent::Pulling { applied });
            return Ok(applied);
        }

        let feed = ChangeFeed::new(self.client.as_ref(), self.store.as_ref(), self.config.pull_page_limit, self.config.max_pages_per_sync);
        let outcome = feed.pull(cursor, &self.cancel).await.map_err(|e| self.sync_error_outcome(e))?;
        self.progress.emit(SyncEvent::Pulling { applied: outcome.applied });
        Ok(outcome.applied)
    }

    // ===== Shared helpers =====

    fn rate_limited_outcome(&self, server_retry_after: Duration) -> PassOutcome {
        let now = self.clock.monotonic_now();
        let mut breaker = self.circuit_breaker.lock();
        breaker.on_rate_limited(now);
        // P5: first retry occurs no earlier than the max of server Retry-After
        // and the circuit breaker's own jittered backoff.
        let retry_after_s = breaker.backoff_remaining(now).max(server_retry_after).as_secs();
        let pending = self.store.list_pending_mutations(usize::MAX).map(|v| v.len()).unwrap_or(0);
        tracing::warn!(retry_after_s, pending, "sync pass rate limited");
        PassOutcome::RateLimited { retry_after_s, pending }
    }

    fn sync_error_outcome(&self, err: SyncError) -> PassOutcome {
        match err {
            SyncError::Cancelled => PassOutcome::Cancelled,
            SyncError::Network { source: NetworkError::RateLimited { retry_after, .. }, .. } => self.rate_limited_outcome(retry_after),
            other => {
                let kind = other.kind();
                let detail = other.to_string();
                log_error_by_kind(kind, &detail);
                PassOutcome::Error { kind, detail: Some(detail) }
            }
        }
    }

    fn fatal_outcome(&self, err: StoreError) -> PassOutcome {
        let detail = err.to_string();
        log_error_by_kind(ErrorKind::Fatal, &detail);
        PassOutcome::Error { kind: ErrorKind::Fatal, detail: Some(detail) }
    }

    fn record_history(&self, outcome: &PassOutcome, duration_ms: u64) {
        let (status, pushed, pulled, error_detail) = match outcome {
            PassOutcome::Success { pushed, pulled, .. } => (HistoryStatus::Success, *pushed, *pulled, None),
            PassOutcome::RateLimited { .. } => (HistoryStatus::RateLimited, 0, 0, None),
            PassOutcome::Offline => (HistoryStatus::Offline, 0, 0, None),
            PassOutcome::CaptivePortal => (HistoryStatus::CaptivePortal, 0, 0, None),
            PassOutcome::Error { kind, detail } => (HistoryStatus::Error(*kind), 0, 0, detail.clone()),
            PassOutcome::Cancelled => (HistoryStatus::Cancelled, 0, 0, None),
            PassOutcome::Skipped => return,
        };
        self.history.lock().record(HistoryEntry { status, pushed, pulled, duration_ms, finished_at: self.clock.now_utc(), error_detail });
    }

    fn emit_terminal_progress(&self, outcome: &PassOutcome) {
        let event = match outcome {
            PassOutcome::Success { pushed, pulled, duration_ms } => SyncEvent::Success { pushed: *pushed, pulled: *pulled, duration_ms: *duration_ms },
            PassOutcome::RateLimited { retry_after_s, pending } => SyncEvent::RateLimited { retry_after_s: *retry_after_s, pending: *pending },
            PassOutcome::Offline => SyncEvent::Offline,
            PassOutcome::CaptivePortal => SyncEvent::CaptivePortal,
            PassOutcome::Error { kind, detail } => SyncEvent::Error { kind: *kind, detail: detail.clone() },
            // Cancellation isn't itself a user-visible error (§7); the
            // ProgressSink simply stops advancing.
            PassOutcome::Cancelled => return,
            PassOutcome::Skipped => SyncEvent::Idle,
        };
        self.progress.emit(event);
    }
}

fn stamp_duration(outcome: PassOutcome, duration_ms: u64) -> PassOutcome {
    match outcome {
        PassOutcome::Success { pushed, pulled, .. } => PassOutcome::Success { pushed, pulled, duration_ms },
        other => other,
    }
}

/// §10: `error` for `Fatal`/`Unauthorized`, `warn` for `Transient`/`RateLimited`,
/// `debug` for `ConflictIgnored`.
fn log_error_by_kind(kind: ErrorKind, detail: &str) {
    match kind {
        ErrorKind::Fatal | ErrorKind::Unauthorized => tracing::error!(?kind, detail, "sync pass failed"),
        ErrorKind::Transient | ErrorKind::RateLimited => tracing::warn!(?kind, detail, "sync pass failed"),
        ErrorKind::ConflictIgnored => tracing::debug!(?kind, detail, "sync pass conflict ignored"),
        ErrorKind::ValidationFailed | ErrorKind::Exhausted | ErrorKind::CaptivePortal => {
            tracing::warn!(?kind, detail, "sync pass failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{BatchResponse, Change, ChangeOp, HealthResponse, Page};
    use crate::testing::{FixedClock, InMemoryStore, ScriptedNetworkClient};
    use serde_json::json;

    fn coordinator(store: Arc<InMemoryStore>, client: Arc<ScriptedNetworkClient>) -> (SyncCoordinator, ProgressObserver) {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        SyncCoordinator::new(SyncConfig::default(), clock, store, client)
    }

    fn ok_health(client: &ScriptedNetworkClient) {
        client.push_health(HealthResponse { status: 200, content_type: Some("application/json".into()), body: "{\"ok\":true}".into() });
    }

    #[tokio::test]
    async fn happy_flush_pushes_three_creates_in_one_batch_call() {
        let store = Arc::new(InMemoryStore::new());
        store.store_cursor(&mut store.begin_tx().unwrap(), 1).unwrap();
        for _ in 0..3 {
            store.seed_pending(PendingMutation::new(MutationKind::Create, EntityKind::Event, Uuid::now_v7(), json!({"notes": "run"}), chrono::Utc::now()));
        }
        let client = Arc::new(ScriptedNetworkClient::new());
        ok_health(&client);
        client.push_changes_page(Page { changes: vec![], next_cursor: 1, has_more: false });

        let (coordinator, _observer) = coordinator(store.clone(), client.clone());
        let outcome = coordinator.perform_sync().await;

        assert!(matches!(outcome, PassOutcome::Success { pushed: 3, .. }));
        assert_eq!(store.pending_count(), 0);
        assert_eq!(client.batch_call_count(), 1);
    }

    #[tokio::test]
    async fn rate_limit_trips_circuit_and_reports_pending() {
        let store = Arc::new(InMemoryStore::new());
        store.store_cursor(&mut store.begin_tx().unwrap(), 1).unwrap();
        for _ in 0..3 {
            store.seed_pending(PendingMutation::new(MutationKind::Create, EntityKind::Event, Uuid::now_v7(), json!({}), chrono::Utc::now()));
        }
        let client = Arc::new(ScriptedNetworkClient::new());
        let (coordinator, _observer) = coordinator(store.clone(), client.clone());

        for _ in 0..3 {
            ok_health(&client);
            client.push_batch_response(Err(NetworkError::RateLimited { retry_after: Duration::from_secs(30), problem: None }));
            let outcome = coordinator.perform_sync().await;
            assert!(matches!(outcome, PassOutcome::RateLimited { .. }));
        }

        // Fourth trigger should still be rate-limited without calling the
        // client again, since the circuit breaker is open.
        let before = client.batch_call_count();
        let outcome = coordinator.perform_sync().await;
        assert!(matches!(outcome, PassOutcome::RateLimited { pending: 3, .. }));
        assert_eq!(client.batch_call_count(), before);
    }

    #[tokio::test]
    async fn partial_batch_failure_quarantines_one_item() {
        let store = Arc::new(InMemoryStore::new());
        store.store_cursor(&mut store.begin_tx().unwrap(), 1).unwrap();
        let bad_id = Uuid::now_v7();
        store.seed_pending(PendingMutation::new(MutationKind::Create, EntityKind::Event, bad_id, json!({}), chrono::Utc::now()));
        let good_id = Uuid::now_v7();
        store.seed_pending(PendingMutation::new(MutationKind::Create, EntityKind::Event, good_id, json!({}), chrono::Utc::now()));

        let client = Arc::new(ScriptedNetworkClient::new());
        ok_health(&client);
        client.push_batch_response(Ok(BatchResponse {
            success: 1,
            failed: 1,
            items: vec![
                BatchItemResult {
                    target_id: bad_id,
                    status: BatchItemStatus::Failed,
                    server_id: None,
                    error: Some(crate::network::ProblemDetails {
                        problem_type: "urn:validation".into(),
                        title: "invalid timestamp".into(),
                        status: 422,
                        detail: None,
                        request_id: None,
                        retry_after: None,
                        action: None,
                        errors: vec![crate::network::ProblemField { field: "timestamp".into(), message: "in the past".into(), code: "invalid".into() }],
                    }),
                },
                BatchItemResult { target_id: good_id, status: BatchItemStatus::Ok, server_id: Some(good_id), error: None },
            ],
        }));
        client.push_changes_page(Page { changes: vec![], next_cursor: 1, has_more: false });

        let (coordinator, _observer) = coordinator(store.clone(), client.clone());
        let outcome = coordinator.perform_sync().await;

        // The 49-surviving-of-50 scenario from §8 scenario 3, scaled down:
        // the good item pushes, the bad one quarantines instead of retrying.
        assert!(matches!(outcome, PassOutcome::Success { pushed: 1, .. }));
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.quarantined_count(), 1);
    }

    #[tokio::test]
    async fn pull_applies_tombstone_then_reinsert() {
        let store = Arc::new(InMemoryStore::new());
        store.store_cursor(&mut store.begin_tx().unwrap(), 1).unwrap();
        let id = Uuid::now_v7();

        let client = Arc::new(ScriptedNetworkClient::new());
        ok_health(&client);
        client.push_changes_page(Page {
            changes: vec![
                Change { op: ChangeOp::Delete, entity: EntityKind::Event, id, payload: None, server_rev: 1, change_id: 10 },
                Change { op: ChangeOp::Insert, entity: EntityKind::Event, id, payload: Some(json!({"notes": "server copy"})), server_rev: 2, change_id: 11 },
            ],
            next_cursor: 11,
            has_more: false,
        });

        let (coordinator, _observer) = coordinator(store.clone(), client.clone());
        let outcome = coordinator.perform_sync().await;

        assert!(matches!(outcome, PassOutcome::Success { pulled: 2, .. }));
        assert!(store.contains(EntityKind::Event, id));
        assert!(!store.is_deleted(EntityKind::Event, id));
        assert_eq!(store.load_cursor().unwrap(), 11);
    }

    #[tokio::test]
    async fn bootstrap_cold_start_preserves_entity_order_and_sets_cursor() {
        let store = Arc::new(InMemoryStore::new());
        let client = Arc::new(ScriptedNetworkClient::new());
        ok_health(&client);
        client.set_latest_cursor(99);
        client.set_bootstrap_counts(2, 0, 37, 4);

        let (coordinator, _observer) = coordinator(store.clone(), client.clone());
        let outcome = coordinator.perform_sync().await;

        assert!(matches!(outcome, PassOutcome::Success { pulled: 43, .. }));
        assert_eq!(store.load_cursor().unwrap(), 99);
    }

    #[tokio::test]
    async fn concurrent_triggers_coalesce_onto_one_in_flight_pass() {
        let store = Arc::new(InMemoryStore::new());
        store.store_cursor(&mut store.begin_tx().unwrap(), 1).unwrap();
        let client = Arc::new(ScriptedNetworkClient::new());
        ok_health(&client);
        ok_health(&client);
        client.push_changes_page(Page { changes: vec![], next_cursor: 1, has_more: false });
        client.push_changes_page(Page { changes: vec![], next_cursor: 1, has_more: false });

        let (coordinator, _observer) = coordinator(store.clone(), client.clone());
        let coordinator = Arc::new(coordinator);
        let a = coordinator.clone();
        let b = coordinator.clone();

        let (ra, rb) = tokio::join!(tokio::spawn(async move { a.trigger(TriggerReason::LocalWrite).await }), tokio::spawn(async move { b.trigger(TriggerReason::Periodic).await }));

        assert!(matches!(ra.unwrap(), PassOutcome::Success { .. }));
        assert!(matches!(rb.unwrap(), PassOutcome::Success { .. }));
    }

    /// P7: `stop()` landing while a pull page is in flight cancels the pass
    /// without advancing the cursor past where it started.
    #[tokio::test]
    async fn stop_during_in_flight_pull_cancels_without_advancing_cursor() {
        let store = Arc::new(InMemoryStore::new());
        store.store_cursor(&mut store.begin_tx().unwrap(), 7).unwrap();
        let client = Arc::new(ScriptedNetworkClient::new());
        ok_health(&client);
        client.gate_changes();

        let (coordinator, _observer) = coordinator(store.clone(), client.clone());
        let coordinator = Arc::new(coordinator);
        let runner = coordinator.clone();
        let pass = tokio::spawn(async move { runner.perform_sync().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.stop();

        let outcome = pass.await.unwrap();
        assert!(matches!(outcome, PassOutcome::Cancelled));
        assert_eq!(store.load_cursor().unwrap(), 7);
    }
}
