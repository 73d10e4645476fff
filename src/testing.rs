//! Test fakes (§13): an in-memory `DataStore`, a scripted `NetworkClient`, a
//! fixed/steppable `Clock`, and a `ProgressSink` event recorder.
//!
//! Grounded on the fake-over-mock style visible in the teacher lineage: the
//! injected `SyncAdapter`/`SyncTransport` pair in `less_db::sync` and the
//! deterministic test fixtures in `betterbase_sync_core`'s KDF tests. No
//! mocking framework — plain structs driven by canned data queues.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::clock::Clock;
use crate::mutation::{EntityKind, MutationKind, PendingMutation};
use crate::network::{BatchItem, BatchItemResult, BatchItemStatus, BatchResponse, BootstrapPage, Change, ChangeOp, HealthResponse, NetworkClient, NetworkError, Page};
use crate::progress::{ProgressObserver, SyncEvent};
use crate::store::{DataStore, DeleteMode, StoreError, StoreResult, Tx};

// ============================================================================
// FixedClock
// ============================================================================

/// A clock whose wall-clock time only moves when the test calls `advance`.
pub struct FixedClock {
    utc: Mutex<DateTime<Utc>>,
    mono: Mutex<Instant>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { utc: Mutex::new(start), mono: Mutex::new(Instant::now()) }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        *self.utc.lock() += delta;
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.utc.lock()
    }

    fn monotonic_now(&self) -> Instant {
        *self.mono.lock()
    }
}

// ============================================================================
// InMemoryStore
// ============================================================================

#[derive(Default)]
struct StoreState {
    entities: HashMap<(EntityKind, Uuid), (Value, bool)>, // (payload, deleted)
    pending: HashMap<Uuid, PendingMutation>,
    cursor: i64,
}

/// `DataStore` backed by a `parking_lot::Mutex`-guarded in-memory map, in the
/// style of `less_db::storage::memory_mapped::MemoryMapped`. `Tx` is unused
/// here (no real transaction boundary) beyond carrying a unit marker.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, entity: EntityKind, id: Uuid) -> bool {
        self.state.lock().entities.contains_key(&(entity, id))
    }

    pub fn is_deleted(&self, entity: EntityKind, id: Uuid) -> bool {
        self.state.lock().entities.get(&(entity, id)).map(|(_, deleted)| *deleted).unwrap_or(false)
    }

    pub fn payload(&self, entity: EntityKind, id: Uuid) -> Option<Value> {
        self.state.lock().entities.get(&(entity, id)).map(|(payload, _)| payload.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.values().filter(|m| !m.quarantined).count()
    }

    pub fn quarantined_count(&self) -> usize {
        self.state.lock().pending.values().filter(|m| m.quarantined).count()
    }

    pub fn seed_pending(&self, mutation: PendingMutation) {
        self.state.lock().pending.insert(mutation.id, mutation);
    }

    /// Seeds a non-empty store with no cursor, to exercise the bootstrap
    /// nuclear-cleanup precondition (§4.4).
    pub fn seed_nonempty_without_cursor(&self) {
        let mut state = self.state.lock();
        state.entities.insert((EntityKind::Event, Uuid::now_v7()), (json!({"stale": true}), false));
        state.cursor = 0;
    }
}

fn tx() -> Tx {
    Tx(Box::new(()))
}

impl DataStore for InMemoryStore {
    fn begin_tx(&self) -> StoreResult<Tx> {
        Ok(tx())
    }

    fn commit_tx(&self, _tx: Tx) -> StoreResult<()> {
        Ok(())
    }

    fn rollback_tx(&self, _tx: Tx) -> StoreResult<()> {
        Ok(())
    }

    fn upsert_entity(&self, _tx: &mut Tx, entity: EntityKind, id: Uuid, payload: &Value) -> StoreResult<()> {
        self.state.lock().entities.insert((entity, id), (payload.clone(), false));
        Ok(())
    }

    fn delete_entity_by_id(&self, _tx: &mut Tx, entity: EntityKind, id: Uuid, mode: DeleteMode) -> StoreResult<()> {
        let mut state = self.state.lock();
        match mode {
            DeleteMode::Soft => {
                state.entities.entry((entity, id)).or_insert_with(|| (Value::Null, false)).1 = true;
            }
            DeleteMode::Hard => {
                state.entities.remove(&(entity, id));
            }
        }
        Ok(())
    }

    fn reconcile_id(&self, _tx: &mut Tx, entity: EntityKind, local_id: Uuid, server_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some(value) = state.entities.remove(&(entity, local_id)) {
            state.entities.insert((entity, server_id), value);
        }
        Ok(())
    }

    fn list_pending_mutations(&self, limit: usize) -> StoreResult<Vec<PendingMutation>> {
        let state = self.state.lock();
        let mut mutations: Vec<_> = state.pending.values().filter(|m| !m.quarantined).cloned().collect();
        mutations.sort_by_key(|m| m.created_ts);
        mutations.truncate(limit);
        Ok(mutations)
    }

    fn enqueue_pending(&self, _tx: &mut Tx, mutation: &PendingMutation) -> StoreResult<()> {
        self.state.lock().pending.insert(mutation.id, mutation.clone());
        Ok(())
    }

    fn remove_pending(&self, _tx: &mut Tx, mutation_id: Uuid) -> StoreResult<()> {
        self.state.lock().pending.remove(&mutation_id);
        Ok(())
    }

    fn increment_attempt(&self, _tx: &mut Tx, mutation_id: Uuid) -> StoreResult<u32> {
        let mut state = self.state.lock();
        let mutation = state
            .pending
            .get_mut(&mutation_id)
            .ok_or_else(|| StoreError::Inconsistent(format!("unknown mutation {mutation_id}")))?;
        mutation.attempts += 1;
        mutation.last_attempt_ts = Some(Utc::now());
        Ok(mutation.attempts)
    }

    fn quarantine_mutation(&self, _tx: &mut Tx, mutation_id: Uuid) -> StoreResult<()> {
        if let Some(mutation) = self.state.lock().pending.get_mut(&mutation_id) {
            mutation.quarantined = true;
        }
        Ok(())
    }

    fn load_cursor(&self) -> StoreResult<i64> {
        Ok(self.state.lock().cursor)
    }

    fn store_cursor(&self, _tx: &mut Tx, cursor: i64) -> StoreResult<()> {
        self.state.lock().cursor = cursor;
        Ok(())
    }

    fn fetch_count(&self, entity: EntityKind) -> StoreResult<usize> {
        Ok(self.state.lock().entities.keys().filter(|(e, _)| *e == entity).count())
    }

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.state.lock().entities.is_empty())
    }

    fn delete_all(&self, _tx: &mut Tx) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.entities.clear();
        state.pending.clear();
        Ok(())
    }

    fn apply_change(&self, _tx: &mut Tx, change: &Change) -> StoreResult<()> {
        let mut state = self.state.lock();
        match change.op {
            ChangeOp::Insert | ChangeOp::Update => {
                let payload = change.payload.clone().unwrap_or(Value::Null);
                state.entities.insert((change.entity, change.id), (payload, false));
            }
            ChangeOp::Delete => {
                state.entities.insert((change.entity, change.id), (Value::Null, true));
            }
        }
        Ok(())
    }
}

// ============================================================================
// ScriptedNetworkClient
// ============================================================================

/// `NetworkClient` driven entirely by canned responses queued before the
/// call under test runs — "429, 429, 429, 200" scripted as four
/// `push_batch_response` calls.
#[derive(Default)]
pub struct ScriptedNetworkClient {
    health: Mutex<VecDeque<HealthResponse>>,
    changes_pages: Mutex<VecDeque<Page>>,
    latest_cursor: AtomicI64,
    bootstrap_pages: Mutex<HashMap<EntityKind, VecDeque<BootstrapPage<Value>>>>,
    batch_responses: Mutex<VecDeque<Result<BatchResponse, NetworkError>>>,
    single_responses: Mutex<VecDeque<Result<Option<Uuid>, NetworkError>>>,
    batch_call_count: AtomicI64,
    changes_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedNetworkClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_health(&self, response: HealthResponse) {
        self.health.lock().push_back(response);
    }

    pub fn push_changes_page(&self, page: Page) {
        self.changes_pages.lock().push_back(page);
    }

    pub fn set_latest_cursor(&self, cursor: i64) {
        self.latest_cursor.store(cursor, Ordering::SeqCst);
    }

    /// Schedules a single-page bootstrap response per entity kind, with
    /// `count` synthetic items each carrying a fresh uuid `id`.
    pub fn set_bootstrap_counts(&self, event_types: usize, geofences: usize, events: usize, property_defs: usize) {
        let mut pages = self.bootstrap_pages.lock();
        for (entity, count) in [
            (EntityKind::EventType, event_types),
            (EntityKind::Geofence, geofences),
            (EntityKind::Event, events),
            (EntityKind::PropertyDef, property_defs),
        ] {
            let items = (0..count).map(|_| json!({"id": Uuid::now_v7().to_string()})).collect();
            pages.entry(entity).or_default().push_back(BootstrapPage { items, has_more: false });
        }
    }

    pub fn push_batch_response(&self, response: Result<BatchResponse, NetworkError>) {
        self.batch_responses.lock().push_back(response);
    }

    pub fn push_single_response(&self, response: Result<Option<Uuid>, NetworkError>) {
        self.single_responses.lock().push_back(response);
    }

    pub fn batch_call_count(&self) -> i64 {
        self.batch_call_count.load(Ordering::SeqCst)
    }

    /// Makes the next `get_changes` call hang until cancelled or dropped,
    /// simulating an in-flight request for cancellation-race tests (P7).
    pub fn gate_changes(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.changes_gate.lock() = Some(notify.clone());
        notify
    }
}

#[async_trait]
impl NetworkClient for ScriptedNetworkClient {
    async fn post_event_batch(&self, items: &[BatchItem]) -> Result<BatchResponse, NetworkError> {
        self.batch_call_count.fetch_add(1, Ordering::SeqCst);
        match self.batch_responses.lock().pop_front() {
            Some(scripted) => scripted,
            None => Ok(BatchResponse {
                success: items.len(),
                failed: 0,
                items: items
                    .iter()
                    .map(|item| BatchItemResult { target_id: item.target_id, status: BatchItemStatus::Ok, server_id: Some(item.target_id), error: None })
                    .collect(),
            }),
        }
    }

    async fn send_single_mutation(
        &self,
        _entity: EntityKind,
        _kind: MutationKind,
        target_id: Uuid,
        _idempotency_key: &str,
        _payload: &Value,
    ) -> Result<Option<Uuid>, NetworkError> {
        match self.single_responses.lock().pop_front() {
            Some(scripted) => scripted,
            None => Ok(Some(target_id)),
        }
    }

    async fn get_changes(&self, since: i64, limit: usize) -> Result<Page, NetworkError> {
        let gate = self.changes_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        match self.changes_pages.lock().pop_front() {
            Some(page) => Ok(page),
            None => Ok(Page { changes: vec![], next_cursor: since, has_more: false }),
        }
        .map(|page| {
            // Defensive clamp so a misconfigured test fixture can't exceed
            // the requested page size.
            let mut page = page;
            page.changes.truncate(limit);
            page
        })
    }

    async fn get_latest_cursor(&self) -> Result<i64, NetworkError> {
        Ok(self.latest_cursor.load(Ordering::SeqCst))
    }

    async fn fetch_bootstrap_page(&self, entity: EntityKind, _offset: usize, _limit: usize) -> Result<BootstrapPage<Value>, NetworkError> {
        let mut pages = self.bootstrap_pages.lock();
        match pages.entry(entity).or_default().pop_front() {
            Some(page) => Ok(page),
            None => Ok(BootstrapPage { items: vec![], has_more: false }),
        }
    }

    async fn health_check(&self) -> Result<HealthResponse, NetworkError> {
        match self.health.lock().pop_front() {
            Some(response) => Ok(response),
            None => Ok(HealthResponse { status: 200, content_type: Some("application/json".into()), body: "{\"ok\":true}".into() }),
        }
    }
}

// ============================================================================
// RecordingProgressSink
// ============================================================================

/// Drains a `ProgressObserver` on a background task, appending every event
/// to a shared `Vec` a test can assert against.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<SyncEvent>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl EventRecorder {
    pub fn spawn(mut observer: ProgressObserver) -> Self {
        let events = Arc::new(Mutex::new(vec![observer.current()]));
        let events_clone = events.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = observer.changed().await {
                events_clone.lock().push(event);
            }
        });
        Self { events, _task: task }
    }

    pub fn snapshot(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }
}
