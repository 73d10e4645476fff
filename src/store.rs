//! DataStore contract (§4.8) — consumed, not implemented. A host app backs
//! this with whatever local persistence it has; the coordinator only ever
//! calls this narrow trait, synchronously, within a transaction it never
//! holds across a network call.
//!
//! Modeled after `less_db::sync::types::SyncAdapter`: a narrow, synchronous
//! interface so it can be used as `Arc<dyn DataStore>` from the async
//! coordinator without forcing the storage layer itself to be async.

use serde_json::Value;
use uuid::Uuid;

use crate::mutation::{EntityKind, PendingMutation};
use crate::network::Change;

/// Opaque transaction handle. The coordinator never inspects it; it only
/// threads it through `begin_tx`/`commit_tx` pairs so a `DataStore`
/// implementation can use a real database transaction underneath.
pub struct Tx(pub Box<dyn std::any::Any + Send>);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("entity {entity:?} {id} not found")]
    NotFound { entity: EntityKind, id: Uuid },
    #[error("store is in an inconsistent state: {0}")]
    Inconsistent(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Whether a delete removes the row entirely or leaves a tombstone (I4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    Soft,
    Hard,
}

/// Local persistence contract consumed by `SyncCoordinator`, `MutationQueue`,
/// `ChangeFeed`, and `BootstrapFetcher`.
pub trait DataStore: Send + Sync {
    fn begin_tx(&self) -> StoreResult<Tx>;
    fn commit_tx(&self, tx: Tx) -> StoreResult<()>;
    fn rollback_tx(&self, tx: Tx) -> StoreResult<()>;

    /// Upsert a decoded entity payload by id (used by both local-write
    /// autofill and change-feed apply).
    fn upsert_entity(&self, tx: &mut Tx, entity: EntityKind, id: Uuid, payload: &Value) -> StoreResult<()>;

    fn delete_entity_by_id(&self, tx: &mut Tx, entity: EntityKind, id: Uuid, mode: DeleteMode) -> StoreResult<()>;

    /// Reconciles a local id to a server-assigned id after I6 idempotent
    /// replay returns a pre-existing row.
    fn reconcile_id(&self, tx: &mut Tx, entity: EntityKind, local_id: Uuid, server_id: Uuid) -> StoreResult<()>;

    /// Returns up to `limit` pending mutations that are neither removed nor
    /// quarantined.
    fn list_pending_mutations(&self, limit: usize) -> StoreResult<Vec<PendingMutation>>;
    fn enqueue_pending(&self, tx: &mut Tx, mutation: &PendingMutation) -> StoreResult<()>;
    fn remove_pending(&self, tx: &mut Tx, mutation_id: Uuid) -> StoreResult<()>;
    fn increment_attempt(&self, tx: &mut Tx, mutation_id: Uuid) -> StoreResult<u32>;
    /// Marks a mutation quarantined immediately (validation failure) or
    /// after it exhausts `mutation_max_attempts`. A quarantined mutation is
    /// excluded from future `list_pending_mutations` calls and never
    /// retried automatically (§7 `ValidationFailed`/`Exhausted`).
    fn quarantine_mutation(&self, tx: &mut Tx, mutation_id: Uuid) -> StoreResult<()>;

    fn load_cursor(&self) -> StoreResult<i64>;
    fn store_cursor(&self, tx: &mut Tx, cursor: i64) -> StoreResult<()>;

    fn fetch_count(&self, entity: EntityKind) -> StoreResult<usize>;
    fn is_empty(&self) -> StoreResult<bool>;

    /// Transactional delete-all, used by the bootstrap nuclear-cleanup
    /// precondition (§4.4) when a non-empty store has no cursor.
    fn delete_all(&self, tx: &mut Tx) -> StoreResult<()>;

    /// Applies one already-fetched change within `tx`. Tombstones
    /// (`ChangeOp::Delete`) take precedence over same-id inserts from
    /// earlier in the same page, per §4.3.
    fn apply_change(&self, tx: &mut Tx, change: &Change) -> StoreResult<()>;
}
