//! MutationQueue & batching (§4.2).
//!
//! Grounded on `less_db::sync::manager`'s batching (`push_batch_size`,
//! `quarantine_threshold` in `SyncManagerOptions`), generalized from a
//! single homogeneous push to this spec's split between batched event
//! creates and one-by-one non-event mutations.

use std::collections::HashMap;

use uuid::Uuid;

use crate::mutation::{EntityKind, MutationKind, PendingMutation};

/// A batch of mutations ready to send, split per §4.2's batch policy.
#[derive(Debug, Default)]
pub struct Batch {
    /// Up to `batch_size` event creates, sent in one `POST /events/batch`.
    pub event_creates: Vec<PendingMutation>,
    /// Every other mutation (updates, deletes, and non-event creates),
    /// sent one at a time in order.
    pub singles: Vec<PendingMutation>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.event_creates.is_empty() && self.singles.is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.event_creates.len() + self.singles.len()
    }
}

/// In-memory view over the store's pending-mutation table: applies
/// deduplication (I1, I2) before a mutation is considered enqueued, and
/// builds `Batch`es according to the §4.2 policy.
pub struct MutationQueue {
    batch_size: usize,
}

impl MutationQueue {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }

    /// Applies I1/I2 coalescing to a freshly-loaded queue and, if the net
    /// effect is "nothing to send" for some target (I2: create then
    /// delete), drops both. Returns the surviving mutations along with the
    /// set of target ids that collapsed to zero (so the caller can hard-
    /// remove the local row, per I2).
    pub fn coalesce(pending: Vec<PendingMutation>) -> CoalesceResult {
        let mut by_key: HashMap<(EntityKind, Uuid), Vec<PendingMutation>> = HashMap::new();
        for mutation in pending {
            by_key.entry((mutation.entity, mutation.target_id)).or_default().push(mutation);
        }

        let mut survivors = Vec::new();
        let mut collapsed = Vec::new();

        for ((entity, target_id), mut group) in by_key {
            group.sort_by_key(|m| m.created_ts);

            let has_create = group.iter().any(|m| m.kind == MutationKind::Create);
            let has_delete = group.iter().any(|m| m.kind == MutationKind::Delete);

            if has_create && has_delete {
                // I2: create immediately followed by delete collapses to nothing.
                collapsed.push((entity, target_id));
                continue;
            }

            // I1: coalesce same-kind duplicates, last-write-wins on payload,
            // earliest created_ts retained.
            let mut by_kind: HashMap<MutationKind, PendingMutation> = HashMap::new();
            for mutation in group {
                by_kind
                    .entry(mutation.kind)
                    .and_modify(|existing| {
                        existing.payload = mutation.payload.clone();
                        // earliest created_ts retained — no-op if existing is already earlier.
                        if mutation.created_ts < existing.created_ts {
                            existing.created_ts = mutation.created_ts;
                        }
                    })
                    .or_insert(mutation);
            }

            let mut remaining: Vec<PendingMutation> = by_kind.into_values().collect();
            remaining.sort_by_key(|m| m.created_ts);
            survivors.extend(remaining);
        }

        CoalesceResult { survivors, collapsed_targets: collapsed }
    }

    /// Builds the next batch from an already-coalesced, ordering-applied
    /// mutation list: creates before updates before deletes, within kind by
    /// `created_ts` (§4.2 Ordering guarantee).
    pub fn next_batch(&self, mut pending: Vec<PendingMutation>) -> Batch {
        pending.sort_by_key(order_key);

        let mut batch = Batch::default();
        for mutation in pending {
            if mutation.entity == EntityKind::Event && mutation.kind == MutationKind::Create {
                if batch.event_creates.len() < self.batch_size {
                    batch.event_creates.push(mutation);
                }
                // Extra creates beyond batch_size stay in the store and are
                // picked up by the next `next_batch` call within the pass
                // (ChangeFeed-style paging, not dropped).
            } else {
                batch.singles.push(mutation);
            }
        }
        batch
    }
}

fn order_key(m: &PendingMutation) -> (u8, chrono::DateTime<chrono::Utc>) {
    let kind_rank = match m.kind {
        MutationKind::Create => 0,
        MutationKind::Update => 1,
        MutationKind::Delete => 2,
    };
    (kind_rank, m.created_ts)
}

pub struct CoalesceResult {
    pub survivors: Vec<PendingMutation>,
    /// Entity/target ids whose create+delete pair collapsed to zero
    /// mutations; the caller hard-removes these local rows (I2).
    pub collapsed_targets: Vec<(EntityKind, Uuid)>,
}
