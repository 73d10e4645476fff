//! ChangeFeed (§4.3): pages server-side changes from a durable cursor and
//! applies them to the `DataStore`, one transaction per page.
//!
//! Grounded on the teacher's `RemoteRecord`/`apply_remote_changes` shape in
//! `less_db::sync::types`, generalized to this spec's explicit
//! insert/update/delete `Change` enum and page-at-a-time cursor advance.

pub use crate::network::{Change, ChangeOp, Page};

use std::collections::HashMap;

use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::error::{FatalKind, SyncError};
use crate::network::NetworkClient;
use crate::store::DataStore;

pub struct ChangeFeed<'a> {
    client: &'a dyn NetworkClient,
    store: &'a dyn DataStore,
    pull_page_limit: usize,
    max_pages_per_sync: usize,
}

#[derive(Debug, Default)]
pub struct PullOutcome {
    pub applied: usize,
    pub pages: usize,
    pub cursor: i64,
}

impl<'a> ChangeFeed<'a> {
    pub fn new(client: &'a dyn NetworkClient, store: &'a dyn DataStore, pull_page_limit: usize, max_pages_per_sync: usize) -> Self {
        Self { client, store, pull_page_limit, max_pages_per_sync }
    }

    /// Loops `GET /changes?since=cursor&limit=...` until `has_more=false` or
    /// the safety cap (§4.3) is reached. Remaining pages beyond the cap roll
    /// into the next trigger — this is not an error.
    pub async fn pull(&self, mut cursor: i64, cancel: &CancelSignal) -> Result<PullOutcome, SyncError> {
        let mut outcome = PullOutcome { cursor, ..Default::default() };

        for _ in 0..self.max_pages_per_sync {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let cursor_before = cursor;
            // Races the in-flight request against cancellation so a `stop()`
            // mid-page abandons the request rather than awaiting it to
            // completion and committing a page after the fact (§5, P7).
            let page = tokio::select! {
                result = self.client.get_changes(cursor, self.pull_page_limit) => {
                    result.map_err(|source| SyncError::Network { context: "pull page", source })?
                }
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            };

            let applied = self.apply_page(&page)?;
            outcome.applied += applied;
            outcome.pages += 1;
            cursor = page.next_cursor;
            outcome.cursor = cursor;
            tracing::debug!(
                page = outcome.pages,
                cursor_before,
                cursor_after = cursor,
                applied,
                has_more = page.has_more,
                "pull page applied"
            );

            if !page.has_more {
                break;
            }
        }

        Ok(outcome)
    }

    /// Applies one page within a single transaction. Per-id monotonicity
    /// (Open Question decision in DESIGN.md) is checked before any row is
    /// touched, so a violated page aborts without partial commit (I3).
    fn apply_page(&self, page: &Page) -> Result<usize, SyncError> {
        let mut last_seen: HashMap<Uuid, i64> = HashMap::new();
        for change in &page.changes {
            if let Some(&previous) = last_seen.get(&change.id) {
                if change.change_id <= previous {
                    return Err(SyncError::Fatal {
                        kind: FatalKind::NonMonotonicChangeLog,
                        detail: format!("change_id {} did not increase after {previous} for id {}", change.change_id, change.id),
                    });
                }
            }
            last_seen.insert(change.id, change.change_id);
        }

        let mut tx = self.store.begin_tx().map_err(store_err)?;
        for change in &page.changes {
            self.store.apply_change(&mut tx, change).map_err(store_err)?;
        }
        self.store.store_cursor(&mut tx, page.next_cursor).map_err(store_err)?;
        self.store.commit_tx(tx).map_err(store_err)?;

        Ok(page.changes.len())
    }
}

fn store_err(err: crate::store::StoreError) -> SyncError {
    SyncError::Fatal { kind: FatalKind::CorruptSchema, detail: err.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::EntityKind;
    use crate::testing::{InMemoryStore, ScriptedNetworkClient};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn tombstone_takes_precedence_over_earlier_insert() {
        let store = InMemoryStore::new();
        let client = ScriptedNetworkClient::new();
        let id = Uuid::now_v7();

        client.push_changes_page(Page {
            changes: vec![
                Change { op: ChangeOp::Delete, entity: EntityKind::Event, id, payload: None, server_rev: 1, change_id: 10 },
                Change {
                    op: ChangeOp::Insert,
                    entity: EntityKind::Event,
                    id,
                    payload: Some(json!({"notes": "resurfaced"})),
                    server_rev: 2,
                    change_id: 11,
                },
            ],
            next_cursor: 11,
            has_more: false,
        });

        let feed = ChangeFeed::new(&client, &store, 500, 20);
        let cancel = CancelSignal::new();
        let outcome = feed.pull(0, &cancel).await.unwrap();

        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.cursor, 11);
        assert!(store.contains(EntityKind::Event, id));
        assert!(!store.is_deleted(EntityKind::Event, id));
    }

    #[tokio::test]
    async fn non_monotonic_change_id_is_fatal() {
        let store = InMemoryStore::new();
        let client = ScriptedNetworkClient::new();
        let id = Uuid::now_v7();
        client.push_changes_page(Page {
            changes: vec![
                Change { op: ChangeOp::Insert, entity: EntityKind::Event, id, payload: Some(json!({})), server_rev: 1, change_id: 5 },
                Change { op: ChangeOp::Update, entity: EntityKind::Event, id, payload: Some(json!({})), server_rev: 2, change_id: 5 },
            ],
            next_cursor: 5,
            has_more: false,
        });

        let feed = ChangeFeed::new(&client, &store, 500, 20);
        let cancel = CancelSignal::new();
        let result = feed.pull(0, &cancel).await;
        assert!(matches!(result, Err(SyncError::Fatal { kind: FatalKind::NonMonotonicChangeLog, .. })));
        // Nothing from the violating page was committed.
        assert!(!store.contains(EntityKind::Event, id));
    }

    #[tokio::test]
    async fn safety_cap_stops_after_max_pages() {
        let store = InMemoryStore::new();
        let client = ScriptedNetworkClient::new();
        for page_no in 0..25 {
            client.push_changes_page(Page { changes: vec![], next_cursor: page_no + 1, has_more: true });
        }
        let feed = ChangeFeed::new(&client, &store, 500, 20);
        let cancel = CancelSignal::new();
        let outcome = feed.pull(0, &cancel).await.unwrap();
        assert_eq!(outcome.pages, 20);
    }

    /// P7: a stop that lands while a page's `get_changes` is in flight must
    /// abandon that page rather than let it land and advance the cursor.
    #[tokio::test]
    async fn stop_during_in_flight_page_leaves_cursor_unchanged() {
        let store = InMemoryStore::new();
        store.store_cursor(&mut store.begin_tx().unwrap(), 7).unwrap();
        let client = ScriptedNetworkClient::new();
        client.gate_changes();

        let feed = ChangeFeed::new(&client, &store, 500, 20);
        let cancel = CancelSignal::new();
        let canceller = cancel.clone();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = feed.pull(7, &cancel).await;
        stopper.await.unwrap();

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(store.load_cursor().unwrap(), 7);
    }
}
