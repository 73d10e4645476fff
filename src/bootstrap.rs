//! BootstrapFetch (§4.4): first-time full download with relationship
//! reconstruction.
//!
//! New relative to the teacher (no direct analogue in `less_db::sync`), but
//! grounded in its upsert-by-id idempotent-apply convention — extended here
//! to an ordered, multi-entity fetch with a bounded-parallel read phase.

use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::error::SyncError;
use crate::mutation::EntityKind;
use crate::network::NetworkClient;
use crate::store::DataStore;

/// Fixed per §4.4: PropertyDefinitions depend on EventTypes; Events may
/// reference EventTypes and Geofences.
const ENTITY_ORDER: [EntityKind; 4] = [EntityKind::EventType, EntityKind::Geofence, EntityKind::Event, EntityKind::PropertyDef];

/// Max concurrently in-flight bootstrap page fetches (§5: "bounded parallel
/// fetch of up to 4 pages during Bootstrap for read-only endpoints").
const MAX_CONCURRENT_PAGE_FETCHES: usize = 4;

#[derive(Debug, Default, Clone, Copy)]
pub struct BootstrapCounts {
    pub event_types: usize,
    pub geofences: usize,
    pub events: usize,
    pub property_defs: usize,
}

pub struct BootstrapFetcher<'a> {
    client: &'a dyn NetworkClient,
    store: &'a dyn DataStore,
    page_limit: usize,
}

impl<'a> BootstrapFetcher<'a> {
    pub fn new(client: &'a dyn NetworkClient, store: &'a dyn DataStore, page_limit: usize) -> Self {
        Self { client, store, page_limit }
    }

    /// Runs the full bootstrap: nuclear-cleanup precondition, ordered
    /// per-entity paged fetch with upsert-by-id, cursor set to the head
    /// captured before fetching began.
    pub async fn run(&self, cancel: &CancelSignal) -> Result<BootstrapCounts, SyncError> {
        if self.store_needs_nuclear_cleanup()? {
            self.nuclear_cleanup()?;
        }

        let head_cursor = self
            .client
            .get_latest_cursor()
            .await
            .map_err(|source| SyncError::Network { context: "bootstrap latest-cursor", source })?;

        let mut counts = BootstrapCounts::default();
        for entity in ENTITY_ORDER {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let fetched = self.fetch_entity(entity).await?;
            self.store_entity_count(entity, fetched, &mut counts);
        }

        let mut tx = self.store.begin_tx().map_err(store_err)?;
        self.store.store_cursor(&mut tx, head_cursor).map_err(store_err)?;
        self.store.commit_tx(tx).map_err(store_err)?;

        Ok(counts)
    }

    fn store_needs_nuclear_cleanup(&self) -> Result<bool, SyncError> {
        let cursor = self.store.load_cursor().map_err(store_err)?;
        let empty = self.store.is_empty().map_err(store_err)?;
        Ok(cursor == 0 && !empty)
    }

    /// Transactional delete-all when a non-empty store has no cursor — a
    /// detected schema reset (§4.4). The caller is expected to surface the
    /// "post-migration resync" flag to the UI out of band.
    fn nuclear_cleanup(&self) -> Result<(), SyncError> {
        tracing::warn!("non-empty store with absent cursor detected; performing nuclear cleanup before bootstrap");
        let mut tx = self.store.begin_tx().map_err(store_err)?;
        self.store.delete_all(&mut tx).map_err(store_err)?;
        self.store.commit_tx(tx).map_err(store_err)?;
        Ok(())
    }

    /// Fetches one entity kind page-by-page, up to
    /// `MAX_CONCURRENT_PAGE_FETCHES` requests in flight at once. Pages are
    /// read-only network calls; application to the store still happens in
    /// fetch order so upserts land deterministically.
    async fn fetch_entity(&self, entity: EntityKind) -> Result<usize, SyncError> {
        let mut offset = 0usize;
        let mut total = 0usize;

        loop {
            let mut in_flight = Vec::with_capacity(MAX_CONCURRENT_PAGE_FETCHES);
            for i in 0..MAX_CONCURRENT_PAGE_FETCHES {
                let page_offset = offset + i * self.page_limit;
                in_flight.push(self.client.fetch_bootstrap_page(entity, page_offset, self.page_limit));
            }

            let pages = futures::future::join_all(in_flight).await;
            let mut exhausted = false;
            for page in pages {
                let page = page.map_err(|source| SyncError::Network { context: "bootstrap page", source })?;
                let mut tx = self.store.begin_tx().map_err(store_err)?;
                for item in &page.items {
                    let id = extract_id(item)?;
                    self.store.upsert_entity(&mut tx, entity, id, item).map_err(store_err)?;
                }
                self.store.commit_tx(tx).map_err(store_err)?;
                total += page.items.len();
                if !page.has_more {
                    exhausted = true;
                }
            }

            if exhausted {
                break;
            }
            offset += MAX_CONCURRENT_PAGE_FETCHES * self.page_limit;
        }

        Ok(total)
    }

    fn store_entity_count(&self, entity: EntityKind, fetched: usize, counts: &mut BootstrapCounts) {
        match entity {
            EntityKind::EventType => counts.event_types = fetched,
            EntityKind::Geofence => counts.geofences = fetched,
            EntityKind::Event => counts.events = fetched,
            EntityKind::PropertyDef => counts.property_defs = fetched,
        }
    }
}

fn extract_id(item: &serde_json::Value) -> Result<Uuid, SyncError> {
    item.get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| SyncError::Fatal {
            kind: crate::error::FatalKind::CorruptSchema,
            detail: "bootstrap page item missing a valid id".to_string(),
        })
}

fn store_err(err: crate::store::StoreError) -> SyncError {
    SyncError::Fatal { kind: crate::error::FatalKind::CorruptSchema, detail: err.to_string() }
}
