//! PendingMutation (§3) and the idempotency key derivation used by the
//! MutationQueue (§4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Event,
    EventType,
    Geofence,
    PropertyDef,
}

/// A queued local change awaiting server acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub kind: MutationKind,
    pub entity: EntityKind,
    pub target_id: Uuid,
    pub payload: Value,
    pub attempts: u32,
    pub last_attempt_ts: Option<DateTime<Utc>>,
    pub created_ts: DateTime<Utc>,
    pub idempotency_key: String,
    /// Set once the mutation is exhausted (attempts cap) or immediately on
    /// a validation failure; a quarantined mutation is never retried
    /// automatically and is excluded from `DataStore::list_pending_mutations`.
    pub quarantined: bool,
}

impl PendingMutation {
    /// Builds a new, unsent mutation. Creates get a stable idempotency key
    /// derived from `(target_id, created_ts)` so a retried POST is
    /// recognized by the server as the same write (I6).
    pub fn new(kind: MutationKind, entity: EntityKind, target_id: Uuid, payload: Value, created_ts: DateTime<Utc>) -> Self {
        let idempotency_key = idempotency_key(target_id, created_ts);
        Self {
            id: Uuid::now_v7(),
            kind,
            entity,
            target_id,
            payload,
            attempts: 0,
            last_attempt_ts: None,
            created_ts,
            idempotency_key,
            quarantined: false,
        }
    }

    pub fn exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}

/// `hash(target_id || created_ts)` per §4.2 — deterministic so the same
/// logical write always produces the same key across retries and process
/// restarts.
pub fn idempotency_key(target_id: Uuid, created_ts: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target_id.as_bytes());
    hasher.update(created_ts.timestamp_micros().to_be_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic() {
        let id = Uuid::now_v7();
        let ts = Utc::now();
        assert_eq!(idempotency_key(id, ts), idempotency_key(id, ts));
    }

    #[test]
    fn idempotency_key_differs_by_target() {
        let ts = Utc::now();
        assert_ne!(idempotency_key(Uuid::now_v7(), ts), idempotency_key(Uuid::now_v7(), ts));
    }

    #[test]
    fn exhaustion_threshold() {
        let mut m = PendingMutation::new(MutationKind::Create, EntityKind::Event, Uuid::now_v7(), Value::Null, Utc::now());
        assert!(!m.exhausted(5));
        m.attempts = 5;
        assert!(m.exhausted(5));
    }
}
