//! Configuration record (§6): tunables for batching, backoff, and timeouts.
//!
//! Mirrors `less_db::sync::types::SyncManagerOptions` in shape — a plain
//! struct with a `Default` impl matching the documented defaults, meant to be
//! constructed with `..Default::default()` and a few overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the sync engine. All durations are typed `Duration` in the
/// in-memory API; `serde` field renames keep the on-disk/wire field names
/// matching the millisecond-suffixed names in the spec table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Max events per `POST /events/batch` call.
    pub batch_size: usize,
    /// Max changes per `GET /changes` page.
    pub pull_page_limit: usize,
    /// Safety cap on pull pages per sync pass.
    pub max_pages_per_sync: usize,
    /// Consecutive 429s before the circuit breaker trips.
    pub circuit_threshold: u32,
    /// Backoff base, in milliseconds.
    #[serde(rename = "base_backoff_ms")]
    pub base_backoff: DurationMs,
    /// Backoff cap, in milliseconds.
    #[serde(rename = "max_backoff_ms")]
    pub max_backoff: DurationMs,
    /// Per-mutation retry cap before quarantine.
    pub mutation_max_attempts: u32,
    /// Per-pass wall-clock deadline, in milliseconds.
    #[serde(rename = "sync_total_deadline_ms")]
    pub sync_total_deadline: DurationMs,
    /// Health probe cache TTL, in milliseconds.
    #[serde(rename = "health_ttl_ms")]
    pub health_ttl: DurationMs,
    /// Max future clock drift tolerated at submission before it's reported (I5).
    #[serde(rename = "max_future_drift_ms")]
    pub max_future_drift: DurationMs,
    /// Max jitter added on top of circuit-breaker backoff.
    #[serde(rename = "backoff_jitter_ms")]
    pub backoff_jitter: DurationMs,
    /// Max active geofences (device limit).
    pub max_active_geofences: usize,
    /// Size of the `sync_history` ring buffer.
    pub history_capacity: usize,
    /// Age past which a buffered background-launch event is dropped instead
    /// of replayed (§5).
    #[serde(rename = "replay_buffer_max_age_ms")]
    pub replay_buffer_max_age: DurationMs,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            pull_page_limit: 500,
            max_pages_per_sync: 20,
            circuit_threshold: 3,
            base_backoff: DurationMs(Duration::from_secs(10)),
            max_backoff: DurationMs(Duration::from_secs(300)),
            mutation_max_attempts: 5,
            sync_total_deadline: DurationMs(Duration::from_secs(120)),
            health_ttl: DurationMs(Duration::from_secs(30)),
            max_future_drift: DurationMs(Duration::from_secs(60)),
            backoff_jitter: DurationMs(Duration::from_millis(250)),
            max_active_geofences: 20,
            history_capacity: 10,
            replay_buffer_max_age: DurationMs(Duration::from_secs(5 * 60)),
        }
    }
}

/// `Duration` newtype that (de)serializes as a plain millisecond integer,
/// so the wire format matches the `*_ms` field names in §6 while the
/// in-memory type stays a real `Duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DurationMs(pub Duration);

impl From<DurationMs> for Duration {
    fn from(value: DurationMs) -> Self {
        value.0
    }
}

impl Serialize for DurationMs {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0.as_millis() as u64)
    }
}

impl<'de> Deserialize<'de> for DurationMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(DurationMs(Duration::from_millis(millis)))
    }
}
