//! Error taxonomy (§7, §11).
//!
//! Mirrors the split in `betterbase_sync_core::error::SyncError`: leaf
//! errors per failing component, `#[from]` where a lower-level error maps
//! 1:1 onto a variant, and an explicit context struct where the coordinator
//! needs to say *which* batch/mutation/page failed.

use uuid::Uuid;

use crate::network::NetworkError;

/// The taxonomy kind from §7. Distinct from `SyncError` itself: a kind is
/// the classification used for state-machine transitions and ProgressSink
/// events, while `SyncError` carries the full context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    RateLimited,
    CaptivePortal,
    ConflictIgnored,
    ValidationFailed,
    Unauthorized,
    Exhausted,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalKind {
    CorruptSchema,
    NonMonotonicCursor,
    UnknownChangeEntity,
    NonMonotonicChangeLog,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("network error during {context}: {source}")]
    Network {
        context: &'static str,
        #[source]
        source: NetworkError,
    },

    #[error("mutation {mutation_id} rejected: {fields:?}")]
    ValidationFailed { mutation_id: Uuid, fields: Vec<FieldError> },

    #[error("mutation {mutation_id} exhausted {attempts} attempts")]
    Exhausted { mutation_id: Uuid, attempts: u32 },

    #[error("unauthorized, reauthentication required")]
    Unauthorized,

    #[error("fatal: {kind:?}: {detail}")]
    Fatal { kind: FatalKind, detail: String },

    #[error("sync pass exceeded its deadline")]
    Timeout,

    #[error("sync cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: String,
}

impl SyncError {
    /// Maps this error onto the §7 taxonomy kind, used by the coordinator to
    /// drive state transitions and ProgressSink emissions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network { source, .. } => source.kind(),
            SyncError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            SyncError::Exhausted { .. } => ErrorKind::Exhausted,
            SyncError::Unauthorized => ErrorKind::Unauthorized,
            SyncError::Fatal { .. } => ErrorKind::Fatal,
            SyncError::Timeout => ErrorKind::Transient,
            SyncError::Cancelled => ErrorKind::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::RateLimited)
    }
}
