//! NetworkClient contract (§6, consumed not implemented) and the structured
//! error taxonomy it surfaces, modeled after `less_db::sync::types::{
//! SyncTransport, SyncTransportError}`.
//!
//! This crate never parses HTTP or JSON wire details itself (Non-goals §1);
//! it depends on a host-provided implementation of `NetworkClient` that has
//! already done so and hands back these typed values.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::mutation::EntityKind;

/// RFC 9457 Problem Details envelope (§6), already decoded by the host's
/// HTTP stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: Option<String>,
    pub request_id: Option<String>,
    pub retry_after: Option<u64>,
    pub action: Option<String>,
    #[serde(default)]
    pub errors: Vec<ProblemField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemField {
    pub field: String,
    pub message: String,
    pub code: String,
}

/// Structured network error, already classified by the transport layer.
#[derive(Debug, Clone)]
pub enum NetworkError {
    Timeout,
    Offline,
    RateLimited { retry_after: Duration, problem: Option<ProblemDetails> },
    TransientServer { status: u16, problem: Option<ProblemDetails> },
    Forbidden { problem: Option<ProblemDetails> },
    Unauthorized { problem: Option<ProblemDetails> },
    NotFound,
    Conflict { problem: Option<ProblemDetails> },
    ValidationFailed { problem: ProblemDetails },
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::Timeout => write!(f, "request timed out"),
            NetworkError::Offline => write!(f, "device is offline"),
            NetworkError::RateLimited { retry_after, .. } => write!(f, "rate limited, retry after {retry_after:?}"),
            NetworkError::TransientServer { status, .. } => write!(f, "transient server error ({status})"),
            NetworkError::Forbidden { .. } => write!(f, "forbidden"),
            NetworkError::Unauthorized { .. } => write!(f, "unauthorized"),
            NetworkError::NotFound => write!(f, "not found"),
            NetworkError::Conflict { .. } => write!(f, "conflict"),
            NetworkError::ValidationFailed { problem } => write!(f, "validation failed: {}", problem.title),
        }
    }
}

impl std::error::Error for NetworkError {}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::Timeout | NetworkError::Offline | NetworkError::TransientServer { .. } => ErrorKind::Transient,
            NetworkError::RateLimited { .. } => ErrorKind::RateLimited,
            NetworkError::Forbidden { .. } | NetworkError::Unauthorized { .. } => ErrorKind::Unauthorized,
            NetworkError::NotFound => ErrorKind::Transient,
            NetworkError::Conflict { .. } => ErrorKind::ConflictIgnored,
            NetworkError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
        }
    }
}

/// One item in a batch create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub target_id: Uuid,
    pub idempotency_key: String,
    pub payload: Value,
}

/// Per-item outcome of a `POST /events/batch` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub target_id: Uuid,
    pub status: BatchItemStatus,
    /// Server id, present on success — may differ from `target_id` under
    /// I6 reconciliation (duplicate create replay).
    pub server_id: Option<Uuid>,
    pub error: Option<ProblemDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub success: usize,
    pub failed: usize,
    pub items: Vec<BatchItemResult>,
}

/// A single server-side change, as returned by `GET /changes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub op: ChangeOp,
    pub entity: EntityKind,
    pub id: Uuid,
    pub payload: Option<Value>,
    pub server_rev: i64,
    pub change_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One page of `GET /changes?since=...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub changes: Vec<Change>,
    pub next_cursor: i64,
    pub has_more: bool,
}

/// A page of a bootstrap entity fetch (§4.4).
#[derive(Debug, Clone)]
pub struct BootstrapPage<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

/// The network boundary this crate depends on. A host app implements this
/// against its HTTP stack; the coordinator only ever sees `NetworkError`.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// `POST /events/batch`.
    async fn post_event_batch(&self, items: &[BatchItem]) -> Result<BatchResponse, NetworkError>;

    /// `POST|PUT|DELETE /<entity>/...` for a single non-event mutation.
    async fn send_single_mutation(
        &self,
        entity: EntityKind,
        kind: crate::mutation::MutationKind,
        target_id: Uuid,
        idempotency_key: &str,
        payload: &Value,
    ) -> Result<Option<Uuid>, NetworkError>;

    /// `GET /changes?since=<cursor>&limit=<limit>`.
    async fn get_changes(&self, since: i64, limit: usize) -> Result<Page, NetworkError>;

    /// `GET /changes/latest-cursor`.
    async fn get_latest_cursor(&self) -> Result<i64, NetworkError>;

    /// Paged bootstrap fetch for one entity kind.
    async fn fetch_bootstrap_page(&self, entity: EntityKind, offset: usize, limit: usize) -> Result<BootstrapPage<Value>, NetworkError>;

    /// Lightweight reachability probe (§4.6). Returns the raw body so
    /// `HealthCheck` can run captive-portal sentinel matching; the transport
    /// still owns the actual socket/timeout handling.
    async fn health_check(&self) -> Result<HealthResponse, NetworkError>;
}

#[derive(Debug, Clone)]
pub struct HealthResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}
