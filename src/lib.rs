//! Offline-first sync engine for a mobile client (§1): a single-writer
//! coordinator that flushes queued mutations, pulls a server change-log, and
//! bootstraps a fresh install, behind a small set of host-supplied
//! contracts (clock, store, network client).
//!
//! The coordinator is the only thing this crate exports that does real
//! work; `DataStore` and `NetworkClient` are consumed, not implemented —
//! a host app provides both, backed by its own persistence and HTTP stack.

pub mod bootstrap;
pub mod cancel;
pub mod change_feed;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod history;
pub mod mutation;
pub mod network;
pub mod progress;
pub mod queue;
pub mod replay_buffer;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use config::SyncConfig;
pub use coordinator::{PassOutcome, SyncCoordinator, TriggerReason};
pub use error::{ErrorKind, SyncError};
pub use mutation::{EntityKind, MutationKind, PendingMutation};
pub use network::NetworkClient;
pub use progress::{ProgressObserver, SyncEvent};
pub use store::DataStore;
