//! HealthCheck (§4.6): a cached reachability probe with captive-portal
//! detection.
//!
//! No direct teacher analogue for the cache/TTL mechanism itself; the
//! closest real precedent in the pack is `CircuitBreaker`'s own
//! `open_until: Option<Instant>` deadline field (see DESIGN.md), generalized
//! here into a cached `(state, checked_at)` pair the coordinator consults at
//! the top of every sync pass instead of probing unconditionally.

use std::time::{Duration, Instant};

use crate::network::{HealthResponse, NetworkClient, NetworkError};

/// A known-content sentinel a captive portal's injected 2xx page would fail
/// to contain.
const HEALTH_SENTINEL: &str = "\"ok\":true";

/// Logical name of the probed endpoint, for the `target` logging field
/// (§10) — the concrete URL lives in the host's `NetworkClient`, which this
/// crate never sees.
const HEALTH_PROBE_TARGET: &str = "health_check";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthState {
    pub reachable: bool,
    pub captive_portal: bool,
}

impl HealthState {
    pub const OFFLINE: HealthState = HealthState { reachable: false, captive_portal: false };
    pub const REACHABLE: HealthState = HealthState { reachable: true, captive_portal: false };
    pub const CAPTIVE: HealthState = HealthState { reachable: true, captive_portal: true };
}

pub struct HealthCheck {
    ttl: Duration,
    cached: Option<(HealthState, Instant)>,
}

impl HealthCheck {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, cached: None }
    }

    /// Forces the next `probe` call to hit the network even if the cache is
    /// still fresh — used after a host-reported network-state change.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Returns the cached state if still fresh as of `now`, else probes via
    /// `client` and caches the result.
    pub async fn probe(&mut self, client: &dyn NetworkClient, now: Instant) -> HealthState {
        if let Some((state, checked_at)) = self.cached {
            if now.duration_since(checked_at) < self.ttl {
                return state;
            }
        }

        let started = Instant::now();
        let state = match client.health_check().await {
            Ok(response) => classify(&response),
            Err(NetworkError::Offline) | Err(NetworkError::Timeout) => HealthState::OFFLINE,
            Err(_) => HealthState::OFFLINE,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            target = HEALTH_PROBE_TARGET,
            reachable = state.reachable,
            captive_portal = state.captive_portal,
            elapsed_ms,
            "health probe"
        );

        self.cached = Some((state, now));
        state
    }
}

fn classify(response: &HealthResponse) -> HealthState {
    let is_html = response
        .content_type
        .as_deref()
        .map(|ct| ct.contains("text/html"))
        .unwrap_or(false);

    if !(200..300).contains(&response.status) {
        if is_html {
            return HealthState::CAPTIVE;
        }
        return HealthState::OFFLINE;
    }

    if !response.body.contains(HEALTH_SENTINEL) {
        return HealthState::CAPTIVE;
    }

    HealthState::REACHABLE
}
