//! CircuitBreaker (§4.5): counts consecutive rate-limit events, trips at a
//! threshold, and tracks a jittered exponential backoff deadline.
//!
//! Grounded on Design Note 9 ("ad-hoc retry flags → explicit state
//! machine"): rather than a scattered `is_backing_off` bool, every
//! retry/backoff decision routes through this one small state machine.

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    state: State,
    consecutive_rate_limits: u32,
    trips: u32,
    open_until: Option<Instant>,
    threshold: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, base_backoff: Duration, max_backoff: Duration, jitter: Duration) -> Self {
        Self {
            state: State::Closed,
            consecutive_rate_limits: 0,
            trips: 0,
            open_until: None,
            threshold,
            base_backoff,
            max_backoff,
            jitter,
        }
    }

    /// Call on every observed rate-limit response. `now` is the monotonic
    /// clock reading used to compute the backoff deadline.
    pub fn on_rate_limited(&mut self, now: Instant) {
        self.consecutive_rate_limits += 1;
        if matches!(self.state, State::HalfOpen) {
            self.trip(now);
            return;
        }
        if self.consecutive_rate_limits >= self.threshold {
            self.trip(now);
        }
    }

    fn trip(&mut self, now: Instant) {
        self.trips += 1;
        let backoff = self.backoff_for_trip(self.trips);
        self.state = State::Open;
        self.open_until = Some(now + backoff);
        tracing::warn!(trips = self.trips, backoff_ms = backoff.as_millis() as u64, "circuit breaker tripped");
    }

    fn backoff_for_trip(&self, trips: u32) -> Duration {
        let exp = 2u64.saturating_pow(trips.saturating_sub(1));
        let scaled = self.base_backoff.saturating_mul(exp as u32).min(self.max_backoff);
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis().max(1) as u64);
        scaled + Duration::from_millis(jitter_ms)
    }

    /// Resets all backoff state on a successful request. Half-open → closed;
    /// while fully open, trips do not reset mid-pass (§4.5).
    pub fn on_success(&mut self) {
        if self.trips > 0 {
            tracing::info!(trips = self.trips, backoff_ms = 0u64, "circuit breaker reset");
        }
        self.consecutive_rate_limits = 0;
        self.trips = 0;
        self.state = State::Closed;
        self.open_until = None;
    }

    /// Re-evaluates Open → Half-open once the backoff deadline has passed.
    /// Must be called before `is_tripped`/`backoff_remaining` to get a
    /// current answer.
    pub fn tick(&mut self, now: Instant) {
        if let State::Open = self.state {
            if let Some(until) = self.open_until {
                if now >= until {
                    self.state = State::HalfOpen;
                }
            }
        }
    }

    pub fn is_tripped(&self) -> bool {
        matches!(self.state, State::Open)
    }

    pub fn backoff_remaining(&self, now: Instant) -> Duration {
        match self.open_until {
            Some(until) if until > now => until - now,
            _ => Duration::ZERO,
        }
    }

    pub fn trips(&self) -> u32 {
        self.trips
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(10), Duration::from_secs(300), Duration::from_millis(250))
    }

    #[test]
    fn trips_after_threshold_consecutive_rate_limits() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.on_rate_limited(t0);
        cb.on_rate_limited(t0);
        assert!(!cb.is_tripped());
        cb.on_rate_limited(t0);
        assert!(cb.is_tripped());
        assert!(cb.backoff_remaining(t0) >= Duration::from_secs(10));
        assert!(cb.backoff_remaining(t0) <= Duration::from_secs(10) + Duration::from_millis(250));
    }

    #[test]
    fn backoff_doubles_per_trip_up_to_cap() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.on_rate_limited(t0);
        }
        let first_trip_backoff = cb.backoff_remaining(t0);
        assert!(first_trip_backoff >= Duration::from_secs(10));

        cb.tick(t0 + first_trip_backoff);
        // half-open; another rate limit re-trips and doubles backoff
        cb.on_rate_limited(t0 + first_trip_backoff);
        let second = cb.backoff_remaining(t0 + first_trip_backoff);
        assert!(second >= Duration::from_secs(20));
    }

    #[test]
    fn success_resets_state() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.on_rate_limited(t0);
        }
        assert!(cb.is_tripped());
        cb.on_success();
        assert!(!cb.is_tripped());
        assert_eq!(cb.trips(), 0);
    }

    #[test]
    fn half_open_transition_requires_deadline_passed() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.on_rate_limited(t0);
        }
        let remaining = cb.backoff_remaining(t0);
        cb.tick(t0 + remaining - Duration::from_millis(1));
        assert!(cb.is_tripped());
        cb.tick(t0 + remaining + Duration::from_millis(1));
        assert!(!cb.is_tripped());
    }
}
