//! Per-provider circuit breaker (§4.4, §4.7, §9 "wrap global mutable state
//! in explicit, injected components"). Keyed state lives in a `DashMap`,
//! the same concurrent-map crate `goose`'s own workspace already depends on
//! for shared registries, instead of a single `Mutex<HashMap<_>>` guarding
//! every provider behind one lock.

use std::time::{Duration, Instant};

use dashmap::DashMap;

const FAILURE_THRESHOLD: u32 = 5;
const OPEN_COOLDOWN: Duration = Duration::from_millis(60_000);
const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

/// Tracks one breaker per provider name. Cheaply `Clone`-able (an `Arc`
/// around the map would also work; `DashMap` itself is already share-safe
/// behind an `Arc` at the `AppState` level, matching how the config and
/// token counter are shared).
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    entries: DashMap<String, BreakerEntry>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current externally-visible state, applying the open→half-open
    /// cooldown transition lazily on read (§4.4: "transition open → half-open
    /// after 60000ms").
    pub fn state(&self, provider: &str) -> BreakerState {
        let mut entry = self.entries.entry(provider.to_string()).or_default();
        if entry.state == BreakerState::Open {
            if let Some(opened_at) = entry.opened_at {
                if opened_at.elapsed() >= OPEN_COOLDOWN {
                    entry.state = BreakerState::HalfOpen;
                    entry.consecutive_successes = 0;
                }
            }
        }
        entry.state
    }

    /// Whether a call to `provider` may be dispatched right now. Half-open
    /// admits a probe (the caller is expected to call this once per
    /// request, so "small probe quota" degrades to one in-flight probe at a
    /// time in practice since callers record the outcome before the next
    /// request is evaluated).
    pub fn allow_request(&self, provider: &str) -> bool {
        !matches!(self.state(provider), BreakerState::Open)
    }

    pub fn record_success(&self, provider: &str) {
        let mut entry = self.entries.entry(provider.to_string()).or_default();
        match entry.state {
            BreakerState::Closed => {
                entry.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                entry.consecutive_successes += 1;
                if entry.consecutive_successes >= HALF_OPEN_SUCCESS_THRESHOLD {
                    entry.state = BreakerState::Closed;
                    entry.consecutive_failures = 0;
                    entry.consecutive_successes = 0;
                    entry.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, provider: &str) {
        let mut entry = self.entries.entry(provider.to_string()).or_default();
        match entry.state {
            BreakerState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= FAILURE_THRESHOLD {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Open;
                entry.opened_at = Some(Instant::now());
                entry.consecutive_successes = 0;
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let reg = CircuitBreakerRegistry::new();
        assert_eq!(reg.state("p1"), BreakerState::Closed);
        assert!(reg.allow_request("p1"));
    }

    #[test]
    fn opens_after_five_consecutive_failures() {
        let reg = CircuitBreakerRegistry::new();
        for _ in 0..4 {
            reg.record_failure("p1");
            assert_eq!(reg.state("p1"), BreakerState::Closed);
        }
        reg.record_failure("p1");
        assert_eq!(reg.state("p1"), BreakerState::Open);
        assert!(!reg.allow_request("p1"));
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let reg = CircuitBreakerRegistry::new();
        for _ in 0..4 {
            reg.record_failure("p1");
        }
        reg.record_success("p1");
        for _ in 0..4 {
            reg.record_failure("p1");
        }
        assert_eq!(reg.state("p1"), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let reg = CircuitBreakerRegistry::new();
        for _ in 0..5 {
            reg.record_failure("p1");
        }
        {
            let mut e = reg.entries.get_mut("p1").unwrap();
            e.state = BreakerState::HalfOpen;
        }
        reg.record_failure("p1");
        assert_eq!(reg.state("p1"), BreakerState::Open);
    }

    #[test]
    fn half_open_closes_after_three_successes() {
        let reg = CircuitBreakerRegistry::new();
        for _ in 0..5 {
            reg.record_failure("p1");
        }
        {
            let mut e = reg.entries.get_mut("p1").unwrap();
            e.state = BreakerState::HalfOpen;
        }
        reg.record_success("p1");
        reg.record_success("p1");
        assert_eq!(reg.state("p1"), BreakerState::HalfOpen);
        reg.record_success("p1");
        assert_eq!(reg.state("p1"), BreakerState::Closed);
    }

    #[test]
    fn independent_providers_track_separately() {
        let reg = CircuitBreakerRegistry::new();
        for _ in 0..5 {
            reg.record_failure("p1");
        }
        assert_eq!(reg.state("p1"), BreakerState::Open);
        assert_eq!(reg.state("p2"), BreakerState::Closed);
    }
}
