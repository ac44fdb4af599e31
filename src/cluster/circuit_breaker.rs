//! Per-instance failure isolation.
//!
//! The breaker is owned by its [`WorkerInstance`](super::WorkerInstance) and
//! mutated only under the balancer lock, so it holds plain fields. Time is
//! passed in explicitly so the control loops and tests share one clock.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Traffic flows normally.
    Closed,
    /// Traffic is blocked until the recovery timeout elapses.
    Open,
    /// Trial traffic is allowed; one failure re-opens.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change, reported so callers can publish it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    error_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    next_attempt: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            error_threshold: config.error_threshold,
            success_threshold: config.success_threshold,
            recovery_timeout: config.recovery_timeout(),
            next_attempt: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Moves `open` to `half_open` once the recovery timeout has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<StateChange> {
        match (self.state, self.next_attempt) {
            (CircuitState::Open, Some(at)) if now >= at => {
                info!("Circuit breaker half-open, allowing trial traffic");
                Some(self.transition(CircuitState::HalfOpen, now))
            }
            _ => None,
        }
    }

    pub fn record_success(&mut self, now: Instant) -> Option<StateChange> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_sub(1);
                None
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    info!(successes = self.success_count, "Circuit breaker closing after recovery");
                    Some(self.transition(CircuitState::Closed, now))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<StateChange> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.error_threshold {
                    warn!(failures = self.failure_count, "Circuit breaker opening");
                    Some(self.transition(CircuitState::Open, now))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker re-opening after half-open failure");
                Some(self.transition(CircuitState::Open, now))
            }
            CircuitState::Open => None,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> StateChange {
        let from = self.state;
        self.state = to;
        match to {
            CircuitState::Open => {
                self.next_attempt = Some(now + self.recovery_timeout);
                self.success_count = 0;
            }
            CircuitState::HalfOpen => {
                self.next_attempt = None;
                self.success_count = 0;
            }
            CircuitState::Closed => {
                self.next_attempt = None;
                self.failure_count = 0;
                self.success_count = 0;
            }
        }
        StateChange { from, to }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig::default())
    }

    #[test]
    fn five_failures_open_then_half_open_then_close() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..4 {
            assert_eq!(cb.record_failure(t0), None);
        }
        let change = cb.record_failure(t0).unwrap();
        assert_eq!(change.to, CircuitState::Open);
        assert!(cb.is_open());

        assert_eq!(cb.poll(t0 + Duration::from_secs(29)), None);
        let change = cb.poll(t0 + Duration::from_secs(30)).unwrap();
        assert_eq!(change, StateChange { from: CircuitState::Open, to: CircuitState::HalfOpen });

        let t1 = t0 + Duration::from_secs(31);
        assert_eq!(cb.record_success(t1), None);
        assert_eq!(cb.record_success(t1), None);
        assert_eq!(cb.record_success(t1).unwrap().to, CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..5 {
            cb.record_failure(t0);
        }
        cb.poll(t0 + Duration::from_secs(30));
        cb.record_success(t0 + Duration::from_secs(30));
        let change = cb.record_failure(t0 + Duration::from_secs(31)).unwrap();
        assert_eq!(change.from, CircuitState::HalfOpen);
        assert_eq!(change.to, CircuitState::Open);
        assert_eq!(cb.next_attempt(), Some(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn closed_success_decays_failures() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..4 {
            cb.record_failure(t0);
        }
        cb.record_success(t0);
        cb.record_success(t0);
        assert_eq!(cb.failure_count(), 2);
        cb.record_failure(t0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[derive(Debug, Clone)]
    enum Event {
        Success,
        Failure,
        Wait(u64),
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::Success),
            Just(Event::Failure),
            (0u64..60).prop_map(Event::Wait),
        ]
    }

    proptest! {
        #[test]
        fn only_documented_edges_occur(events in prop::collection::vec(event(), 1..120)) {
            let mut cb = breaker();
            let mut now = Instant::now();
            for e in events {
                let change = match e {
                    Event::Success => cb.record_success(now),
                    Event::Failure => cb.record_failure(now),
                    Event::Wait(secs) => {
                        now += Duration::from_secs(secs);
                        cb.poll(now)
                    }
                };
                if let Some(StateChange { from, to }) = change {
                    let legal = matches!(
                        (from, to),
                        (CircuitState::Closed, CircuitState::Open)
                            | (CircuitState::Open, CircuitState::HalfOpen)
                            | (CircuitState::HalfOpen, CircuitState::Closed)
                            | (CircuitState::HalfOpen, CircuitState::Open)
                    );
                    prop_assert!(legal, "illegal edge {from} -> {to}");
                }
            }
        }
    }
}
