//! Per-channel circuit breakers for provider dispatch.
//!
//! Three states: Closed (healthy), Open (failing), HalfOpen (probing).
//! Time is passed in by the caller so jobs and tests share one clock.

use serde::{Deserialize, Serialize};

use herald_core::Timestamp;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Seconds an Open circuit waits before letting one probe through.
pub const DEFAULT_RECOVERY_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHealth {
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_success: Option<Timestamp>,
    pub last_failure: Option<Timestamp>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    health: ChannelHealth,
    threshold: u32,
    recovery_secs: u64,
    opened_at: Option<Timestamp>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery_secs: u64) -> Self {
        Self {
            health: ChannelHealth {
                circuit_state: CircuitState::Closed,
                consecutive_failures: 0,
                total_calls: 0,
                total_failures: 0,
                last_success: None,
                last_failure: None,
            },
            threshold: threshold.max(1),
            recovery_secs,
            opened_at: None,
        }
    }

    /// Whether a call may go out now. An Open circuit turns HalfOpen once
    /// the recovery timeout has elapsed.
    pub fn should_allow(&mut self, now: Timestamp) -> bool {
        match self.health.circuit_state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.opened_at {
                Some(opened_at) if now.seconds_since(&opened_at) >= self.recovery_secs => {
                    self.health.circuit_state = CircuitState::HalfOpen;
                    tracing::info!("circuit breaker half-open, probing provider");
                    true
                }
                _ => false,
            },
        }
    }

    pub fn record_success(&mut self, now: Timestamp) {
        self.health.consecutive_failures = 0;
        self.health.last_success = Some(now);
        self.health.total_calls += 1;
        if self.health.circuit_state != CircuitState::Closed {
            self.health.circuit_state = CircuitState::Closed;
            self.opened_at = None;
            tracing::info!("circuit breaker closed");
        }
    }

    pub fn record_failure(&mut self, now: Timestamp) {
        self.health.consecutive_failures += 1;
        self.health.last_failure = Some(now);
        self.health.total_calls += 1;
        self.health.total_failures += 1;

        match self.health.circuit_state {
            CircuitState::Closed => {
                if self.health.consecutive_failures >= self.threshold {
                    self.health.circuit_state = CircuitState::Open;
                    self.opened_at = Some(now);
                    tracing::warn!(
                        consecutive_failures = self.health.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.health.circuit_state = CircuitState::Open;
                self.opened_at = Some(now);
                tracing::warn!("circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {
                self.opened_at = Some(now);
            }
        }
    }

    pub fn health(&self) -> &ChannelHealth {
        &self.health
    }

    pub fn state(&self) -> CircuitState {
        self.health.circuit_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: u64) -> Timestamp {
        Timestamp::from_seconds(s)
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(3, 60);
        for i in 0..2 {
            cb.record_failure(t(i));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure(t(2));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow(t(10)));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut cb = CircuitBreaker::new(3, 60);
        cb.record_failure(t(1));
        cb.record_failure(t(2));
        cb.record_success(t(3));
        cb.record_failure(t(4));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.health().consecutive_failures, 1);
        assert_eq!(cb.health().total_failures, 3);
        assert_eq!(cb.health().total_calls, 4);
    }

    #[test]
    fn test_half_open_probe_cycle() {
        let mut cb = CircuitBreaker::new(1, 60);
        cb.record_failure(t(100));
        assert!(!cb.should_allow(t(159)));
        assert!(cb.should_allow(t(160)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure(t(161));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow(t(200)));

        assert!(cb.should_allow(t(221)));
        cb.record_success(t(222));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.health().last_success, Some(t(222)));
    }
}
