use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::config::ExtractorConfig;
use crate::core::errors::{ExtractResult, ExtractionError};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Backend is failing; requests are rejected without a call
    Open,
    /// Cool-down elapsed; a single probe request is allowed through
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Consecutive probe successes needed to close again
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

impl From<&ExtractorConfig> for CircuitBreakerConfig {
    fn from(config: &ExtractorConfig) -> Self {
        Self {
            failure_threshold: config.circuit_failure_threshold,
            timeout: config.circuit_reset_timeout,
            ..Self::default()
        }
    }
}

/// Circuit breaker guarding one extractor backend.
///
/// Cloning shares state, so every extractor talking to the same service
/// can hold the same breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    service: Arc<str>,
    shared: Arc<RwLock<BreakerState>>,
    config: CircuitBreakerConfig,
}

struct BreakerState {
    state: CircuitState,
    failure_streak: usize,
    probe_successes: usize,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    failures: usize,
    successes: usize,
    rejections: usize,
}

impl CircuitBreaker {
    pub fn new(service: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            service: Arc::from(service),
            shared: Arc::new(RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_streak: 0,
                probe_successes: 0,
                opened_at: None,
                probe_in_flight: false,
                failures: 0,
                successes: 0,
                rejections: 0,
            })),
            config,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Admit a request or fail fast with `CircuitOpen`.
    ///
    /// The permit must be settled with [`CallPermit::succeed`] or
    /// [`CallPermit::fail`]. Dropping it unsettled (a cancelled call) frees
    /// the half-open probe slot for the next caller.
    pub fn admit(&self) -> ExtractResult<CallPermit> {
        match self.try_admit() {
            Some(probe) => Ok(CallPermit {
                breaker: self.clone(),
                probe,
                settled: false,
            }),
            None => Err(ExtractionError::CircuitOpen {
                service: self.service.to_string(),
            }),
        }
    }

    pub fn allow_request(&self) -> bool {
        self.try_admit().is_some()
    }

    /// `Some(true)` when the admitted request is the half-open probe
    fn try_admit(&self) -> Option<bool> {
        let mut shared = self.shared.write();

        let admitted = match shared.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let cooled = shared
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= self.config.timeout);
                if cooled {
                    shared.state = CircuitState::HalfOpen;
                    shared.probe_successes = 0;
                    shared.probe_in_flight = true;
                    info!("Circuit for {} half-open, probing", self.service);
                    Some(true)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if shared.probe_in_flight {
                    None
                } else {
                    shared.probe_in_flight = true;
                    Some(true)
                }
            }
        };

        if admitted.is_none() {
            shared.rejections += 1;
        }
        admitted
    }

    fn release_probe(&self) {
        let mut shared = self.shared.write();
        if shared.state == CircuitState::HalfOpen && shared.probe_in_flight {
            shared.probe_in_flight = false;
            debug!("Probe for {} abandoned, slot released", self.service);
        }
    }

    pub fn record_success(&self) {
        let mut shared = self.shared.write();
        shared.successes += 1;
        shared.failure_streak = 0;
        shared.probe_in_flight = false;

        if shared.state != CircuitState::Closed {
            shared.probe_successes += 1;
            if shared.probe_successes >= self.config.success_threshold {
                shared.state = CircuitState::Closed;
                shared.probe_successes = 0;
                shared.opened_at = None;
                info!("Circuit for {} closed", self.service);
            }
        }
    }

    /// Record a failed request. Returns true if this failure tripped the
    /// circuit open.
    pub fn record_failure(&self) -> bool {
        let mut shared = self.shared.write();
        shared.failures += 1;
        shared.probe_successes = 0;
        shared.failure_streak += 1;
        shared.probe_in_flight = false;

        let trip = match shared.state {
            CircuitState::Closed => shared.failure_streak >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            shared.state = CircuitState::Open;
            shared.opened_at = Some(Instant::now());
            warn!(
                "Circuit for {} opened after {} consecutive failures",
                self.service, shared.failure_streak
            );
        }
        trip
    }

    pub fn state(&self) -> CircuitState {
        self.shared.read().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let shared = self.shared.read();
        CircuitBreakerStats {
            service: self.service.to_string(),
            state: shared.state,
            failure_streak: shared.failure_streak,
            failures: shared.failures,
            successes: shared.successes,
            rejections: shared.rejections,
        }
    }
}

/// Admission returned by [`CircuitBreaker::admit`]
#[must_use]
pub struct CallPermit {
    breaker: CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Returns true if this failure tripped the circuit open
    pub fn fail(mut self) -> bool {
        self.settled = true;
        self.breaker.record_failure()
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub service: String,
    pub state: CircuitState,
    pub failure_streak: usize,
    pub failures: usize,
    pub successes: usize,
    pub rejections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: usize, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                timeout,
                success_threshold: 1,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(3, Duration::from_secs(60));

        assert!(breaker.admit().is_ok());
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.admit().err().unwrap();
        assert!(matches!(err, ExtractionError::CircuitOpen { ref service } if service == "test"));
        assert_eq!(breaker.stats().rejections, 1);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = breaker(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_a_single_request() {
        let breaker = breaker(1, Duration::from_millis(50));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(80));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow_request());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_failed_half_open_request_reopens() {
        let breaker = breaker(1, Duration::from_millis(50));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(80));
        assert!(breaker.allow_request());

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_abandoned_half_open_call_frees_the_slot() {
        let breaker = breaker(1, Duration::from_millis(50));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(80));

        let permit = breaker.admit().unwrap();
        assert!(breaker.admit().is_err());
        drop(permit);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.admit().unwrap().succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_half_open_permit_reopens() {
        let breaker = breaker(1, Duration::from_millis(50));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(80));

        assert!(breaker.admit().unwrap().fail());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.admit().is_err());
    }

    #[test]
    fn test_clones_share_state() {
        let a = breaker(1, Duration::from_secs(60));
        let b = a.clone();
        a.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }
}
