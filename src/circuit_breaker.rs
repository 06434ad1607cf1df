// =============================================================================
// circuit_breaker.rs — THE PORTAL PATIENCE MANAGER
// =============================================================================
//
// The data sources this pipeline depends on are a federal open-data portal,
// a regulator's download endpoint, and an Open Insurance directory. Each of
// them goes down with the serene regularity of a tide table. When that
// happens, hammering them with twelve consecutive monthly downloads is:
//
//   1. Pointless (the server is down)
//   2. Rude (they have enough problems)
//   3. A good way to get the engine's IP banned from government data forever
//
// So every endpoint gets a circuit breaker. After N consecutive failures the
// breaker opens and subsequent requests are refused locally, which in a batch
// window means "skip the remaining months and say so in the artifacts".
// After a cooldown, one probe request is allowed through (half-open); M
// probe successes close the breaker again.
//
// Is this the same pattern Netflix uses for its microservices? Yes.
// Are we Netflix? No. We download complaint spreadsheets. Moving on.
// =============================================================================

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state, with the bookkeeping each state actually needs embedded
/// in the variant so impossible combinations cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Requests flow. Tracks the current run of consecutive failures.
    Closed { consecutive_failures: u32 },
    /// Requests refused until the cooldown elapses.
    Open { since: Instant },
    /// Probing. Tracks successes accumulated toward reclosing.
    HalfOpen { successes: u32 },
}

pub struct CircuitBreaker {
    /// Which endpoint this breaker guards, for logs.
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    success_threshold: u32,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            success_threshold: success_threshold.max(1),
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// May a request proceed right now? An open breaker whose cooldown has
    /// elapsed transitions to half-open and lets one probe through.
    pub fn allow_request(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            State::Closed { .. } | State::HalfOpen { .. } => true,
            State::Open { since } => {
                if since.elapsed() >= self.reset_timeout {
                    info!(endpoint = %self.name, "circuit half-open, probing");
                    *state = State::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Closed { .. } => {
                *state = State::Closed {
                    consecutive_failures: 0,
                };
            }
            State::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.success_threshold {
                    info!(endpoint = %self.name, "circuit closed, endpoint healthy again");
                    *state = State::Closed {
                        consecutive_failures: 0,
                    };
                } else {
                    *state = State::HalfOpen { successes };
                }
            }
            State::Open { .. } => {
                // A success while open means a request raced the trip.
                // Harmless; the cooldown still governs.
            }
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    warn!(
                        endpoint = %self.name,
                        failures = failures,
                        cooldown_secs = self.reset_timeout.as_secs(),
                        "circuit OPEN, backing off"
                    );
                    *state = State::Open {
                        since: Instant::now(),
                    };
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            State::HalfOpen { .. } => {
                // The probe failed; straight back to timeout purgatory.
                warn!(endpoint = %self.name, "probe failed, circuit re-opened");
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Human-readable state for diagnostics output.
    pub fn state_label(&self) -> &'static str {
        match *self.state.lock() {
            State::Closed { .. } => "CLOSED",
            State::Open { .. } => "OPEN",
            State::HalfOpen { .. } => "HALF_OPEN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new("test", failures, Duration::from_secs(3600), successes)
    }

    #[test]
    fn test_starts_closed_and_allows_requests() {
        let cb = breaker(3, 1);
        assert!(cb.allow_request());
        assert_eq!(cb.state_label(), "CLOSED");
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, 1);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state_label(), "OPEN");
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_the_failure_run() {
        let cb = breaker(2, 1);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        // Two failures total but never two in a row.
        assert_eq!(cb.state_label(), "CLOSED");
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(0), 1);
        cb.record_failure();
        assert_eq!(cb.state_label(), "OPEN");
        // Zero cooldown: the next permission check flips to half-open.
        assert!(cb.allow_request());
        assert_eq!(cb.state_label(), "HALF_OPEN");
        cb.record_success();
        assert_eq!(cb.state_label(), "CLOSED");
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(0), 2);
        cb.record_failure();
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state_label(), "OPEN");
    }
}
