//! Circuit breaker implementation
//!
//! ```text
//! Closed → Open:      failure_count >= failure_threshold
//! Open → HalfOpen:    recovery_timeout elapsed since the last failure
//! HalfOpen → Closed:  the probe call succeeds (or the dependency answers at all)
//! HalfOpen → Open:    the probe call fails; the recovery timer restarts
//! ```
//!
//! All bookkeeping happens under one short-lived lock that is never held
//! across an `.await`; the guarded call itself runs unlocked.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast without contacting the dependency
    Open,
    /// One probe call is allowed to test recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// How a finished call is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// The dependency answered, but with a permanent or negative result
    Neutral,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-dependency circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    enabled: bool,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

/// Admission ticket for one guarded call.
///
/// Dropping a probe permit without recording an outcome (the call was
/// cancelled) releases the probe slot so the next caller can probe instead.
#[derive(Debug)]
#[must_use = "a permit must record the call outcome"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this call is the half-open recovery probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record the outcome of the guarded call
    pub fn record<T>(mut self, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => Outcome::Success,
            Err(e) if e.counts_against_health() => Outcome::Failure,
            Err(_) => Outcome::Neutral,
        };
        self.settled = true;
        self.breaker.record(self.probe, outcome);
    }

    /// Record a success
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.record(self.probe, Outcome::Success);
    }

    /// Record a dependency failure
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.record(self.probe, Outcome::Failure);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.release_probe();
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` behind the breaker.
    ///
    /// Fails with [`Error::CircuitOpen`] without running `operation` when the
    /// circuit is open. Otherwise the operation's own result is returned
    /// unchanged after its outcome is recorded.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        let result = operation().await;
        permit.record(&result);
        result
    }

    /// Decide whether a call may proceed
    #[tracing::instrument(level = "trace", skip(self), fields(service = %self.name))]
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>> {
        if !self.enabled {
            return Ok(self.permit(false));
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(Duration::MAX, |at| at.elapsed());

                if elapsed < self.recovery_timeout {
                    debug!(service = %self.name, "Circuit open, rejecting call");
                    return Err(self.open_error(self.recovery_timeout - elapsed));
                }
                if inner.probe_in_flight {
                    return Err(self.open_error(Duration::ZERO));
                }

                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                debug!(service = %self.name, "Recovery timeout elapsed, admitting probe");
                Ok(self.permit(true))
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    debug!(service = %self.name, "Probe already in flight, rejecting call");
                    return Err(self.open_error(Duration::ZERO));
                }
                inner.probe_in_flight = true;
                debug!(service = %self.name, "Circuit half-open, admitting probe");
                Ok(self.permit(true))
            }
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures since the last success
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
        info!(service = %self.name, "Circuit breaker reset");
    }

    /// Serializable view of the breaker
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        let retry_in = match inner.state {
            CircuitState::Open if self.enabled => Some(self.remaining_open(&inner)),
            _ => None,
        };

        CircuitSnapshot {
            service: self.name.clone(),
            state: if self.enabled {
                inner.state
            } else {
                CircuitState::Closed
            },
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            retry_in_secs: retry_in.map(|d| d.as_secs()),
        }
    }

    /// One-line human summary, suitable for diagnostics output
    #[must_use]
    pub fn status_message(&self) -> String {
        let snapshot = self.snapshot();
        match snapshot.state {
            CircuitState::Closed => format!(
                "Service '{}' circuit is closed ({} recent failures)",
                self.name, snapshot.failure_count
            ),
            CircuitState::Open => format!(
                "Service '{}' circuit breaker is open after {} failures, retry in {} seconds",
                self.name,
                snapshot.failure_count,
                snapshot.retry_in_secs.unwrap_or(0)
            ),
            CircuitState::HalfOpen => format!(
                "Service '{}' circuit is half-open, testing recovery",
                self.name
            ),
        }
    }

    fn permit(&self, probe: bool) -> CircuitPermit<'_> {
        CircuitPermit {
            breaker: self,
            probe,
            settled: false,
        }
    }

    fn open_error(&self, retry_after: Duration) -> Error {
        Error::CircuitOpen {
            service: self.name.clone(),
            retry_after,
        }
    }

    fn remaining_open(&self, inner: &BreakerState) -> Duration {
        inner.last_failure.map_or(Duration::ZERO, |at| {
            self.recovery_timeout.saturating_sub(at.elapsed())
        })
    }

    fn record(&self, probe: bool, outcome: Outcome) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        if probe {
            inner.probe_in_flight = false;
        }

        match outcome {
            Outcome::Success => {
                let previous = inner.state;
                inner.failure_count = 0;
                inner.state = CircuitState::Closed;
                if previous != CircuitState::Closed {
                    info!(service = %self.name, from = %previous, "Circuit breaker closed");
                }
            }
            // A probe that got any answer proves the dependency is reachable
            Outcome::Neutral if probe => {
                inner.failure_count = 0;
                inner.state = CircuitState::Closed;
                info!(service = %self.name, "Probe answered, circuit breaker closed");
            }
            Outcome::Neutral => {}
            Outcome::Failure => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.last_failure = Some(Instant::now());

                if probe {
                    inner.state = CircuitState::Open;
                    warn!(service = %self.name, "Probe failed, reopening circuit");
                } else if inner.failure_count >= self.failure_threshold
                    && inner.state != CircuitState::Open
                {
                    inner.state = CircuitState::Open;
                    warn!(
                        service = %self.name,
                        failures = inner.failure_count,
                        threshold = self.failure_threshold,
                        "Circuit breaker opened"
                    );
                } else {
                    debug!(
                        service = %self.name,
                        failures = inner.failure_count,
                        threshold = self.failure_threshold,
                        "Dependency failure recorded"
                    );
                }
            }
        }
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        debug!(service = %self.name, "Probe abandoned, slot released");
    }
}

/// Breaker state snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Dependency name
    pub service: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Failures needed to open
    pub failure_threshold: u32,
    /// Seconds until a probe is admitted (open state only)
    pub retry_in_secs: Option<u64>,
}
