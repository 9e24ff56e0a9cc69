//! Failsafe mechanisms: circuit breaker, retry, rate limiting, health tracking
//!
//! # Data Flow
//! ```text
//! inbound request → RateLimiter (per caller identity)
//!                 → business logic
//!                 → Failsafe::call (per dependency)
//!                       → CircuitBreaker gate (fail fast when open)
//!                       → RetryPolicy (transient failures, exponential backoff)
//!                       → CircuitBreaker records the single final outcome
//! ```

mod circuit_breaker;
mod classify;
mod health;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitSnapshot, CircuitState};
pub use classify::{Classification, FailureKind, classify, classify_error, classify_status};
pub use health::{HealthMetrics, HealthTracker};
pub use rate_limiter::{LimitWindow, RateLimitInfo, RateLimiter, WindowQuota, spawn_cleanup_task};
pub use retry::RetryPolicy;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::Result;
use crate::config::{CircuitBreakerConfig, RetryConfig};

/// Combined failsafe wrapper for one dependency
#[derive(Debug, Clone)]
pub struct Failsafe {
    /// Circuit breaker
    pub circuit_breaker: Arc<CircuitBreaker>,
    /// Retry policy
    pub retry_policy: RetryPolicy,
    /// Health tracker
    pub health_tracker: Arc<HealthTracker>,
}

impl Failsafe {
    /// Create a new failsafe from configuration
    #[must_use]
    pub fn new(name: &str, circuit_breaker: &CircuitBreakerConfig, retry: &RetryConfig) -> Self {
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::new(name, circuit_breaker)),
            retry_policy: RetryPolicy::new(retry),
            health_tracker: Arc::new(HealthTracker::new(name)),
        }
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        self.circuit_breaker.name()
    }

    /// Run `operation` with retries inside one circuit breaker attempt.
    ///
    /// The breaker sees the whole retry sequence as one call and records only
    /// its final outcome.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let name = self.circuit_breaker.name();
        let policy = &self.retry_policy;

        let result = self
            .circuit_breaker
            .call(|| policy.execute(name, operation))
            .await;

        match &result {
            Ok(_) => self.health_tracker.record_success(started.elapsed()),
            Err(e) if e.counts_against_health() => self.health_tracker.record_failure(),
            Err(_) => {}
        }
        result
    }

    /// Get health metrics
    #[must_use]
    pub fn health_metrics(&self) -> HealthMetrics {
        self.health_tracker.metrics()
    }
}
