//! Dependency health tracking
//!
//! Complements the circuit breaker with observational data: call counts,
//! consecutive failures and recent latency percentiles. Nothing here gates
//! calls; it exists for diagnostics and the `probe` report.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Latency samples kept per dependency
const LATENCY_SAMPLES: usize = 512;

/// Consecutive failures after which a dependency is reported unhealthy
const UNHEALTHY_AFTER: u64 = 3;

#[derive(Debug, Default)]
struct Counters {
    successes: u64,
    failures: u64,
    consecutive_failures: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    latencies_ms: VecDeque<u64>,
}

/// Per-dependency health tracker
#[derive(Debug)]
pub struct HealthTracker {
    service: String,
    counters: Mutex<Counters>,
}

impl HealthTracker {
    /// Create a new health tracker
    #[must_use]
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Record a completed call and its latency
    pub fn record_success(&self, latency: Duration) {
        let mut c = self.counters.lock();
        let recovered = c.consecutive_failures >= UNHEALTHY_AFTER;

        c.successes += 1;
        c.consecutive_failures = 0;
        c.last_success = Some(Utc::now());
        if c.latencies_ms.len() == LATENCY_SAMPLES {
            c.latencies_ms.pop_front();
        }
        c.latencies_ms
            .push_back(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));

        if recovered {
            info!(service = %self.service, "Dependency recovered");
        }
    }

    /// Record a call that failed because of the dependency
    pub fn record_failure(&self) {
        let mut c = self.counters.lock();
        c.failures += 1;
        c.consecutive_failures += 1;
        c.last_failure = Some(Utc::now());

        if c.consecutive_failures == UNHEALTHY_AFTER {
            warn!(
                service = %self.service,
                consecutive_failures = c.consecutive_failures,
                "Dependency marked unhealthy"
            );
        }
    }

    /// Whether recent calls have been succeeding
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.counters.lock().consecutive_failures < UNHEALTHY_AFTER
    }

    /// Current health metrics
    #[must_use]
    pub fn metrics(&self) -> HealthMetrics {
        let c = self.counters.lock();
        let mut sorted: Vec<u64> = c.latencies_ms.iter().copied().collect();
        sorted.sort_unstable();

        HealthMetrics {
            service: self.service.clone(),
            healthy: c.consecutive_failures < UNHEALTHY_AFTER,
            success_count: c.successes,
            failure_count: c.failures,
            consecutive_failures: c.consecutive_failures,
            last_success: c.last_success,
            last_failure: c.last_failure,
            latency_p50_ms: percentile(&sorted, 0.50),
            latency_p95_ms: percentile(&sorted, 0.95),
            latency_p99_ms: percentile(&sorted, 0.99),
        }
    }
}

/// Nearest-rank percentile over sorted samples
fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let index = ((sorted.len() as f64) * p).floor() as usize;
    sorted.get(index.min(sorted.len() - 1)).copied()
}

/// Health metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Dependency name
    pub service: String,
    /// Fewer than three consecutive failures
    pub healthy: bool,
    /// Successful calls
    pub success_count: u64,
    /// Failed calls
    pub failure_count: u64,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// Last success
    pub last_success: Option<DateTime<Utc>>,
    /// Last failure
    pub last_failure: Option<DateTime<Utc>>,
    /// Median latency
    pub latency_p50_ms: Option<u64>,
    /// 95th percentile latency
    pub latency_p95_ms: Option<u64>,
    /// 99th percentile latency
    pub latency_p99_ms: Option<u64>,
}
