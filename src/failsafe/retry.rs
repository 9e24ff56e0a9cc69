//! Retry logic with exponential backoff
//!
//! Delay before retry `n` (0-based) is `base_delay * 2^n`, capped at
//! `max_delay`. Only failures classified as retryable are retried.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::failsafe::Classification;
use crate::{Error, Result};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// A policy that makes exactly one attempt
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay iterator for one retry sequence; yields `max_retries` delays
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay.max(self.base_delay))
            .with_factor(2.0)
            .with_max_times(self.max_retries as usize)
            .build()
    }

    /// The full delay schedule, for diagnostics
    #[must_use]
    pub fn schedule(&self) -> Vec<Duration> {
        if self.enabled {
            self.backoff().collect()
        } else {
            Vec::new()
        }
    }

    /// Run `operation`, retrying failures that [`Error::classification`]
    /// marks as retryable
    pub async fn execute<T, F, Fut>(&self, service: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_retry(service, operation, Error::classification)
            .await
    }

    /// Run `operation` with a caller-supplied classifier.
    ///
    /// Non-retryable failures propagate untouched after one attempt. When
    /// retries run out the last failure is wrapped in
    /// [`Error::RetriesExhausted`] together with the number of attempts made.
    pub async fn execute_with_retry<T, F, Fut, C>(
        &self,
        service: &str,
        mut operation: F,
        classify: C,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> Classification,
    {
        if !self.enabled {
            return operation().await;
        }

        let mut delays = self.backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let error = match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(service, attempts, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if classify(&error) != Classification::Retryable {
                return Err(error);
            }

            let Some(delay) = delays.next() else {
                warn!(service, attempts, error = %error, "Retries exhausted");
                return Err(Error::RetriesExhausted {
                    service: service.to_string(),
                    attempts,
                    last: Box::new(error),
                });
            };

            warn!(
                service,
                attempt = attempts,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after backoff"
            );
            sleep(delay).await;
        }
    }
}
