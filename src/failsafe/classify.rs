//! Outcome classification shared by every dependency client
//!
//! One pure mapping decides whether a failure is worth retrying and whether it
//! says anything about the dependency's health:
//!
//! ```text
//! timeout, connect error, 408, 429, 5xx   → Retryable         (counts against health)
//! 401, 403, 404, token/resource negatives → ExpectedNegative  (dependency is fine)
//! other 4xx, malformed body, local errors → Permanent         (not retried, not counted)
//! ```

use serde::Serialize;

use crate::Error;

/// How a failed outcome is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Transient; retry with backoff, counts toward opening the breaker
    Retryable,
    /// Will not succeed on retry; propagated immediately
    Permanent,
    /// The dependency answered correctly with a negative result
    ExpectedNegative,
}

impl Classification {
    /// Only transient failures indicate an unhealthy dependency
    #[must_use]
    pub fn counts_against_health(self) -> bool {
        self == Self::Retryable
    }
}

/// What went wrong on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection refused, reset, DNS failure
    Connect,
    /// Connect or request deadline expired
    Timeout,
    /// Response arrived with this HTTP status
    Status(u16),
    /// Response body could not be decoded
    Decode,
}

/// Classify a wire-level failure
#[must_use]
pub fn classify(kind: FailureKind) -> Classification {
    match kind {
        FailureKind::Connect | FailureKind::Timeout => Classification::Retryable,
        FailureKind::Status(status) => classify_status(status),
        FailureKind::Decode => Classification::Permanent,
    }
}

/// Classify an HTTP error status
#[must_use]
pub fn classify_status(status: u16) -> Classification {
    match status {
        408 | 429 | 500..=599 => Classification::Retryable,
        401 | 403 | 404 => Classification::ExpectedNegative,
        _ => Classification::Permanent,
    }
}

/// Classify any error the layer produces
#[must_use]
pub fn classify_error(error: &Error) -> Classification {
    match error {
        Error::Timeout { .. } => classify(FailureKind::Timeout),
        Error::Transport { .. } => classify(FailureKind::Connect),
        Error::UpstreamStatus { status, .. } => classify(FailureKind::Status(*status)),
        Error::MalformedResponse { .. } => classify(FailureKind::Decode),
        Error::AuthenticationFailed { .. } | Error::NotFound { .. } => {
            Classification::ExpectedNegative
        }
        Error::RetriesExhausted { last, .. } => classify_error(last),
        // Local decisions: never retried, never held against the dependency
        Error::CircuitOpen { .. }
        | Error::RateLimitExceeded { .. }
        | Error::Validation { .. }
        | Error::Config(_)
        | Error::Io(_)
        | Error::Json(_)
        | Error::Internal(_) => Classification::Permanent,
    }
}
