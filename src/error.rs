//! Error types for the resilience layer
//!
//! Every failure the layer surfaces maps onto a small, stable set of wire
//! codes (see [`ErrorCode`]) plus structured details. The variants keep the
//! underlying cause for logging; [`Error::public_message`] is what crosses the
//! service boundary.

use std::io;
use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::failsafe::{Classification, LimitWindow, classify_error};

/// Result type alias for the resilience layer
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Dependency unreachable, circuit open, or retries exhausted
    ServiceUnavailable,
    /// Dependency did not answer in time
    ServiceTimeout,
    /// Caller exceeded one of its quota windows
    RateLimitExceeded,
    /// Token missing, invalid, or lacking permissions
    AuthenticationFailed,
    /// Requested resource does not exist
    NotFound,
    /// Dependency answered with an unexpected body
    InvalidResponseFormat,
    /// Request rejected as invalid (locally or by the dependency)
    ValidationError,
    /// Configuration could not be loaded or is inconsistent
    ConfigurationError,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    /// The code as it appears on the wire
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::ServiceTimeout => "SERVICE_TIMEOUT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidResponseFormat => "INVALID_RESPONSE_FORMAT",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an authentication check was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    /// No token was supplied
    TokenRequired,
    /// Token is invalid or expired (HTTP 401 from the auth service)
    InvalidToken,
    /// Token is valid but lacks scope (HTTP 403 from the auth service)
    InsufficientPermissions,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::TokenRequired => "token is required",
            Self::InvalidToken => "invalid or expired token",
            Self::InsufficientPermissions => "token lacks required permissions",
        })
    }
}

/// Resilience layer errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request rejected before any network call
    #[error("Validation error on '{field}': {message}")]
    Validation {
        /// Offending field
        field: String,
        /// What was wrong with it
        message: String,
    },

    /// Caller exceeded a quota window
    #[error("Rate limit exceeded: {limit_type}")]
    RateLimitExceeded {
        /// Window that was breached
        limit_type: LimitWindow,
        /// Configured limit for that window
        limit: u32,
        /// Requests counted in the window at rejection time
        current: u32,
        /// When the oldest counted request leaves the window
        reset_time: DateTime<Utc>,
    },

    /// Circuit breaker refused the call; the dependency was not contacted
    #[error("Service '{service}' unavailable: circuit breaker is open")]
    CircuitOpen {
        /// Dependency name
        service: String,
        /// Time until a probe call will be admitted
        retry_after: Duration,
    },

    /// Request to the dependency timed out
    #[error("Service '{service}' timed out")]
    Timeout {
        /// Dependency name
        service: String,
    },

    /// Connection-level failure (refused, reset, DNS)
    #[error("Service '{service}' unreachable: {message}")]
    Transport {
        /// Dependency name
        service: String,
        /// Transport error text (logged, never returned to callers)
        message: String,
    },

    /// Dependency answered with an error status
    #[error("Service '{service}' returned HTTP {status}")]
    UpstreamStatus {
        /// Dependency name
        service: String,
        /// HTTP status code
        status: u16,
        /// `detail` field from the error body, if any (logged only)
        detail: Option<String>,
    },

    /// Transient failures persisted through every retry
    #[error("Service '{service}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Dependency name
        service: String,
        /// Attempts made, including the first
        attempts: u32,
        /// Last underlying failure
        #[source]
        last: Box<Error>,
    },

    /// Token rejected
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed {
        /// Dependency that rejected the token (or this service for a missing token)
        service: String,
        /// Rejection reason
        reason: AuthFailure,
    },

    /// Resource does not exist
    #[error("{resource} not found: {identifier}")]
    NotFound {
        /// Resource kind
        resource: String,
        /// Identifier that was looked up
        identifier: String,
    },

    /// Dependency answered with a body of the wrong shape
    #[error("Malformed response from '{service}': {reason}")]
    MalformedResponse {
        /// Dependency name
        service: String,
        /// What was wrong with the body
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            identifier: identifier.into(),
        }
    }

    /// Translate a `reqwest` failure into the layer's taxonomy.
    ///
    /// Timeouts are checked first: a body read that stalls is a timeout, not a
    /// malformed body.
    #[must_use]
    pub fn from_reqwest(service: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                service: service.to_string(),
            }
        } else if err.is_decode() {
            Self::MalformedResponse {
                service: service.to_string(),
                reason: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            Self::UpstreamStatus {
                service: service.to_string(),
                status: status.as_u16(),
                detail: None,
            }
        } else {
            Self::Transport {
                service: service.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Wire code for this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::ConfigurationError,
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            Self::CircuitOpen { .. } | Self::Transport { .. } => ErrorCode::ServiceUnavailable,
            Self::Timeout { .. } => ErrorCode::ServiceTimeout,
            Self::UpstreamStatus { status, .. } => match status {
                401 | 403 => ErrorCode::AuthenticationFailed,
                404 => ErrorCode::NotFound,
                408 | 429 | 500.. => ErrorCode::ServiceUnavailable,
                _ => ErrorCode::ValidationError,
            },
            Self::RetriesExhausted { last, .. } if last.is_timeout() => ErrorCode::ServiceTimeout,
            Self::RetriesExhausted { .. } => ErrorCode::ServiceUnavailable,
            Self::AuthenticationFailed { .. } => ErrorCode::AuthenticationFailed,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::MalformedResponse { .. } => ErrorCode::InvalidResponseFormat,
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// HTTP status this error is reported with
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed {
                reason: AuthFailure::InsufficientPermissions,
                ..
            }
            | Self::UpstreamStatus { status: 403, .. } => StatusCode::FORBIDDEN,
            Self::MalformedResponse { .. } => StatusCode::BAD_GATEWAY,
            _ => match self.code() {
                ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::ServiceTimeout => StatusCode::GATEWAY_TIMEOUT,
                ErrorCode::AuthenticationFailed => StatusCode::UNAUTHORIZED,
                ErrorCode::NotFound => StatusCode::NOT_FOUND,
                ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Message safe to show callers: no transport text, no downstream bodies
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Transport { service, .. } | Self::CircuitOpen { service, .. } => {
                format!("Service '{service}' is unavailable")
            }
            Self::UpstreamStatus { service, status, .. } => {
                format!("Service '{service}' rejected the request (HTTP {status})")
            }
            Self::RetriesExhausted {
                service, attempts, ..
            } => format!("Service '{service}' is unavailable after {attempts} attempts"),
            Self::MalformedResponse { service, .. } => {
                format!("Service '{service}' returned an invalid response")
            }
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Internal(_) => {
                "Internal error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Structured details attached to the error body
    #[must_use]
    pub fn details(&self) -> Value {
        match self {
            Self::RateLimitExceeded {
                limit_type,
                limit,
                current,
                reset_time,
            } => json!({
                "limit_type": limit_type.limit_type(),
                "limit": limit,
                "current": current,
                "reset_time": reset_time.timestamp(),
            }),
            Self::CircuitOpen {
                service,
                retry_after,
            } => json!({
                "service_name": service,
                "retry_after_seconds": retry_after.as_secs(),
            }),
            Self::Timeout { service }
            | Self::Transport { service, .. }
            | Self::MalformedResponse { service, .. } => json!({ "service_name": service }),
            Self::UpstreamStatus {
                service, status, ..
            } => json!({ "service_name": service, "status_code": status }),
            Self::RetriesExhausted {
                service, attempts, ..
            } => json!({ "service_name": service, "attempts": attempts }),
            Self::AuthenticationFailed { service, reason } => {
                json!({ "service_name": service, "reason": reason })
            }
            Self::NotFound {
                resource,
                identifier,
            } => json!({ "resource": resource, "identifier": identifier }),
            Self::Validation { field, .. } => json!({ "field": field }),
            _ => json!({}),
        }
    }

    /// How the retry policy and circuit breaker treat this error
    #[must_use]
    pub fn classification(&self) -> Classification {
        classify_error(self)
    }

    /// Whether a retry may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.classification() == Classification::Retryable
    }

    /// Whether this outcome means the dependency itself is failing
    #[must_use]
    pub fn counts_against_health(&self) -> bool {
        self.classification().counts_against_health()
    }

    /// Whether this error is, or wraps, a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::UpstreamStatus { status: 408, .. } => true,
            Self::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// Seconds a caller should wait before trying again, if known
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { reset_time, .. } => Some(
                (*reset_time - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO),
            ),
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Body shape for errors returned across the service boundary
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorPayload,
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    code: ErrorCode,
    message: String,
    details: Value,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after();
        let body = ErrorBody {
            error: ErrorPayload {
                code: self.code(),
                message: self.public_message(),
                details: self.details(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(wait) = retry_after {
            // Round up so clients never retry a moment too early
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}
