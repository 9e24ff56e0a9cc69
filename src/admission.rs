//! Inbound admission control
//!
//! axum middleware that runs the [`RateLimiter`] before a handler executes.
//! Rejected requests never reach the handler and receive the standard error
//! body with a `Retry-After` header; admitted responses carry the remaining
//! quota of every window.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::failsafe::{LimitWindow, RateLimiter};

/// Header consulted when no [`CallerIdentity`] extension is present
pub const USER_ID_HEADER: &str = "x-user-id";

/// Identity used when a request names no caller
pub const ANONYMOUS: &str = "anonymous";

/// Caller identity placed in request extensions by an upstream auth layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

impl CallerIdentity {
    /// Resolve the identity for `request`
    #[must_use]
    pub fn from_request<B>(request: &Request<B>) -> Self {
        if let Some(identity) = request.extensions().get::<Self>() {
            return identity.clone();
        }
        let header = request
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        Self(header.unwrap_or(ANONYMOUS).to_string())
    }
}

fn remaining_header(window: LimitWindow) -> HeaderName {
    HeaderName::from_static(match window {
        LimitWindow::Minute => "x-ratelimit-remaining-minute",
        LimitWindow::Hour => "x-ratelimit-remaining-hour",
        LimitWindow::Day => "x-ratelimit-remaining-day",
    })
}

/// Rate limiting middleware, for use with `middleware::from_fn_with_state`
pub async fn enforce_rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let CallerIdentity(identity) = CallerIdentity::from_request(&request);

    if let Err(e) = limiter.check_rate_limit(&identity) {
        return e.into_response();
    }

    let mut response = next.run(request).await;
    if limiter.is_enabled() {
        let info = limiter.rate_limit_info(&identity);
        let headers = response.headers_mut();
        for quota in &info.windows {
            headers.insert(remaining_header(quota.window), HeaderValue::from(quota.remaining));
        }
    }
    response
}
