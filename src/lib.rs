//! Chat Resilience Library
//!
//! Inter-service resilience and traffic control for the chat platform's
//! microservices: how a service protects itself and its callers when it talks
//! to the Auth, Characters and LLM services.
//!
//! # Features
//!
//! - **Circuit breakers**: one per dependency, single half-open probe
//! - **Retries**: bounded exponential backoff for transient failures only
//! - **Rate limiting**: per-caller sliding windows (minute, hour, day)
//! - **Clients**: typed Auth, Characters and LLM clients over the failsafe stack
//! - **Admission middleware**: axum layer applying the rate limiter to inbound requests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod cli;
pub mod clients;
pub mod config;
pub mod error;
pub mod failsafe;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level` when set.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}

/// First 8 characters of an identifier, for logs
pub(crate) fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(end, _)| &id[..end])
}
