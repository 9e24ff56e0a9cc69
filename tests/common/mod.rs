//! Shared helpers: in-process stand-ins for the downstream services

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use chat_resilience::config::{
    CircuitBreakerConfig, Config, DependencyConfig, FailsafeConfig, RetryConfig,
};
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral localhost port
pub async fn spawn(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// A localhost URL nothing listens on
pub async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Request counter shared with a handler
#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicU32>);

impl Hits {
    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Failsafe settings with millisecond delays
pub fn fast_failsafe(failure_threshold: u32, max_retries: u32) -> FailsafeConfig {
    FailsafeConfig {
        circuit_breaker: CircuitBreakerConfig {
            enabled: true,
            failure_threshold,
            recovery_timeout: Duration::from_millis(200),
        },
        retry: RetryConfig {
            enabled: true,
            max_retries,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        ..FailsafeConfig::default()
    }
}

/// Dependency settings pointing at `base_url` with a short request timeout
pub fn dependency(base_url: &str) -> DependencyConfig {
    DependencyConfig {
        request_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_millis(300),
        health_timeout: Duration::from_millis(300),
        ..DependencyConfig::with_url(base_url)
    }
}

/// Full config with every service pointing at the given URLs
pub fn config(auth: &str, characters: &str, llm: &str) -> Config {
    let mut config = Config::default();
    config.failsafe = fast_failsafe(5, 1);
    config.services.auth = dependency(auth);
    config.services.characters = dependency(characters);
    config.services.llm = dependency(llm);
    config
}
