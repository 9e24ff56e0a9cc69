//! Resilient clients for downstream services
//!
//! Each client binds one service's request/response contract to a
//! [`Failsafe`] (circuit breaker + retry + health) and maps every outcome
//! onto the crate's [`Error`] taxonomy.

mod auth;
mod characters;
mod llm;

pub use auth::{AuthServiceClient, UserIdentity};
pub use characters::CharactersServiceClient;
pub use llm::{GenerationParams, LlmClient, LlmConversation, LlmMessage, LlmResponse, Role};

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::{Config, DependencyConfig, FailsafeConfig};
use crate::failsafe::{CircuitSnapshot, Failsafe, HealthMetrics};
use crate::{Error, Result};

/// Auth service dependency name
pub const AUTH_SERVICE: &str = "auth-service";
/// Characters service dependency name
pub const CHARACTERS_SERVICE: &str = "characters-service";
/// LLM service dependency name
pub const LLM_SERVICE: &str = "llm-service";

/// HTTP plumbing shared by every dependency client
#[derive(Debug, Clone)]
pub struct ServiceClient {
    name: &'static str,
    http: Client,
    base_url: Url,
    health_timeout: Duration,
    failsafe: Failsafe,
}

impl ServiceClient {
    /// Create a client for one dependency
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(
        name: &'static str,
        config: &DependencyConfig,
        defaults: &FailsafeConfig,
    ) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            Error::Config(format!("invalid base URL for {name}: {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "base URL for {name} cannot carry a path: {base_url}"
            )));
        }

        let http = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client for {name}: {e}")))?;

        Ok(Self {
            name,
            http,
            base_url,
            health_timeout: config.health_timeout,
            failsafe: Failsafe::new(
                name,
                config.effective_circuit_breaker(defaults),
                config.effective_retry(defaults),
            ),
        })
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Base URL
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Failsafe guarding this dependency
    #[must_use]
    pub fn failsafe(&self) -> &Failsafe {
        &self.failsafe
    }

    /// Underlying HTTP client
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Build `base_url/seg1/seg2/...`, percent-encoding each segment
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the base URL cannot take path segments.
    pub fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Internal(format!("{} base URL cannot be a base", self.name)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Run `operation` behind this dependency's breaker and retry policy
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.failsafe.call(operation).await
    }

    /// Send a request, mapping transport failures; the status is not checked
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Transport`].
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| Error::from_reqwest(self.name, &e))
    }

    /// Read and decode a JSON body
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] if the body is not the expected
    /// shape, or [`Error::Timeout`] if reading it stalls.
    pub async fn read_json<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::from_reqwest(self.name, &e))?;
        serde_json::from_slice(&body).map_err(|e| Error::MalformedResponse {
            service: self.name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Turn a non-success response into [`Error::UpstreamStatus`].
    ///
    /// The `detail` field of a JSON error body is kept for logs; the body
    /// itself is never exposed to callers.
    pub async fn status_error(&self, response: Response) -> Error {
        let status = response.status().as_u16();
        let detail = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| extract_detail(&body));

        if status >= 500 {
            warn!(service = self.name, status, detail = ?detail, "Dependency returned server error");
        } else {
            debug!(service = self.name, status, detail = ?detail, "Dependency rejected request");
        }

        Error::UpstreamStatus {
            service: self.name.to_string(),
            status,
            detail,
        }
    }

    /// `GET /health` with the short probe timeout. Bypasses the breaker and
    /// retry policy so a probe never changes dependency state.
    pub async fn health_check(&self) -> bool {
        let Ok(url) = self.url(&["health"]) else {
            return false;
        };
        match self
            .http
            .get(url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!(service = self.name, error = %e, "Health check failed");
                false
            }
        }
    }

    /// `GET /` service description, if the dependency answers with JSON
    pub async fn service_info(&self) -> Option<Value> {
        let response = self
            .http
            .get(self.base_url.clone())
            .timeout(self.health_timeout)
            .send()
            .await
            .ok()?;
        if response.status() != StatusCode::OK {
            return None;
        }
        response.json().await.ok()
    }

    /// Breaker and health view of this dependency
    #[must_use]
    pub fn status(&self) -> DependencyStatus {
        DependencyStatus {
            service: self.name,
            base_url: self.base_url.to_string(),
            circuit: self.failsafe.circuit_breaker.snapshot(),
            health: self.failsafe.health_metrics(),
        }
    }
}

/// `detail` may be a string or a structured validation report
fn extract_detail(body: &Value) -> Option<String> {
    match body.get("detail")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Circuit and health state for one dependency
#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    /// Dependency name
    pub service: &'static str,
    /// Base URL
    pub base_url: String,
    /// Circuit breaker snapshot
    pub circuit: CircuitSnapshot,
    /// Call statistics
    pub health: HealthMetrics,
}

/// Result of probing one dependency
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    /// Whether `/health` answered 200
    pub reachable: bool,
    /// `GET /` payload, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    /// Breaker and health state
    #[serde(flatten)]
    pub status: DependencyStatus,
}

/// Probe of every dependency
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    /// When the probe ran
    pub checked_at: DateTime<Utc>,
    /// One entry per dependency
    pub dependencies: Vec<ProbeResult>,
}

impl ProbeReport {
    /// Whether every dependency answered its health check
    #[must_use]
    pub fn all_reachable(&self) -> bool {
        self.dependencies.iter().all(|d| d.reachable)
    }
}

/// All downstream clients, built once at startup
#[derive(Debug, Clone)]
pub struct ServiceClients {
    /// Auth service
    pub auth: AuthServiceClient,
    /// Characters service
    pub characters: CharactersServiceClient,
    /// LLM service
    pub llm: LlmClient,
}

impl ServiceClients {
    /// Build every client from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            auth: AuthServiceClient::new(&config.services.auth, &config.failsafe)?,
            characters: CharactersServiceClient::new(
                &config.services.characters,
                &config.failsafe,
            )?,
            llm: LlmClient::new(&config.services.llm, &config.failsafe, &config.llm)?,
        })
    }

    fn services(&self) -> [&ServiceClient; 3] {
        [
            self.auth.service(),
            self.characters.service(),
            self.llm.service(),
        ]
    }

    /// Health-check every dependency concurrently
    pub async fn probe_all(&self) -> ProbeReport {
        let [auth, characters, llm] = self.services();
        let (auth, characters, llm) = tokio::join!(probe(auth), probe(characters), probe(llm));
        ProbeReport {
            checked_at: Utc::now(),
            dependencies: vec![auth, characters, llm],
        }
    }

    /// Breaker and health view of every dependency
    #[must_use]
    pub fn statuses(&self) -> Vec<DependencyStatus> {
        self.services().iter().map(|s| s.status()).collect()
    }
}

async fn probe(service: &ServiceClient) -> ProbeResult {
    let (reachable, info) = tokio::join!(service.health_check(), service.service_info());
    ProbeResult {
        reachable,
        info,
        status: service.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> ServiceClient {
        ServiceClient::new(
            CHARACTERS_SERVICE,
            &DependencyConfig::with_url(base_url),
            &FailsafeConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_url_segments_are_encoded() {
        let c = client("http://localhost:8002");
        let url = c.url(&["api", "v1", "characters", "a b/c"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8002/api/v1/characters/a%20b%2Fc"
        );
    }

    #[test]
    fn test_url_keeps_base_path() {
        let c = client("http://gateway.local/characters/");
        let url = c.url(&["health"]).unwrap();
        assert_eq!(url.as_str(), "http://gateway.local/characters/health");
    }

    #[test]
    fn test_rejects_non_base_url() {
        let err = ServiceClient::new(
            AUTH_SERVICE,
            &DependencyConfig::with_url("mailto:ops@example.com"),
            &FailsafeConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_extract_detail() {
        let body = serde_json::json!({"detail": "messages must not be empty"});
        assert_eq!(
            extract_detail(&body).as_deref(),
            Some("messages must not be empty")
        );

        let body = serde_json::json!({"detail": [{"loc": ["body", "temperature"]}]});
        assert!(extract_detail(&body).unwrap().contains("temperature"));

        assert_eq!(extract_detail(&serde_json::json!({"error": "x"})), None);
    }

    #[test]
    fn test_status_of_fresh_client() {
        let status = client("http://localhost:8002").status();
        assert_eq!(status.service, CHARACTERS_SERVICE);
        assert_eq!(status.circuit.failure_count, 0);
        assert!(status.health.healthy);
    }
}
