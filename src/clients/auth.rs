//! Auth service client

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{AUTH_SERVICE, ServiceClient};
use crate::config::{DependencyConfig, FailsafeConfig};
use crate::error::AuthFailure;
use crate::{Error, Result, short_id};

/// Identity returned for a valid token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// User identifier
    pub user_id: String,
    /// Remaining fields of the validation payload
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl UserIdentity {
    /// Build from a validation payload, accepting `id` in place of `user_id`
    fn from_payload(body: Value) -> Result<Self> {
        let Value::Object(mut claims) = body else {
            return Err(malformed("validation payload is not an object"));
        };

        let raw = claims
            .remove("user_id")
            .or_else(|| claims.remove("id"))
            .ok_or_else(|| malformed("validation payload has no user identifier"))?;

        let user_id = match raw {
            Value::String(s) if !s.is_empty() => s,
            Value::Number(n) => n.to_string(),
            _ => return Err(malformed("user identifier is not a string or number")),
        };

        Ok(Self { user_id, claims })
    }
}

fn malformed(reason: &str) -> Error {
    Error::MalformedResponse {
        service: AUTH_SERVICE.to_string(),
        reason: reason.to_string(),
    }
}

/// Client for the Auth service
#[derive(Debug, Clone)]
pub struct AuthServiceClient {
    service: ServiceClient,
}

impl AuthServiceClient {
    /// Create a new client
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the client cannot be built.
    pub fn new(config: &DependencyConfig, defaults: &FailsafeConfig) -> Result<Self> {
        Ok(Self {
            service: ServiceClient::new(AUTH_SERVICE, config, defaults)?,
        })
    }

    /// Shared HTTP and failsafe plumbing
    #[must_use]
    pub fn service(&self) -> &ServiceClient {
        &self.service
    }

    /// Validate a bearer token.
    ///
    /// 401 and 403 are answers, not outages: they surface as
    /// [`Error::AuthenticationFailed`] and never open the breaker.
    ///
    /// # Errors
    ///
    /// - [`Error::AuthenticationFailed`] for a missing, invalid or under-scoped token
    /// - [`Error::MalformedResponse`] if the payload carries no user identifier
    /// - dependency errors (`CircuitOpen`, `RetriesExhausted`, `Timeout`, ...)
    #[tracing::instrument(skip_all, fields(service = AUTH_SERVICE))]
    pub async fn validate_token(&self, token: &str) -> Result<UserIdentity> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::AuthenticationFailed {
                service: AUTH_SERVICE.to_string(),
                reason: AuthFailure::TokenRequired,
            });
        }

        let service = &self.service;
        let url = &service.url(&["api", "v1", "auth", "validate"])?;

        let body: Value = service
            .call(move || async move {
                let response = service
                    .send(service.http().get(url.clone()).bearer_auth(token))
                    .await?;

                let reason = match response.status() {
                    StatusCode::UNAUTHORIZED => AuthFailure::InvalidToken,
                    StatusCode::FORBIDDEN => AuthFailure::InsufficientPermissions,
                    s if s.is_success() => return service.read_json::<Value>(response).await,
                    _ => return Err(service.status_error(response).await),
                };
                Err(Error::AuthenticationFailed {
                    service: AUTH_SERVICE.to_string(),
                    reason,
                })
            })
            .await?;

        let identity = UserIdentity::from_payload(body)?;
        debug!(user = short_id(&identity.user_id), "Token validated");
        Ok(identity)
    }

    /// Fetch a user's profile; `None` when the user does not exist
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the service cannot answer.
    pub async fn get_user_info(&self, user_id: &str) -> Result<Option<Value>> {
        if user_id.is_empty() {
            return Err(Error::validation("user_id", "must not be empty"));
        }

        let service = &self.service;
        let url = &service.url(&["api", "v1", "users", user_id])?;
        debug!(user = short_id(user_id), "Fetching user info");

        service
            .call(move || async move {
                let response = service.send(service.http().get(url.clone())).await?;
                match response.status() {
                    StatusCode::NOT_FOUND => Ok(None),
                    s if s.is_success() => service.read_json::<Value>(response).await.map(Some),
                    _ => Err(service.status_error(response).await),
                }
            })
            .await
    }

    /// `GET /health`
    pub async fn health_check(&self) -> bool {
        self.service.health_check().await
    }

    /// `GET /`
    pub async fn service_info(&self) -> Option<Value> {
        self.service.service_info().await
    }
}
