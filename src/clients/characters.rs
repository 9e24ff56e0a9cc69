//! Characters service client

use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use super::{CHARACTERS_SERVICE, ServiceClient};
use crate::config::{DependencyConfig, FailsafeConfig};
use crate::{Error, Result, short_id};

/// Client for the Characters service
#[derive(Debug, Clone)]
pub struct CharactersServiceClient {
    service: ServiceClient,
}

impl CharactersServiceClient {
    /// Create a new client
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the client cannot be built.
    pub fn new(config: &DependencyConfig, defaults: &FailsafeConfig) -> Result<Self> {
        Ok(Self {
            service: ServiceClient::new(CHARACTERS_SERVICE, config, defaults)?,
        })
    }

    /// Shared HTTP and failsafe plumbing
    #[must_use]
    pub fn service(&self) -> &ServiceClient {
        &self.service
    }

    /// Whether the character exists; a 404 is `false`, not an error
    ///
    /// # Errors
    ///
    /// Returns a dependency error if the service cannot answer.
    pub async fn character_exists(&self, character_id: &str) -> Result<bool> {
        let service = &self.service;
        let url = &character_url(service, character_id)?;
        debug!(character = short_id(character_id), "Checking character exists");

        service
            .call(move || async move {
                let response = service.send(service.http().get(url.clone())).await?;
                match response.status() {
                    StatusCode::NOT_FOUND => Ok(false),
                    s if s.is_success() => Ok(true),
                    _ => Err(service.status_error(response).await),
                }
            })
            .await
    }

    /// Fetch a character; `None` when it does not exist
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] if the body is not a JSON object,
    /// or a dependency error if the service cannot answer.
    pub async fn get_character(&self, character_id: &str) -> Result<Option<Value>> {
        let service = &self.service;
        let url = &character_url(service, character_id)?;
        debug!(character = short_id(character_id), "Fetching character");

        service
            .call(move || async move {
                let response = service.send(service.http().get(url.clone())).await?;
                match response.status() {
                    StatusCode::NOT_FOUND => Ok(None),
                    s if s.is_success() => match service.read_json::<Value>(response).await? {
                        body @ Value::Object(_) => Ok(Some(body)),
                        _ => Err(Error::MalformedResponse {
                            service: CHARACTERS_SERVICE.to_string(),
                            reason: "character payload is not an object".to_string(),
                        }),
                    },
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

fn character_url(service: &ServiceClient, character_id: &str) -> Result<url::Url> {
    if character_id.is_empty() {
        return Err(Error::validation("character_id", "must not be empty"));
    }
    service.url(&["api", "v1", "characters", character_id])
}
