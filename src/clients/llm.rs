//! LLM service client and conversation helper
//!
//! `POST /llm/message` is the only generation endpoint. Requests are
//! validated locally before any network call, filled in from the `llm`
//! config defaults, and bounded by a semaphore so a burst of callers cannot
//! pile unlimited in-flight generations onto the LLM service.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::info;
use uuid::Uuid;

use super::{LLM_SERVICE, ServiceClient};
use crate::config::{DependencyConfig, FailsafeConfig, LlmConfig};
use crate::{Error, Result};

/// Header carrying the per-call request id
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions for the model
    System,
    /// End user
    User,
    /// Model output
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "System",
            Self::User => "User",
            Self::Assistant => "Assistant",
        })
    }
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmMessage {
    /// Speaker
    pub role: Role,
    /// Text
    pub content: String,
}

impl LlmMessage {
    /// System turn
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// User turn
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Assistant turn
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-request generation settings; unset fields fall back to config
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    /// Model name
    pub model: Option<String>,
    /// Sampling temperature (0.0 to 2.0)
    pub temperature: Option<f32>,
    /// Tokens to generate
    pub max_tokens: Option<u32>,
    /// Nucleus sampling (0.0 to 1.0)
    pub top_p: Option<f32>,
}

impl GenerationParams {
    /// Params selecting `model`
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }
}

/// Generated reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated text
    pub response: String,
    /// Model that produced it
    pub model: String,
    /// Tokens consumed
    #[serde(default)]
    pub tokens_used: u32,
    /// Seconds spent generating, as reported by the LLM service
    #[serde(default)]
    pub processing_time: f64,
    /// Correlation id assigned by the LLM service
    #[serde(default = "unknown_correlation")]
    pub correlation_id: String,
}

fn unknown_correlation() -> String {
    "unknown".to_string()
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    messages: &'a [LlmMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

/// Client for the LLM service
#[derive(Debug, Clone)]
pub struct LlmClient {
    service: ServiceClient,
    defaults: LlmConfig,
    permits: Arc<Semaphore>,
}

impl LlmClient {
    /// Create a new client
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the client cannot be built.
    pub fn new(
        config: &DependencyConfig,
        defaults: &FailsafeConfig,
        llm: &LlmConfig,
    ) -> Result<Self> {
        Ok(Self {
            service: ServiceClient::new(LLM_SERVICE, config, defaults)?,
            defaults: llm.clone(),
            permits: Arc::new(Semaphore::new(llm.max_concurrent_requests.max(1))),
        })
    }

    /// Shared HTTP and failsafe plumbing
    #[must_use]
    pub fn service(&self) -> &ServiceClient {
        &self.service
    }

    /// Request slots currently free
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn build_request<'a>(
        &'a self,
        messages: &'a [LlmMessage],
        params: &'a GenerationParams,
    ) -> Result<MessageRequest<'a>> {
        if messages.is_empty() {
            return Err(Error::validation("messages", "must not be empty"));
        }
        if messages.len() > self.defaults.max_messages {
            return Err(Error::validation(
                "messages",
                format!(
                    "{} messages exceeds the limit of {}",
                    messages.len(),
                    self.defaults.max_messages
                ),
            ));
        }

        let temperature = params
            .temperature
            .unwrap_or(self.defaults.default_temperature);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::validation(
                "temperature",
                "must be between 0.0 and 2.0",
            ));
        }
        if let Some(top_p) = params.top_p
            && !(0.0..=1.0).contains(&top_p)
        {
            return Err(Error::validation("top_p", "must be between 0.0 and 1.0"));
        }

        let max_tokens = params
            .max_tokens
            .unwrap_or(self.defaults.max_tokens_per_request);
        if max_tokens == 0 {
            return Err(Error::validation("max_tokens", "must be greater than 0"));
        }

        Ok(MessageRequest {
            model: params
                .model
                .as_deref()
                .unwrap_or(&self.defaults.default_model),
            messages,
            temperature,
            max_tokens,
            stream: false,
            top_p: params.top_p,
        })
    }

    /// Generate a reply to `messages`.
    ///
    /// Timeouts, 408, 429 and 5xx are retried with backoff; 400 and 422 are
    /// returned after one attempt.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for requests rejected before any network call
    /// - [`Error::MalformedResponse`] if the reply lacks `response` or `model`
    /// - dependency errors (`CircuitOpen`, `RetriesExhausted`, `UpstreamStatus`, ...)
    pub async fn send_message(
        &self,
        messages: &[LlmMessage],
        params: &GenerationParams,
    ) -> Result<LlmResponse> {
        let request = &self.build_request(messages, params)?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::Internal(format!("LLM request slots closed: {e}")))?;

        let service = &self.service;
        let url = &service.url(&["llm", "message"])?;
        let request_id = &HeaderValue::try_from(Uuid::new_v4().to_string())
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!(
            model = request.model,
            message_count = messages.len(),
            max_tokens = request.max_tokens,
            request_id = ?request_id,
            "Sending message to LLM"
        );
        let started = Instant::now();

        let reply: LlmResponse = service
            .call(move || async move {
                let response = service
                    .send(
                        service
                            .http()
                            .post(url.clone())
                            .header(REQUEST_ID_HEADER, request_id.clone())
                            .json(request),
                    )
                    .await?;
                if response.status().is_success() {
                    service.read_json::<LlmResponse>(response).await
                } else {
                    Err(service.status_error(response).await)
                }
            })
            .await?;

        info!(
            correlation_id = %reply.correlation_id,
            tokens_used = reply.tokens_used,
            processing_time = reply.processing_time,
            total_ms = started.elapsed().as_millis() as u64,
            "LLM response received"
        );
        Ok(reply)
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

/// Conversation history kept alongside an [`LlmClient`]
#[derive(Debug, Clone)]
pub struct LlmConversation {
    client: LlmClient,
    params: GenerationParams,
    messages: Vec<LlmMessage>,
}

impl LlmConversation {
    /// Start a conversation, optionally seeded with a system prompt
    #[must_use]
    pub fn new(client: LlmClient, params: GenerationParams, system_prompt: Option<&str>) -> Self {
        let messages = system_prompt
            .map(LlmMessage::system)
            .into_iter()
            .collect();
        Self {
            client,
            params,
            messages,
        }
    }

    /// Append a user turn without sending it
    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(LlmMessage::user(content));
    }

    /// Append an assistant turn
    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        self.messages.push(LlmMessage::assistant(content));
    }

    /// Send `user_message` with the full history and record the reply.
    ///
    /// History changes only once a reply arrives, so a failed or cancelled
    /// send never leaves an unanswered user turn behind.
    ///
    /// # Errors
    ///
    /// Returns whatever [`LlmClient::send_message`] returns.
    pub async fn send(&mut self, user_message: impl Into<String>) -> Result<LlmResponse> {
        let mut history = Vec::with_capacity(self.messages.len() + 2);
        history.extend_from_slice(&self.messages);
        history.push(LlmMessage::user(user_message));

        let reply = self.client.send_message(&history, &self.params).await?;
        history.push(LlmMessage::assistant(reply.response.clone()));
        self.messages = history;
        Ok(reply)
    }

    /// Drop the history, optionally keeping a leading system prompt
    pub fn clear_history(&mut self, keep_system_prompt: bool) {
        let keep = keep_system_prompt
            && self
                .messages
                .first()
                .is_some_and(|m| m.role == Role::System);
        self.messages.truncate(usize::from(keep));
    }

    /// Turns in the history
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// History, oldest first
    #[must_use]
    pub fn messages(&self) -> &[LlmMessage] {
        &self.messages
    }

    /// History as `Role: content` lines
    #[must_use]
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
