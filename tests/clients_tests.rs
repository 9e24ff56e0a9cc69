//! Clients exercised against in-process stand-ins for the downstream services

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chat_resilience::Error;
use chat_resilience::clients::{
    AuthServiceClient, CharactersServiceClient, GenerationParams, LlmClient, LlmConversation,
    LlmMessage, ServiceClients,
};
use chat_resilience::config::LlmConfig;
use chat_resilience::error::{AuthFailure, ErrorCode};
use chat_resilience::failsafe::CircuitState;
use common::{Hits, closed_port, dependency, fast_failsafe, spawn};
use serde_json::{Value, json};

async fn auth_client(base: &str, threshold: u32, retries: u32) -> AuthServiceClient {
    AuthServiceClient::new(&dependency(base), &fast_failsafe(threshold, retries)).unwrap()
}

fn llm_client(base: &str, retries: u32) -> LlmClient {
    LlmClient::new(
        &dependency(base),
        &fast_failsafe(5, retries),
        &LlmConfig::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_invalid_token_is_answered_once_and_never_trips_breaker() {
    let hits = Hits::default();
    let h = hits.clone();
    let base = spawn(Router::new().route(
        "/api/v1/auth/validate",
        get(move || {
            h.bump();
            async { StatusCode::UNAUTHORIZED }
        }),
    ))
    .await;

    let client = auth_client(&base, 2, 3).await;
    for _ in 0..5 {
        let err = client.validate_token("expired-token").await.unwrap_err();
        assert!(matches!(
            err,
            Error::AuthenticationFailed {
                reason: AuthFailure::InvalidToken,
                ..
            }
        ));
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    }

    assert_eq!(hits.get(), 5, "401 must not be retried");
    let breaker = &client.service().failsafe().circuit_breaker;
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test]
async fn test_forbidden_token_reports_insufficient_permissions() {
    let base = spawn(Router::new().route(
        "/api/v1/auth/validate",
        get(|| async { StatusCode::FORBIDDEN }),
    ))
    .await;

    let err = auth_client(&base, 5, 3)
        .await
        .validate_token("scoped-token")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::AuthenticationFailed {
            reason: AuthFailure::InsufficientPermissions,
            ..
        }
    ));
}

#[tokio::test]
async fn test_valid_token_returns_normalized_identity() {
    let base = spawn(Router::new().route(
        "/api/v1/auth/validate",
        get(|headers: HeaderMap| async move {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if auth == "Bearer good-token" {
                Json(json!({"id": 7, "username": "kai"})).into_response()
            } else {
                StatusCode::UNAUTHORIZED.into_response()
            }
        }),
    ))
    .await;

    let identity = auth_client(&base, 5, 3)
        .await
        .validate_token("good-token")
        .await
        .unwrap();
    assert_eq!(identity.user_id, "7");
    assert_eq!(identity.claims["username"], "kai");
}

#[tokio::test]
async fn test_server_errors_are_retried_then_exhausted() {
    let hits = Hits::default();
    let h = hits.clone();
    let base = spawn(Router::new().route(
        "/api/v1/auth/validate",
        get(move || {
            h.bump();
            async { StatusCode::SERVICE_UNAVAILABLE }
        }),
    ))
    .await;

    let client = auth_client(&base, 5, 2).await;
    let err = client.validate_token("token").await.unwrap_err();

    assert_eq!(hits.get(), 3);
    match &err {
        Error::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, Error::UpstreamStatus { status: 503, .. }));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(err.code(), ErrorCode::ServiceUnavailable);
    // The whole retry sequence is one breaker outcome
    assert_eq!(client.service().failsafe().circuit_breaker.failure_count(), 1);
}

#[tokio::test]
async fn test_connection_failures_open_the_breaker() {
    let base = closed_port().await;
    let client = CharactersServiceClient::new(&dependency(&base), &fast_failsafe(2, 0)).unwrap();

    for _ in 0..2 {
        let err = client.character_exists("char-1").await.unwrap_err();
        match &err {
            Error::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(*attempts, 1);
                assert!(matches!(**last, Error::Transport { .. }), "got {last:?}");
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(err.code(), ErrorCode::ServiceUnavailable);
    }

    let breaker = &client.service().failsafe().circuit_breaker;
    assert_eq!(breaker.state(), CircuitState::Open);

    let err = client.character_exists("char-1").await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert_eq!(err.code(), ErrorCode::ServiceUnavailable);
    assert_eq!(
        err.status_code(),
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    );
}

#[tokio::test]
async fn test_half_open_probe_closes_breaker_after_recovery() {
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    let base = spawn(Router::new().route(
        "/api/v1/characters/{id}",
        get(move || {
            let up = flag.load(Ordering::SeqCst);
            async move {
                if up {
                    Json(json!({"id": "char-1"})).into_response()
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }),
    ))
    .await;

    let client = CharactersServiceClient::new(&dependency(&base), &fast_failsafe(2, 0)).unwrap();
    for _ in 0..2 {
        assert!(client.character_exists("char-1").await.is_err());
    }
    let breaker = &client.service().failsafe().circuit_breaker;
    assert_eq!(breaker.state(), CircuitState::Open);

    healthy.store(true, Ordering::SeqCst);
    assert!(matches!(
        client.character_exists("char-1").await,
        Err(Error::CircuitOpen { .. })
    ));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(client.character_exists("char-1").await.unwrap());
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test]
async fn test_missing_character_is_false_not_error() {
    let base = spawn(
        Router::new()
            .route(
                "/api/v1/characters/known",
                get(|| async { Json(json!({"id": "known", "name": "Ada"})) }),
            )
            .route(
                "/api/v1/characters/broken",
                get(|| async { Json(json!(["not", "an", "object"])) }),
            ),
    )
    .await;

    let client = CharactersServiceClient::new(&dependency(&base), &fast_failsafe(5, 2)).unwrap();

    assert!(client.character_exists("known").await.unwrap());
    assert!(!client.character_exists("ghost").await.unwrap());
    assert_eq!(client.get_character("ghost").await.unwrap(), None);
    assert_eq!(
        client.get_character("known").await.unwrap().unwrap()["name"],
        "Ada"
    );

    let err = client.get_character("broken").await.unwrap_err();
    assert!(matches!(err, Error::MalformedResponse { .. }));
    assert_eq!(err.code(), ErrorCode::InvalidResponseFormat);
    assert_eq!(client.service().failsafe().circuit_breaker.failure_count(), 0);
}

#[tokio::test]
async fn test_llm_validation_error_is_not_retried() {
    let hits = Hits::default();
    let h = hits.clone();
    let base = spawn(Router::new().route(
        "/llm/message",
        post(move || {
            h.bump();
            async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"detail": "temperature out of range"})),
                )
            }
        }),
    ))
    .await;

    let client = llm_client(&base, 3);
    let err = client
        .send_message(&[LlmMessage::user("hi")], &GenerationParams::default())
        .await
        .unwrap_err();

    assert_eq!(hits.get(), 1);
    match &err {
        Error::UpstreamStatus { status, detail, .. } => {
            assert_eq!(*status, 400);
            assert_eq!(detail.as_deref(), Some("temperature out of range"));
        }
        other => panic!("expected UpstreamStatus, got {other:?}"),
    }
    // Downstream detail is never part of the public message
    assert!(!err.public_message().contains("temperature"));
    assert_eq!(client.service().failsafe().circuit_breaker.failure_count(), 0);
}

#[tokio::test]
async fn test_llm_rate_limit_is_retried() {
    let hits = Hits::default();
    let h = hits.clone();
    let base = spawn(Router::new().route(
        "/llm/message",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let n = h.bump();
            async move {
                assert!(headers.contains_key("x-request-id"));
                assert_eq!(body["stream"], false);
                assert_eq!(body["model"], "google/gemma-3-12b");
                if n == 1 {
                    StatusCode::TOO_MANY_REQUESTS.into_response()
                } else {
                    Json(json!({
                        "response": "Hello there",
                        "model": body["model"],
                        "tokens_used": 12,
                        "processing_time": 0.4,
                        "correlation_id": "corr-1",
                    }))
                    .into_response()
                }
            }
        }),
    ))
    .await;

    let client = llm_client(&base, 3);
    let reply = client
        .send_message(&[LlmMessage::user("hi")], &GenerationParams::default())
        .await
        .unwrap();

    assert_eq!(hits.get(), 2);
    assert_eq!(reply.response, "Hello there");
    assert_eq!(reply.tokens_used, 12);
    assert_eq!(reply.correlation_id, "corr-1");
    assert_eq!(client.available_permits(), LlmConfig::default().max_concurrent_requests);
}

#[tokio::test]
async fn test_slow_llm_surfaces_as_service_timeout() {
    let hits = Hits::default();
    let h = hits.clone();
    let base = spawn(Router::new().route(
        "/llm/message",
        post(move || {
            h.bump();
            async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                StatusCode::OK
            }
        }),
    ))
    .await;

    let client = llm_client(&base, 1);
    let err = client
        .send_message(&[LlmMessage::user("hi")], &GenerationParams::default())
        .await
        .unwrap_err();

    assert_eq!(hits.get(), 2);
    assert!(err.is_timeout(), "got {err:?}");
    assert_eq!(err.code(), ErrorCode::ServiceTimeout);
    assert_eq!(err.status_code(), axum::http::StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_conversation_records_both_turns() {
    let base = spawn(Router::new().route(
        "/llm/message",
        post(|Json(body): Json<Value>| async move {
            let turns = body["messages"].as_array().map_or(0, Vec::len);
            Json(json!({
                "response": format!("seen {turns} turns"),
                "model": "test-model",
            }))
        }),
    ))
    .await;

    let mut conversation = LlmConversation::new(
        llm_client(&base, 0),
        GenerationParams::with_model("test-model"),
        Some("Stay in character."),
    );

    let reply = conversation.send("Hello").await.unwrap();
    assert_eq!(reply.response, "seen 2 turns");
    let reply = conversation.send("Again").await.unwrap();
    assert_eq!(reply.response, "seen 4 turns");
    assert_eq!(conversation.message_count(), 5);
    assert!(conversation.transcript().ends_with("Assistant: seen 4 turns"));
}

#[tokio::test]
async fn test_cancelled_conversation_turn_leaves_history_untouched() {
    let base = spawn(Router::new().route(
        "/llm/message",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({"response": "too late"}))
        }),
    ))
    .await;

    let mut conversation = LlmConversation::new(
        llm_client(&base, 0),
        GenerationParams::default(),
        Some("Stay in character."),
    );
    conversation.add_assistant_message("Greetings, traveller.");

    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), conversation.send("Hello")).await;
    assert!(cancelled.is_err());
    assert_eq!(conversation.message_count(), 2);
    assert!(conversation.transcript().ends_with("Assistant: Greetings, traveller."));
}

#[tokio::test]
async fn test_probe_reports_each_dependency() {
    let up = spawn(
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/",
                get(|| async { Json(json!({"service": "characters", "version": "1.0"})) }),
            ),
    )
    .await;
    let down = closed_port().await;

    let clients = ServiceClients::from_config(&common::config(&down, &up, &down)).unwrap();
    let report = clients.probe_all().await;

    assert!(!report.all_reachable());
    let by_name = |name: &str| {
        report
            .dependencies
            .iter()
            .find(|d| d.status.service == name)
            .unwrap()
    };
    assert!(by_name("characters-service").reachable);
    assert_eq!(
        by_name("characters-service").info.as_ref().unwrap()["service"],
        "characters"
    );
    assert!(!by_name("auth-service").reachable);
    assert!(by_name("llm-service").info.is_none());

    // Probes never touch breaker state
    for status in clients.statuses() {
        assert_eq!(status.circuit.state, CircuitState::Closed);
        assert_eq!(status.health.failure_count, 0);
    }
}
