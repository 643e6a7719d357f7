//! HTTP 429 handling on the ordinary and stream channels.

mod common;

use chrono::{Duration as TimeDelta, Utc};
use codoc_chat::{ChatError, SendOutcome};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use common::{controller, ChatMockServer, PROBLEM};

fn assert_near(actual: chrono::DateTime<Utc>, expected: chrono::DateTime<Utc>) {
    let drift = (actual - expected).num_milliseconds().abs();
    assert!(drift <= 1_500, "retry_at {actual} drifted {drift}ms from {expected}");
}

async fn mount_429(server: &ChatMockServer, http_method: &str, at: &str, response: ResponseTemplate) {
    Mock::given(method(http_method))
        .and(path(at))
        .respond_with(response)
        .mount(&server.server)
        .await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Global channel
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_after_seconds_engages_governor() {
    let server = ChatMockServer::new().await;
    mount_429(
        &server,
        "GET",
        "/api/problems/42",
        ResponseTemplate::new(429).insert_header("Retry-After", "120"),
    )
    .await;

    let chat = controller(&server.uri());
    assert!(!chat.governor().is_limited());

    let before = Utc::now();
    let err = chat.api().get_json::<Value>("/api/problems/42").await.unwrap_err();

    let ChatError::RateLimited { retry_at } = err else {
        panic!("expected a global rate limit, got {err:?}");
    };
    assert_near(retry_at.unwrap(), before + TimeDelta::seconds(120));
    assert!(chat.governor().is_limited());
    assert_eq!(chat.governor().get().retry_at, retry_at);
}

#[tokio::test]
async fn test_retry_after_http_date_engages_governor() {
    let server = ChatMockServer::new().await;
    let target = Utc::now() + TimeDelta::seconds(10);
    mount_429(
        &server,
        "GET",
        "/api/problems/42",
        ResponseTemplate::new(429)
            .insert_header("Retry-After", target.format("%a, %d %b %Y %H:%M:%S GMT").to_string()),
    )
    .await;

    let chat = controller(&server.uri());
    let err = chat.api().get_json::<Value>("/api/problems/42").await.unwrap_err();

    assert!(err.is_rate_limited());
    assert!(chat.governor().is_limited());
    assert_near(chat.governor().get().retry_at.unwrap(), target);
}

#[tokio::test]
async fn test_missing_retry_after_limits_without_deadline() {
    let server = ChatMockServer::new().await;
    mount_429(&server, "GET", "/api/problems/42", ResponseTemplate::new(429)).await;

    let chat = controller(&server.uri());
    chat.api().get_json::<Value>("/api/problems/42").await.unwrap_err();

    let state = chat.governor().get();
    assert!(state.is_limited);
    assert!(state.retry_at.is_none());
}

#[tokio::test]
async fn test_send_429_without_stream_code_is_global() {
    let server = ChatMockServer::new().await;
    mount_429(
        &server,
        "POST",
        "/api/chatbot/messages",
        ResponseTemplate::new(429)
            .insert_header("Retry-After", "60")
            .set_body_json(json!({ "code": "TOO_MANY_REQUESTS" })),
    )
    .await;

    let chat = controller(&server.uri());
    chat.set_draft(PROBLEM, "hi");

    assert_eq!(chat.send(PROBLEM).await, SendOutcome::Failed);
    assert!(chat.governor().is_limited());
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversation channel
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_send_429_with_stream_code_stays_local() {
    let server = ChatMockServer::new().await;
    mount_429(
        &server,
        "POST",
        "/api/chatbot/messages",
        ResponseTemplate::new(429)
            .set_body_json(json!({ "data": { "code": "CHATBOT_STREAM_RATE_LIMIT_EXCEEDED", "retryAfterSeconds": 12 } })),
    )
    .await;

    let chat = controller(&server.uri());
    chat.set_draft(PROBLEM, "hi");

    let notice = "Too many requests. Please retry in 12 seconds.".to_string();
    assert_eq!(chat.send(PROBLEM).await, SendOutcome::RateLimited(notice.clone()));
    assert!(!chat.governor().is_limited());

    let session = chat.store().get(PROBLEM).unwrap();
    assert_eq!(session.last_error, Some(notice));
}

#[tokio::test]
async fn test_stream_open_429_stays_local() {
    let server = ChatMockServer::new().await;
    server.mock_send_accepted("hi", "c1").await;
    mount_429(
        &server,
        "GET",
        "/api/chatbot/messages/c1/stream",
        ResponseTemplate::new(429).insert_header("Retry-After", "30"),
    )
    .await;

    let chat = controller(&server.uri());
    chat.set_draft(PROBLEM, "hi");

    let SendOutcome::RateLimited(notice) = chat.send(PROBLEM).await else {
        panic!("expected a conversation-scoped rate limit");
    };
    assert!(notice.contains("30"));
    assert!(!chat.governor().is_limited());

    let session = chat.store().get(PROBLEM).unwrap();
    assert!(!session.is_streaming);
    assert_eq!(session.messages.len(), 2);
}

#[tokio::test]
async fn test_stream_open_429_uses_body_hint() {
    let server = ChatMockServer::new().await;
    server.mock_send_accepted("hi", "c1").await;
    mount_429(
        &server,
        "GET",
        "/api/chatbot/messages/c1/stream",
        ResponseTemplate::new(429).set_body_json(json!({ "result": { "retry_after": "4.2" } })),
    )
    .await;

    let chat = controller(&server.uri());
    chat.set_draft(PROBLEM, "hi");

    assert_eq!(
        chat.send(PROBLEM).await,
        SendOutcome::RateLimited("Too many requests. Please retry in 5 seconds.".into())
    );
}

#[tokio::test]
async fn test_stream_open_429_without_hint() {
    let server = ChatMockServer::new().await;
    server.mock_send_accepted("hi", "c1").await;
    mount_429(
        &server,
        "GET",
        "/api/chatbot/messages/c1/stream",
        ResponseTemplate::new(429),
    )
    .await;

    let chat = controller(&server.uri());
    chat.set_draft(PROBLEM, "hi");

    assert_eq!(
        chat.send(PROBLEM).await,
        SendOutcome::RateLimited("Request limit exceeded. Please try again later.".into())
    );
}
