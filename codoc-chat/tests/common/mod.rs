//! Shared fixtures for chat engine integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use codoc_chat::{ApiClient, ChatController, RateLimitGovernor, SessionStore, StaticToken};
use codoc_common::{ApiConfig, ChatConfig};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN: &str = "test-token";
pub const PROBLEM: &str = "42";

/// Build a controller against `base_url` with a fresh store and governor.
pub fn controller(base_url: &str) -> ChatController {
    let api = ApiConfig {
        base_url: base_url.to_string(),
        access_token: Some(TOKEN.to_string()),
        ..ApiConfig::default()
    };
    let client = ApiClient::new(
        &api,
        Arc::new(StaticToken::new(api.access_token.clone())),
        RateLimitGovernor::new(),
    )
    .unwrap();
    ChatController::new(client, SessionStore::new(), &ChatConfig::default())
}

/// Render `(event, payload)` pairs as an SSE body.
pub fn sse(events: &[(&str, Value)]) -> String {
    events
        .iter()
        .map(|(event, payload)| format!("event: {event}\ndata: {payload}\n\n"))
        .collect()
}

pub fn token_frame(text: &str) -> String {
    sse(&[("token", json!({ "text": text }))])
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ─────────────────────────────────────────────────────────────────────────────
// wiremock helpers
// ─────────────────────────────────────────────────────────────────────────────

pub struct ChatMockServer {
    pub server: MockServer,
}

impl ChatMockServer {
    pub async fn new() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Send-turn answered with `data`.
    pub async fn mock_send(&self, data: Value) {
        Mock::given(method("POST"))
            .and(path("/api/chatbot/messages"))
            .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": data })))
            .mount(&self.server)
            .await;
    }

    /// Send-turn for `message` accepted with `conversation_id`.
    pub async fn mock_send_accepted(&self, message: &str, conversation_id: &str) {
        Mock::given(method("POST"))
            .and(path("/api/chatbot/messages"))
            .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
            .and(body_partial_json(json!({ "problemId": PROBLEM, "message": message })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "conversationId": conversation_id, "status": "ACCEPTED" }
            })))
            .expect(1)
            .mount(&self.server)
            .await;
    }

    /// Stream for `conversation_id` answered with a complete SSE body.
    pub async fn mock_stream(&self, conversation_id: &str, body: String) {
        Mock::given(method("GET"))
            .and(path(format!("/api/chatbot/messages/{conversation_id}/stream")))
            .and(header("accept", "text/event-stream"))
            .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&self.server)
            .await;
    }

    /// Any stream request must not happen.
    pub async fn forbid_stream(&self) {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&self.server)
            .await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Live stream server
// ─────────────────────────────────────────────────────────────────────────────

/// Minimal HTTP/1.1 server whose event streams stay open until the test
/// pushes frames or drops the sender.
///
/// Every POST is accepted with conversation ids `c1`, `c2`, ... Every GET
/// serves the next stream in order.
pub struct LiveStreamServer {
    pub uri: String,
}

impl LiveStreamServer {
    pub async fn start(streams: usize) -> (Self, Vec<mpsc::UnboundedSender<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());

        let (senders, receivers): (Vec<_>, VecDeque<_>) =
            (0..streams).map(|_| mpsc::unbounded_channel::<String>()).unzip();

        tokio::spawn(async move {
            let mut receivers = receivers;
            let mut conversations = 0;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let head = read_request(&mut socket).await;

                if head.starts_with("POST") {
                    conversations += 1;
                    let body = json!({
                        "data": { "conversationId": format!("c{conversations}"), "status": "ACCEPTED" }
                    })
                    .to_string();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                } else if let Some(mut frames) = receivers.pop_front() {
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n",
                        )
                        .await;
                    tokio::spawn(async move {
                        while let Some(frame) = frames.recv().await {
                            if socket.write_all(frame.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                        let _ = socket.shutdown().await;
                    });
                } else {
                    let _ = socket
                        .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                        .await;
                }
            }
        });

        (Self { uri }, senders)
    }
}

/// Read one request head and its body, returning the head.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return String::from_utf8_lossy(&buffer).into_owned(),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buffer.len() < head_end + content_length {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
    head
}
