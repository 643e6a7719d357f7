//! HTTP client for the chatbot API.
//!
//! Ordinary JSON requests and the send-turn request share a per-request
//! timeout. The event stream request only has a connect timeout, since a
//! turn may legitimately stay open for a long time.
//!
//! HTTP 429 handling is split by channel:
//! - an ordinary request engages the global [`RateLimitGovernor`], unless
//!   its body carries the stream rate-limit code;
//! - the stream-open request never touches global state.

use std::sync::Arc;

use chrono::Utc;
use codoc_common::util::sanitize_for_log;
use codoc_common::ApiConfig;
use reqwest::header::{ACCEPT, CACHE_CONTROL, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};
use crate::rate_limit::{
    is_stream_rate_limit_body, retry_after_secs_from_str, stream_retry_hint, RateLimitGovernor,
};
use crate::status::ChatStatus;

const SEND_MESSAGE_PATH: &str = "/api/chatbot/messages";

/// Supplies the bearer token for outgoing requests.
pub trait CredentialSupplier: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// A fixed token, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()))
    }
}

impl CredentialSupplier for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    problem_id: &'a str,
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageData {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Normalized send-turn response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTurnResponse {
    pub conversation_id: Option<String>,
    /// `None` when the server sent no status or an unrecognized one.
    pub status: Option<ChatStatus>,
}

impl From<SendMessageData> for SendTurnResponse {
    fn from(data: SendMessageData) -> Self {
        Self {
            conversation_id: data.conversation_id.filter(|id| !id.is_empty()),
            status: data.status.as_deref().and_then(ChatStatus::normalize),
        }
    }
}

/// Credential-bearing chatbot API client.
#[derive(Clone)]
pub struct ApiClient {
    endpoint: String,
    client: reqwest::Client,
    stream_client: reqwest::Client,
    credentials: Arc<dyn CredentialSupplier>,
    governor: RateLimitGovernor,
}

impl ApiClient {
    /// Create a client from API configuration.
    pub fn new(
        config: &ApiConfig,
        credentials: Arc<dyn CredentialSupplier>,
        governor: RateLimitGovernor,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| ChatError::Request(e.to_string()))?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| ChatError::Request(e.to_string()))?;

        Ok(Self::with_clients(
            &config.base_url,
            client,
            stream_client,
            credentials,
            governor,
        ))
    }

    /// Create a client with custom reqwest clients.
    pub fn with_clients(
        base_url: &str,
        client: reqwest::Client,
        stream_client: reqwest::Client,
        credentials: Arc<dyn CredentialSupplier>,
        governor: RateLimitGovernor,
    ) -> Self {
        Self {
            endpoint: base_url.trim().trim_end_matches('/').to_string(),
            client,
            stream_client,
            credentials,
            governor,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn governor(&self) -> &RateLimitGovernor {
        &self.governor
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Stream URL with the conversation id as one escaped path segment.
    fn stream_url(&self, conversation_id: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.url(SEND_MESSAGE_PATH))
            .map_err(|e| ChatError::Request(format!("invalid endpoint: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| ChatError::Request("endpoint cannot carry a path".into()))?
            .push(conversation_id)
            .push("stream");
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a user turn.
    pub async fn send_message(&self, problem_id: &str, message: &str) -> Result<SendTurnResponse> {
        let body = SendMessageRequest {
            problem_id,
            message,
        };
        let envelope: Envelope<SendMessageData> = self.post_json(SEND_MESSAGE_PATH, &body).await?;
        let response = SendTurnResponse::from(envelope.data.unwrap_or_default());

        debug!(
            problem_id = %problem_id,
            conversation_id = ?response.conversation_id,
            status = ?response.status,
            "Send-turn accepted"
        );
        Ok(response)
    }

    /// Open the event stream of an accepted turn.
    ///
    /// The returned response body is the live byte stream.
    pub async fn open_stream(&self, conversation_id: &str) -> Result<Response> {
        let url = self.stream_url(conversation_id)?;

        let response = self
            .authorize(self.stream_client.get(url))
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| ChatError::Request(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let now = Utc::now();
            let header_hint = retry_after_header(&response)
                .and_then(|value| retry_after_secs_from_str(&value, now));
            let body: Option<Value> = response.json().await.ok();
            let retry_after_secs =
                header_hint.or_else(|| body.as_ref().and_then(|b| stream_retry_hint(b, now)));

            warn!(
                conversation_id = %conversation_id,
                retry_after_secs = ?retry_after_secs,
                "Stream open rate limited"
            );
            return Err(ChatError::StreamRateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ChatError::Server {
                status: status.as_u16(),
                message: sanitize_for_log(&message),
            });
        }

        debug!(conversation_id = %conversation_id, "Stream opened");
        Ok(response)
    }

    /// GET an ordinary JSON resource.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.authorize(self.client.get(self.url(path)));
        self.execute_json(request).await
    }

    /// POST a JSON body to an ordinary endpoint.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let request = self.authorize(self.client.post(self.url(path)).json(body));
        self.execute_json(request).await
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| ChatError::Request(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(self.ordinary_rate_limit(response).await);
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            warn!(status = status.as_u16(), body = %sanitize_for_log(&message), "Request failed");
            return Err(ChatError::Server {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ChatError::Parse(e.to_string()))
    }

    /// Classify a 429 on an ordinary request.
    async fn ordinary_rate_limit(&self, response: Response) -> ChatError {
        let now = Utc::now();
        let retry_after = retry_after_header(&response);
        let body: Option<Value> = response.json().await.ok();

        if body.as_ref().is_some_and(is_stream_rate_limit_body) {
            let retry_after_secs = retry_after
                .as_deref()
                .and_then(|value| retry_after_secs_from_str(value, now))
                .or_else(|| body.as_ref().and_then(|b| stream_retry_hint(b, now)));
            warn!(retry_after_secs = ?retry_after_secs, "Chat stream rate limit on send");
            return ChatError::StreamRateLimited { retry_after_secs };
        }

        self.governor.set_from_retry_after(retry_after.as_deref());
        ChatError::RateLimited {
            retry_at: self.governor.get().retry_at,
        }
    }
}

fn retry_after_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
