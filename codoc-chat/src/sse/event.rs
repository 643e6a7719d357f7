//! Typed stream events and their dispatch rules.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, trace};

use super::frame::Frame;
use crate::rate_limit::stream_retry_hint;
use crate::status::{first_str, lookup, resolve_status, ChatStatus, FieldPath};

/// A decoded stream event ready for the session driver.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Non-empty token text to coalesce.
    Token(String),
    /// A resolved status notification.
    Status(ChatStatus),
    /// The authoritative final answer.
    Final(FinalAnswer),
    /// In-band conversation-scoped rate limit.
    RateLimited { retry_after_secs: Option<u64> },
    /// An `error` event without a recognizable status.
    Error,
}

/// Payload of a `final` event.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalAnswer {
    /// Replacement text for the pending message, when the server sent one.
    pub text: Option<String>,
    /// Whether the learner answered correctly at the rule step.
    pub summary_ready: bool,
    /// Status carried by the same payload.
    pub status: Option<ChatStatus>,
}

const TOKEN_TEXT_PATHS: &[FieldPath] = &[&["result", "text"], &["text"]];

const FINAL_TEXT_PATHS: &[FieldPath] = &[
    &["result", "ai_message"],
    &["result", "aiMessage"],
    &["result", "text"],
    &["text"],
];

const IS_CORRECT_PATHS: &[FieldPath] = &[&["result", "is_correct"], &["result", "isCorrect"]];

const CURRENT_NODE_PATHS: &[FieldPath] = &[&["result", "current_node"], &["result", "currentNode"]];

/// Node name of the rule step that unlocks the summary follow-up.
const RULE_NODE: &str = "RULE";

impl FinalAnswer {
    fn from_payload(payload: &Value, status: Option<ChatStatus>) -> Self {
        let text = FINAL_TEXT_PATHS
            .iter()
            .filter_map(|path| lookup(payload, path))
            .filter_map(Value::as_str)
            .find(|text| !text.trim().is_empty())
            .map(str::to_string);

        let is_correct = IS_CORRECT_PATHS
            .iter()
            .filter_map(|path| lookup(payload, path))
            .find_map(Value::as_bool)
            .unwrap_or(false);
        let at_rule = first_str(payload, CURRENT_NODE_PATHS) == Some(RULE_NODE);

        Self {
            text,
            summary_ready: is_correct && at_rule,
            status,
        }
    }
}

/// Decode a frame's JSON payload and dispatch on its event type.
///
/// Undecodable payloads and unhandled event types yield `None`.
pub fn parse_event(frame: &Frame) -> Option<StreamEvent> {
    let payload: Value = match serde_json::from_str(&frame.data) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(event = %frame.event, error = %e, "Dropping frame with undecodable payload");
            return None;
        }
    };

    interpret(&frame.event, &payload)
}

fn interpret(event: &str, payload: &Value) -> Option<StreamEvent> {
    let status = resolve_status(payload);

    // Failure and stream rate limits win over whatever else the frame carries.
    match status {
        Some(ChatStatus::Failed) => return Some(StreamEvent::Status(ChatStatus::Failed)),
        Some(ChatStatus::StreamRateLimited) => {
            return Some(StreamEvent::RateLimited {
                retry_after_secs: stream_retry_hint(payload, Utc::now()),
            });
        }
        _ => {}
    }

    match event {
        "token" => first_str(payload, TOKEN_TEXT_PATHS)
            .filter(|text| !text.is_empty())
            .map(|text| StreamEvent::Token(text.to_string())),
        "status" => status.map(StreamEvent::Status),
        "error" => Some(status.map_or(StreamEvent::Error, StreamEvent::Status)),
        "final" => Some(StreamEvent::Final(FinalAnswer::from_payload(payload, status))),
        other => {
            trace!(event = %other, "Ignoring unhandled event type");
            None
        }
    }
}
