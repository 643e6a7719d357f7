//! Chat status normalization and payload field lookup.

use std::fmt;

use serde_json::Value;

/// Status code the backend uses for a conversation-scoped stream rate limit.
pub const STREAM_RATE_LIMIT_CODE: &str = "CHATBOT_STREAM_RATE_LIMIT_EXCEEDED";

/// A recognized chat status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatStatus {
    Accepted,
    Processing,
    Completed,
    Failed,
    StreamRateLimited,
}

impl ChatStatus {
    /// Normalize a raw status string. Unrecognized values yield `None`.
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw {
            "ACCEPTED" => Some(Self::Accepted),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            STREAM_RATE_LIMIT_CODE => Some(Self::StreamRateLimited),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::StreamRateLimited => STREAM_RATE_LIMIT_CODE,
        }
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A JSON path looked up inside an event payload.
pub(crate) type FieldPath = &'static [&'static str];

/// Status fields, in priority order.
const STATUS_PATHS: &[FieldPath] = &[
    &["result", "status"],
    &["result", "code"],
    &["status"],
    &["code"],
];

/// Follow `path` through nested objects.
pub(crate) fn lookup<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(payload, |value, key| value.get(key))
}

/// First string value along `paths`, in order.
pub(crate) fn first_str<'a>(payload: &'a Value, paths: &[FieldPath]) -> Option<&'a str> {
    paths
        .iter()
        .filter_map(|path| lookup(payload, path))
        .find_map(Value::as_str)
}

/// Resolve the status of an event payload.
///
/// Only string values count. The first one that normalizes to a known
/// status wins; unknown values are skipped.
pub fn resolve_status(payload: &Value) -> Option<ChatStatus> {
    STATUS_PATHS
        .iter()
        .filter_map(|path| lookup(payload, path))
        .filter_map(Value::as_str)
        .find_map(ChatStatus::normalize)
}
