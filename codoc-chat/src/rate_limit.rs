//! Rate-limit governor and retry hint parsing.
//!
//! Two channels exist:
//! - **Global**: an HTTP 429 on an ordinary request locks the whole
//!   application until the user retries. State lives in [`RateLimitGovernor`].
//! - **Stream**: a 429 on stream open, or the in-band stream rate-limit code,
//!   ends only the current turn with a conversation-scoped message.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::status::{lookup, FieldPath, STREAM_RATE_LIMIT_CODE};

/// Shown when a stream rate limit carries no usable retry hint.
pub const DEFAULT_STREAM_RATE_LIMIT_MESSAGE: &str =
    "Request limit exceeded. Please try again later.";

/// Global rate-limit state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
    pub is_limited: bool,
    pub retry_at: Option<DateTime<Utc>>,
}

/// Collaborator interface for anything that records a global rate limit.
pub trait RateLimitSink: Send + Sync {
    fn set_rate_limit(&self, retry_at: Option<DateTime<Utc>>);
    fn clear_rate_limit(&self);
}

/// Shared handle to the global rate-limit state.
///
/// Clones share one state. Every mutation replaces the whole state at once.
#[derive(Clone)]
pub struct RateLimitGovernor {
    state: Arc<watch::Sender<RateLimitState>>,
}

impl RateLimitGovernor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RateLimitState::default());
        Self {
            state: Arc::new(state),
        }
    }

    pub fn get(&self) -> RateLimitState {
        *self.state.borrow()
    }

    pub fn is_limited(&self) -> bool {
        self.state.borrow().is_limited
    }

    /// Lock the application until `clear` is called.
    pub fn set(&self, retry_at: Option<DateTime<Utc>>) {
        self.state.send_replace(RateLimitState {
            is_limited: true,
            retry_at,
        });
        warn!(retry_at = ?retry_at, "Global rate limit engaged");
    }

    /// Lock from a raw `Retry-After` header value.
    pub fn set_from_retry_after(&self, retry_after: Option<&str>) {
        self.set(retry_after.and_then(|value| parse_retry_at(value, Utc::now())));
    }

    pub fn clear(&self) {
        let previous = self.state.send_replace(RateLimitState::default());
        if previous.is_limited {
            info!("Global rate limit cleared");
        }
    }

    /// Watch for state changes (used by render gates).
    pub fn subscribe(&self) -> watch::Receiver<RateLimitState> {
        self.state.subscribe()
    }
}

impl Default for RateLimitGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RateLimitGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitGovernor")
            .field("state", &self.get())
            .finish()
    }
}

impl RateLimitSink for RateLimitGovernor {
    fn set_rate_limit(&self, retry_at: Option<DateTime<Utc>>) {
        self.set(retry_at);
    }

    fn clear_rate_limit(&self) {
        self.clear();
    }
}

// ============================================================================
// Retry-After parsing
// ============================================================================

/// Absolute retry time from a `Retry-After` value.
///
/// Accepts (fractional) seconds relative to `now`, clamping negatives to
/// `now`, or an HTTP date (IMF-fixdate/RFC 2822, RFC 3339 also accepted).
pub fn parse_retry_at(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(seconds) = parse_seconds(trimmed) {
        let millis = (seconds.max(0.0) * 1000.0).round() as i64;
        return TimeDelta::try_milliseconds(millis).and_then(|delta| now.checked_add_signed(delta));
    }

    parse_http_date(trimmed)
}

/// Whole seconds to wait, from a header or payload string.
///
/// A plain number is used as is. Otherwise an HTTP date is converted to
/// seconds from `now`, and failing that the first number inside the text.
pub fn retry_after_secs_from_str(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(seconds) = parse_seconds(trimmed) {
        return Some(ceil_secs(seconds));
    }

    if let Some(at) = parse_http_date(trimmed) {
        return Some(ceil_secs((at - now).num_milliseconds() as f64 / 1000.0));
    }

    let numeric = Regex::new(r"-?\d+(?:\.\d+)?").ok()?;
    numeric
        .find(trimmed)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(ceil_secs)
}

/// Whole seconds to wait, from a JSON hint value.
pub fn retry_after_secs(value: &Value, now: DateTime<Utc>) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|s| s.is_finite()).map(ceil_secs),
        Value::String(s) => retry_after_secs_from_str(s, now),
        _ => None,
    }
}

/// Retry hint fields in an in-band rate-limit payload, in priority order.
const HINT_PATHS: &[FieldPath] = &[
    &["retryAfter"],
    &["retry_after"],
    &["retryAfterSeconds"],
    &["retry_after_seconds"],
    &["result", "retryAfter"],
    &["result", "retry_after"],
    &["result", "retryAfterSeconds"],
    &["result", "retry_after_seconds"],
    &["data", "retryAfter"],
    &["data", "retry_after"],
    &["data", "retryAfterSeconds"],
    &["data", "retry_after_seconds"],
];

/// First usable retry hint in a stream payload.
pub fn stream_retry_hint(payload: &Value, now: DateTime<Utc>) -> Option<u64> {
    HINT_PATHS
        .iter()
        .filter_map(|path| lookup(payload, path))
        .find_map(|value| retry_after_secs(value, now))
}

/// Body code fields that mark a 429 as the stream rate limit.
const BODY_CODE_PATHS: &[FieldPath] = &[&["code"], &["data", "code"], &["errorCode"]];

/// Whether an error body carries the stream rate-limit code.
pub fn is_stream_rate_limit_body(body: &Value) -> bool {
    BODY_CODE_PATHS
        .iter()
        .filter_map(|path| lookup(body, path))
        .filter_map(Value::as_str)
        .any(|code| code == STREAM_RATE_LIMIT_CODE)
}

/// Conversation-scoped message for a stream rate limit.
pub fn stream_rate_limit_message(retry_after_secs: Option<u64>) -> String {
    match retry_after_secs {
        Some(secs) => format!("Too many requests. Please retry in {secs} seconds."),
        None => DEFAULT_STREAM_RATE_LIMIT_MESSAGE.to_string(),
    }
}

fn parse_seconds(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|s| s.is_finite())
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn ceil_secs(seconds: f64) -> u64 {
    seconds.max(0.0).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use test_case::test_case;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn http_date(at: DateTime<Utc>) -> String {
        at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    #[test]
    fn test_retry_at_seconds() {
        assert_eq!(parse_retry_at("120", now()), Some(now() + TimeDelta::seconds(120)));
        assert_eq!(parse_retry_at(" 1.5 ", now()), Some(now() + TimeDelta::milliseconds(1500)));
    }

    #[test]
    fn test_retry_at_negative_clamps_to_now() {
        assert_eq!(parse_retry_at("-30", now()), Some(now()));
    }

    #[test]
    fn test_retry_at_http_date() {
        let at = now() + TimeDelta::seconds(60);
        assert_eq!(parse_retry_at(&http_date(at), now()), Some(at));
        assert_eq!(parse_retry_at("2025-03-01T12:01:00Z", now()), Some(at));
    }

    #[test_case("" ; "empty")]
    #[test_case("soon" ; "garbage")]
    #[test_case("NaN" ; "nan")]
    #[test_case("inf" ; "infinite")]
    fn test_retry_at_unparsable(value: &str) {
        assert_eq!(parse_retry_at(value, now()), None);
    }

    #[test]
    fn test_retry_at_huge_value_does_not_overflow() {
        assert_eq!(parse_retry_at("1e300", now()), None);
    }

    #[test]
    fn test_secs_from_str() {
        assert_eq!(retry_after_secs_from_str("30", now()), Some(30));
        assert_eq!(retry_after_secs_from_str("2.1", now()), Some(3));
        assert_eq!(retry_after_secs_from_str("-4", now()), Some(0));
        assert_eq!(retry_after_secs_from_str("retry in 12 seconds", now()), Some(12));
        assert_eq!(
            retry_after_secs_from_str(&http_date(now() + TimeDelta::seconds(45)), now()),
            Some(45)
        );
        assert_eq!(retry_after_secs_from_str("later", now()), None);
    }

    #[test]
    fn test_secs_from_json() {
        assert_eq!(retry_after_secs(&json!(7), now()), Some(7));
        assert_eq!(retry_after_secs(&json!(0.2), now()), Some(1));
        assert_eq!(retry_after_secs(&json!("9"), now()), Some(9));
        assert_eq!(retry_after_secs(&json!(true), now()), None);
        assert_eq!(retry_after_secs(&json!(null), now()), None);
    }

    #[test]
    fn test_hint_lookup_order() {
        let payload = json!({
            "retry_after_seconds": 50,
            "result": { "retryAfter": 10 },
            "data": { "retryAfter": 99 },
        });
        assert_eq!(stream_retry_hint(&payload, now()), Some(50));

        let payload = json!({ "result": { "retry_after": "later" }, "data": { "retryAfterSeconds": "8" } });
        assert_eq!(stream_retry_hint(&payload, now()), Some(8));

        assert_eq!(stream_retry_hint(&json!({"code": "X"}), now()), None);
    }

    #[test]
    fn test_stream_rate_limit_body() {
        assert!(is_stream_rate_limit_body(&json!({"code": STREAM_RATE_LIMIT_CODE})));
        assert!(is_stream_rate_limit_body(&json!({"data": {"code": STREAM_RATE_LIMIT_CODE}})));
        assert!(is_stream_rate_limit_body(&json!({"errorCode": STREAM_RATE_LIMIT_CODE})));
        assert!(!is_stream_rate_limit_body(&json!({"code": "TOO_MANY_REQUESTS"})));
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            stream_rate_limit_message(Some(30)),
            "Too many requests. Please retry in 30 seconds."
        );
        assert_eq!(stream_rate_limit_message(None), DEFAULT_STREAM_RATE_LIMIT_MESSAGE);
    }

    #[test]
    fn test_governor_set_and_clear() {
        let governor = RateLimitGovernor::new();
        let shared = governor.clone();
        assert!(!governor.is_limited());

        shared.set(Some(now()));
        assert_eq!(
            governor.get(),
            RateLimitState {
                is_limited: true,
                retry_at: Some(now())
            }
        );

        governor.clear();
        assert_eq!(shared.get(), RateLimitState::default());
    }

    #[test]
    fn test_governor_set_from_header() {
        let governor = RateLimitGovernor::new();
        governor.set_from_retry_after(Some("not a date"));
        assert!(governor.is_limited());
        assert_eq!(governor.get().retry_at, None);

        let before = Utc::now();
        governor.set_from_retry_after(Some("120"));
        let retry_at = governor.get().retry_at.unwrap();
        let delta = (retry_at - before).num_milliseconds();
        assert!((119_000..=121_000).contains(&delta), "delta was {delta}ms");
    }

    #[test]
    fn test_sink_interface() {
        let governor = RateLimitGovernor::new();
        let sink: &dyn RateLimitSink = &governor;
        sink.set_rate_limit(None);
        assert!(governor.is_limited());
        sink.clear_rate_limit();
        assert!(!governor.is_limited());
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let governor = RateLimitGovernor::new();
        let mut rx = governor.subscribe();

        governor.set(None);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_limited);

        governor.clear();
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().is_limited);
    }
}
