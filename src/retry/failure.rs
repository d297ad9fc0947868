//! Per-attempt failure taxonomy.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::stream::ResultEvent;

/// Result subtype the assistant uses for crashes inside its own loop.
const EXECUTION_ERROR_SUBTYPE: &str = "error_during_execution";

/// Provider-side failures worth retrying.
static INTERNAL_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(internal server error|internal error|overloaded|api error: 5\d\d|\b50[0-4]\b|service unavailable|bad gateway)")
        .expect("internal error pattern")
});

/// Provider throttling.
static RATE_LIMITED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(rate[ _-]?limit|too many requests|\b429\b|usage limit)")
        .expect("rate limit pattern")
});

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptFailure {
    #[error("launch failed: {reason}")]
    Launch { reason: String },

    #[error("process exited with code {code:?} before a result: {stderr}")]
    Crash { code: Option<i32>, stderr: String },

    #[error("stream ended without a result after {events} events")]
    IncompleteStream { events: u64 },

    #[error("{count} malformed fragments exceeded the tolerance")]
    TooManyMalformed { count: usize },

    #[error("assistant internal error: {message}")]
    InternalError { message: String },

    #[error("provider rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("attempt timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("stream read failed: {reason}")]
    Io { reason: String },

    #[error("assistant rejected the job ({subtype}): {message}")]
    Rejected { subtype: String, message: String },
}

impl AttemptFailure {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// Classify a result event that reported `is_error`.
    pub fn from_error_result(result: &ResultEvent) -> Self {
        let subtype = result.subtype.clone().unwrap_or_else(|| "error".to_string());
        let message = result
            .result
            .clone()
            .or_else(|| {
                result
                    .payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| subtype.clone());

        if RATE_LIMITED.is_match(&message) {
            let retry_after_ms = result
                .payload
                .get("retry_after")
                .and_then(|v| v.as_f64())
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(|secs| (secs * 1000.0) as u64);
            return Self::RateLimited {
                message,
                retry_after_ms,
            };
        }
        if subtype == EXECUTION_ERROR_SUBTYPE || INTERNAL_ERROR.is_match(&message) {
            return Self::InternalError { message };
        }
        Self::Rejected { subtype, message }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::stream::EventKind;

    fn result(value: serde_json::Value) -> ResultEvent {
        match EventKind::from_value(value) {
            EventKind::Result(r) => r,
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn execution_errors_are_internal() {
        let r = result(json!({
            "type": "result", "subtype": "error_during_execution", "is_error": true
        }));
        let failure = AttemptFailure::from_error_result(&r);
        assert!(matches!(failure, AttemptFailure::InternalError { .. }));
        assert!(failure.is_retryable());
    }

    #[test]
    fn overloaded_messages_are_internal() {
        let r = result(json!({
            "type": "result", "subtype": "success", "is_error": true,
            "result": "API Error: 529 Overloaded"
        }));
        assert!(matches!(
            AttemptFailure::from_error_result(&r),
            AttemptFailure::InternalError { .. }
        ));
    }

    #[test]
    fn throttling_carries_retry_after() {
        let r = result(json!({
            "type": "result", "subtype": "success", "is_error": true,
            "result": "429 Too Many Requests", "retry_after": 2.5
        }));
        assert_eq!(
            AttemptFailure::from_error_result(&r),
            AttemptFailure::RateLimited {
                message: "429 Too Many Requests".into(),
                retry_after_ms: Some(2500),
            }
        );
    }

    #[test]
    fn other_errors_are_rejections() {
        let r = result(json!({
            "type": "result", "subtype": "error_max_turns", "is_error": true,
            "result": "Reached max turns"
        }));
        let failure = AttemptFailure::from_error_result(&r);
        assert!(!failure.is_retryable());
        assert!(failure.to_string().contains("error_max_turns"));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let v = serde_json::to_value(AttemptFailure::IncompleteStream { events: 3 }).unwrap();
        assert_eq!(v["kind"], "incomplete_stream");
        assert_eq!(v["events"], 3);
    }
}
