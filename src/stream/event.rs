//! Typed events decoded from the assistant's line-delimited JSON output.

use serde::Serialize;
use serde_json::Value;

/// One decoded unit of assistant output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    /// Position within the attempt's stream, starting at 0.
    pub seq: u64,
    /// Decoded payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Closed set of event kinds. Decoded once, dispatched exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    System(SystemEvent),
    Assistant(AssistantEvent),
    Result(ResultEvent),
    /// Well-formed JSON with a tag we do not model (including `user`).
    Unknown {
        tag: Option<String>,
        payload: Value,
    },
    /// A fragment that could not be decoded.
    Malformed(MalformedEvent),
}

/// `{"type":"system", ...}`: session setup and housekeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub payload: Value,
}

/// `{"type":"assistant", ...}`: a model turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantEvent {
    pub session_id: Option<String>,
    pub payload: Value,
}

/// `{"type":"result", ...}`: the terminal message of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    pub is_error: bool,
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub num_turns: Option<u64>,
    pub duration_ms: Option<u64>,
    pub payload: Value,
}

/// Raw text that never became a valid message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedEvent {
    pub raw: String,
    pub reason: String,
}

impl EventKind {
    /// Classify a parsed JSON value by its `type` discriminator.
    pub fn from_value(value: Value) -> Self {
        let tag = value.get("type").and_then(Value::as_str).map(str::to_string);
        match tag.as_deref() {
            Some("system") if value.is_object() => Self::System(SystemEvent {
                subtype: str_field(&value, "subtype"),
                session_id: str_field(&value, "session_id"),
                payload: value,
            }),
            Some("assistant") if value.is_object() => Self::Assistant(AssistantEvent {
                session_id: str_field(&value, "session_id"),
                payload: value,
            }),
            Some("result") if value.is_object() => Self::Result(ResultEvent {
                subtype: str_field(&value, "subtype"),
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                result: str_field(&value, "result"),
                session_id: str_field(&value, "session_id"),
                total_cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
                num_turns: value.get("num_turns").and_then(Value::as_u64),
                duration_ms: value.get("duration_ms").and_then(Value::as_u64),
                payload: value,
            }),
            _ => Self::Unknown {
                tag,
                payload: value,
            },
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::Result(_) => "result",
            Self::Unknown { tag, .. } => tag.as_deref().unwrap_or("unknown"),
            Self::Malformed(_) => "malformed",
        }
    }
}

impl StreamEvent {
    /// The assistant's own session identifier, when the message carries one.
    pub fn session_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::System(e) => e.session_id.as_deref(),
            EventKind::Assistant(e) => e.session_id.as_deref(),
            EventKind::Result(e) => e.session_id.as_deref(),
            EventKind::Unknown { payload, .. } => payload.get("session_id").and_then(Value::as_str),
            EventKind::Malformed(_) => None,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self.kind, EventKind::Result(_))
    }

    /// Re-serialize the event to the single line it was decoded from.
    ///
    /// Malformed events return their raw text unchanged.
    pub fn to_line(&self) -> String {
        match &self.kind {
            EventKind::System(SystemEvent { payload, .. })
            | EventKind::Assistant(AssistantEvent { payload, .. })
            | EventKind::Result(ResultEvent { payload, .. })
            | EventKind::Unknown { payload, .. } => payload.to_string(),
            EventKind::Malformed(m) => m.raw.clone(),
        }
    }
}

impl AssistantEvent {
    /// Concatenated text blocks of the message, if any.
    pub fn text(&self) -> Option<String> {
        let content = self.payload.get("message")?.get("content")?;
        if let Some(text) = content.as_str() {
            return Some(text.to_string());
        }
        let parts: Vec<&str> = content
            .as_array()?
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn result_fields_extracted() {
        let kind = EventKind::from_value(json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "result": "done",
            "session_id": "abc",
            "total_cost_usd": 0.12,
            "num_turns": 3
        }));
        match kind {
            EventKind::Result(r) => {
                assert_eq!(r.subtype.as_deref(), Some("success"));
                assert!(!r.is_error);
                assert_eq!(r.result.as_deref(), Some("done"));
                assert_eq!(r.session_id.as_deref(), Some("abc"));
                assert_eq!(r.num_turns, Some(3));
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn user_and_untagged_values_are_unknown() {
        let user = EventKind::from_value(json!({"type": "user", "message": {}}));
        assert!(matches!(user, EventKind::Unknown { tag: Some(ref t), .. } if t == "user"));

        let untagged = EventKind::from_value(json!([1, 2, 3]));
        assert!(matches!(untagged, EventKind::Unknown { tag: None, .. }));
    }

    #[test]
    fn assistant_text_joins_text_blocks() {
        let event = AssistantEvent {
            session_id: None,
            payload: json!({
                "type": "assistant",
                "message": {"content": [
                    {"type": "text", "text": "first"},
                    {"type": "tool_use", "name": "Read"},
                    {"type": "text", "text": "second"}
                ]}
            }),
        };
        assert_eq!(event.text().as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let event = StreamEvent {
            seq: 4,
            kind: EventKind::Malformed(MalformedEvent {
                raw: "{oops".into(),
                reason: "eof".into(),
            }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 4);
        assert_eq!(json["kind"], "malformed");
        assert_eq!(json["raw"], "{oops");
    }
}
