use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;
use crate::messages::Role;

/// One increment from a completion backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionChunk {
    /// Text appended by this chunk (may be empty, e.g. the role preamble or the final marker).
    pub delta: String,
    /// Set on the last chunk of a successful generation.
    pub finish_reason: Option<String>,
}

impl CompletionChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            finish_reason: None,
        }
    }

    pub fn finished(text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            finish_reason: Some(reason.into()),
        }
    }
}

/// Progress event sent to the client, one per upstream chunk.
///
/// `message` always carries the full text generated so far, not a delta.
/// `finish_reason` is serialized as `null` while generation is in flight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: ConnectionId,
    pub role: Role,
    pub message: String,
    pub finish_reason: Option<String>,
    pub cost_tokens_completion: u32,
    pub cost_tokens_prompt: u32,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamEvent {
    /// A terminal error event carrying no generation progress.
    pub fn failure(id: ConnectionId, error: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::Assistant,
            message: String::new(),
            finish_reason: None,
            cost_tokens_completion: 0,
            cost_tokens_prompt: 0,
            cost_usd: 0.0,
            error: Some(error.into()),
        }
    }

    /// Terminal events end a generation: either a finish reason or an error.
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some() || self.error.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_event_serializes_null_finish_reason() {
        let event = StreamEvent {
            id: ConnectionId::from_raw("conn_1"),
            role: Role::Assistant,
            message: "Hel".into(),
            finish_reason: None,
            cost_tokens_completion: 1,
            cost_tokens_prompt: 10,
            cost_usd: 0.5,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], "conn_1");
        assert_eq!(json["role"], "assistant");
        assert!(json["finish_reason"].is_null());
        assert!(json.get("error").is_none());
        assert!(!event.is_terminal());
    }

    #[test]
    fn failure_is_terminal_and_carries_error() {
        let event = StreamEvent::failure(ConnectionId::from_raw("conn_2"), "missing model");
        assert!(event.is_terminal());
        assert!(event.is_error());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["error"], "missing model");
        assert_eq!(json["message"], "");
    }

    #[test]
    fn chunk_constructors() {
        assert_eq!(CompletionChunk::delta("a").finish_reason, None);
        assert_eq!(
            CompletionChunk::finished("", "stop").finish_reason.as_deref(),
            Some("stop")
        );
    }
}
