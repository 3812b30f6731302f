//! Chat socket wire format.
//!
//! Client frames are either the literal text `cancel` or a JSON chat request.
//! Server frames are serialized [`StreamEvent`](parley_core::stream::StreamEvent)s.

use serde::Deserialize;

use parley_core::messages::{ChatMessage, Role};
use parley_core::security::ApiKey;
use parley_llm::StreamRequest;

pub const CANCEL: &str = "cancel";

const DEFAULT_TEMPERATURE: f64 = 1.0;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid chat request: {0}")]
    InvalidJson(String),
    #[error("missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug)]
pub enum ClientFrame {
    Cancel,
    Chat(ChatRequest),
}

/// A chat request as sent by the browser. Required fields are optional here
/// so a missing one is reported by name.
#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<WireMessage>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub continuation: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub message: String,
}

pub fn parse_frame(raw: &str) -> Result<ClientFrame, ProtocolError> {
    if raw == CANCEL {
        return Ok(ClientFrame::Cancel);
    }
    serde_json::from_str(raw)
        .map(ClientFrame::Chat)
        .map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

impl ChatRequest {
    pub fn into_stream_request(self) -> Result<StreamRequest, ProtocolError> {
        let model = self
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or(ProtocolError::MissingField("model"))?;
        let messages = self.messages.ok_or(ProtocolError::MissingField("messages"))?;
        let max_tokens = self.max_tokens.ok_or(ProtocolError::MissingField("max_tokens"))?;

        let messages = messages
            .into_iter()
            .map(|m| ChatMessage::new(Role::parse_lenient(m.role.as_deref().unwrap_or("user")), m.message))
            .collect();

        Ok(StreamRequest {
            system_prompt: self.prompt.unwrap_or_default(),
            messages,
            model,
            max_tokens,
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            continuation: self.continuation.unwrap_or_default(),
            api_key: ApiKey::non_empty(self.api_key.as_deref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(raw: &str) -> Result<StreamRequest, ProtocolError> {
        match parse_frame(raw)? {
            ClientFrame::Chat(request) => request.into_stream_request(),
            ClientFrame::Cancel => panic!("expected a chat frame"),
        }
    }

    #[test]
    fn cancel_is_literal() {
        assert!(matches!(parse_frame("cancel"), Ok(ClientFrame::Cancel)));
        assert!(matches!(parse_frame("\"cancel\""), Err(ProtocolError::InvalidJson(_))));
    }

    #[test]
    fn full_request_maps_onto_stream_request() {
        let request = chat(
            r#"{"prompt":"be brief","messages":[{"role":"user","message":"hi"},{"role":"assistant","message":"hello"}],
                "model":"gpt-4","max_tokens":64,"temperature":0.2,"continuation":"Once","api_key":"sk-1"}"#,
        )
        .unwrap();
        assert_eq!(request.system_prompt, "be brief");
        assert_eq!(request.messages, vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")]);
        assert_eq!(request.model, "gpt-4");
        assert_eq!(request.max_tokens, 64);
        assert_eq!(request.temperature, 0.2);
        assert_eq!(request.continuation, "Once");
        assert_eq!(request.api_key.unwrap().expose(), "sk-1");
    }

    #[test]
    fn optional_fields_take_defaults() {
        let request = chat(r#"{"messages":[{}],"model":"gpt-4","max_tokens":1}"#).unwrap();
        assert_eq!(request.system_prompt, "");
        assert_eq!(request.messages, vec![ChatMessage::user("")]);
        assert_eq!(request.temperature, 1.0);
        assert_eq!(request.continuation, "");
        assert!(request.api_key.is_none());
    }

    #[test]
    fn blank_api_key_is_absent() {
        let request = chat(r#"{"messages":[],"model":"gpt-4","max_tokens":1,"api_key":""}"#).unwrap();
        assert!(request.api_key.is_none());
    }

    #[test]
    fn required_fields_are_named() {
        assert!(matches!(
            chat(r#"{"messages":[],"max_tokens":1}"#),
            Err(ProtocolError::MissingField("model"))
        ));
        assert!(matches!(
            chat(r#"{"messages":[],"model":"  ","max_tokens":1}"#),
            Err(ProtocolError::MissingField("model"))
        ));
        assert!(matches!(
            chat(r#"{"model":"gpt-4","max_tokens":1}"#),
            Err(ProtocolError::MissingField("messages"))
        ));
        assert!(matches!(
            chat(r#"{"model":"gpt-4","messages":[]}"#),
            Err(ProtocolError::MissingField("max_tokens"))
        ));
    }

    #[test]
    fn garbage_is_invalid_json() {
        assert!(matches!(parse_frame("{not json"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(
            parse_frame(r#"{"model":"gpt-4","messages":[],"max_tokens":-5}"#),
            Err(ProtocolError::InvalidJson(_))
        ));
    }
}
