use serde::{Deserialize, Serialize};

/// Speaker of a chat message, in upstream wire form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Parse a client-supplied role. Anything unrecognised is treated as a user turn.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            _ => Self::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of conversation as forwarded to the completion backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_role_parsing() {
        assert_eq!(Role::parse_lenient("system"), Role::System);
        assert_eq!(Role::parse_lenient("assistant"), Role::Assistant);
        assert_eq!(Role::parse_lenient("user"), Role::User);
        assert_eq!(Role::parse_lenient("narrator"), Role::User);
        assert_eq!(Role::parse_lenient(""), Role::User);
    }

    #[test]
    fn message_serializes_in_upstream_shape() {
        let json = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "content": "hi"}));
    }
}
