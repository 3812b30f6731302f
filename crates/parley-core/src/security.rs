use secrecy::{ExposeSecret, SecretString};

/// Wraps an API key with secrecy protection (zeroized on drop, redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl ApiKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(SecretString::from(raw.into()))
    }

    /// Build a key from optional client input, treating blank strings as absent.
    pub fn non_empty(raw: Option<&str>) -> Option<Self> {
        raw.map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::new)
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let key = ApiKey::new("sk-secret");
        assert_eq!(format!("{key:?}"), "ApiKey([REDACTED])");
        assert_eq!(key.expose(), "sk-secret");
    }

    #[test]
    fn blank_keys_are_absent() {
        assert!(ApiKey::non_empty(None).is_none());
        assert!(ApiKey::non_empty(Some("")).is_none());
        assert!(ApiKey::non_empty(Some("   ")).is_none());
        assert_eq!(ApiKey::non_empty(Some(" sk-1 ")).unwrap().expose(), "sk-1");
    }
}
