use std::time::Duration;

/// Why a completion could not be produced or finished.
///
/// Nothing is retried automatically: the first failure ends the generation
/// and its `Display` text becomes the terminal event's `error`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("upstream rejected credentials: {0}")]
    AuthenticationFailed(String),
    #[error("upstream rejected request: {0}")]
    InvalidRequest(String),
    #[error("rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream returned {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("upstream overloaded")]
    ProviderOverloaded,
    #[error("could not reach upstream: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("unreadable chunk: {0}")]
    MalformedChunk(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

fn retry_hint(after: &Option<Duration>) -> String {
    after
        .map(|d| format!(", retry in {}s", d.as_secs()))
        .unwrap_or_default()
}

impl GatewayError {
    /// Stable label for the `error_kind` log field.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::MalformedChunk(_) => "malformed_chunk",
            Self::Timeout(_) => "timeout",
        }
    }

    pub fn from_status(status: u16, body: String) -> Self {
        Self::from_response(status, body, None)
    }

    /// Map a non-success HTTP reply, keeping any `Retry-After` hint.
    pub fn from_response(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            429 => Self::RateLimited { retry_after },
            503 | 529 => Self::ProviderOverloaded,
            500..=599 => Self::ServerError { status, body },
            400..=499 => Self::InvalidRequest(body),
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_variants() {
        let cases = [
            (401, "authentication_failed"),
            (403, "authentication_failed"),
            (404, "invalid_request"),
            (422, "invalid_request"),
            (429, "rate_limited"),
            (500, "server_error"),
            (502, "server_error"),
            (503, "provider_overloaded"),
            (529, "provider_overloaded"),
            (302, "invalid_request"),
        ];
        for (status, kind) in cases {
            assert_eq!(GatewayError::from_status(status, String::new()).error_kind(), kind, "{status}");
        }
        assert!(matches!(
            GatewayError::from_status(302, "moved".into()),
            GatewayError::InvalidRequest(msg) if msg.contains("302")
        ));
    }

    #[test]
    fn retry_after_survives_into_message() {
        let err = GatewayError::from_response(429, String::new(), Some(Duration::from_secs(7)));
        assert!(matches!(err, GatewayError::RateLimited { retry_after: Some(d) } if d.as_secs() == 7));
        assert_eq!(err.to_string(), "rate limited, retry in 7s");
        assert_eq!(GatewayError::from_status(429, String::new()).to_string(), "rate limited");
    }
}
