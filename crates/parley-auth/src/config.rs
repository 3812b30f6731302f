use std::time::Duration;

/// Handshake tuning.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// A challenge older than this is refused at step 2. Expired challenges
    /// are dropped whenever step 1 issues a new one, and by the purge loop.
    pub challenge_ttl: Duration,
    /// Every step-1/step-2 response is held until this long after arrival.
    pub min_response_time: Duration,
    /// Step-2 fields longer than this are rejected before any lookup.
    pub max_field_len: usize,
    /// Seeds the stand-in salt/verifier for accounts that cannot log in.
    /// A random value is drawn at startup when unset.
    pub substitute_secret: Option<Vec<u8>>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            challenge_ttl: Duration::from_secs(30),
            min_response_time: Duration::from_secs(1),
            max_field_len: 1024,
            substitute_secret: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Idle time after which a session is no longer valid.
    pub session_ttl: chrono::Duration,
    /// Idle time after which a successful validation persists a new last-used time.
    pub refresh_after: chrono::Duration,
    pub purge_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl: chrono::Duration::days(37),
            refresh_after: chrono::Duration::days(1),
            purge_interval: Duration::from_secs(10 * 60),
        }
    }
}
