use parley_store::StoreError;

use crate::srp::SrpError;

/// Every reason a handshake step can fail. Callers only ever see one generic
/// response; the variant exists for logs and tests.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no live challenge for this login")]
    UnknownChallenge,
    #[error("challenge expired")]
    ExpiredChallenge,
    #[error("challenge bound to another user")]
    UserMismatch,
    #[error("field {field} is {len} bytes, over the limit")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("proof did not verify")]
    BadProof,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("another login is in progress")]
    Busy,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownChallenge => "unknown_challenge",
            Self::ExpiredChallenge => "expired_challenge",
            Self::UserMismatch => "user_mismatch",
            Self::FieldTooLong { .. } => "field_too_long",
            Self::BadProof => "bad_proof",
            Self::Malformed(_) => "malformed",
            Self::Busy => "busy",
            Self::Store(_) => "store",
        }
    }
}

impl From<SrpError> for AuthError {
    fn from(e: SrpError) -> Self {
        match e {
            SrpError::BadProof => Self::BadProof,
            other => Self::Malformed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srp_errors_map_onto_auth_errors() {
        assert!(matches!(AuthError::from(SrpError::BadProof), AuthError::BadProof));
        assert!(matches!(
            AuthError::from(SrpError::IllegalParameter),
            AuthError::Malformed(_)
        ));
    }

    #[test]
    fn kinds_are_distinct() {
        let kinds = [
            AuthError::UnknownChallenge.kind(),
            AuthError::ExpiredChallenge.kind(),
            AuthError::UserMismatch.kind(),
            AuthError::FieldTooLong { field: "A", len: 2048 }.kind(),
            AuthError::BadProof.kind(),
            AuthError::Malformed(String::new()).kind(),
            AuthError::Busy.kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
