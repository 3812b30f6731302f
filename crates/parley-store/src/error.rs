use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(rusqlite::Error),

    /// A UNIQUE, PRIMARY KEY or FOREIGN KEY constraint rejected a write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{table}.{column} holds an unreadable value: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("schema: {0}")]
    Schema(String),

    #[error("encoding column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("preparing database directory: {0}")]
    Io(#[from] io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, detail)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(detail.unwrap_or_else(|| code.to_string()))
            }
            other => StoreError::Sqlite(other),
        }
    }
}
