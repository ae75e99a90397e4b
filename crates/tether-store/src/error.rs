use tether_core::{ExecutionId, NativeSessionId, TransactionId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A second record tried to claim an existing transaction id. Only a
    /// broken token generator can cause this.
    #[error("duplicate transaction id: {0}")]
    DuplicateTransaction(TransactionId),

    /// Another pending launch is running the native session this one asked
    /// to continue.
    #[error("native session {session} is busy in another live launch")]
    ResumeClaimed {
        session: NativeSessionId,
        holder: Option<ExecutionId>,
    },

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// True when `e` is a UNIQUE/PRIMARY KEY constraint failure.
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
                && (err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}
