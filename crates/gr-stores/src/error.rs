// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Store-level failure classes. Consumers translate these into the shared
/// taxonomy via the [`From`] impl; the relational client's retry loop keys
/// off [`StoreError::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Unique/foreign-key/check violation. Never retried.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Deadlock or serialization failure. Retried with backoff.
    #[error("deadlock: {0}")]
    Deadlock(String),

    /// Connection dropped mid-operation. Retried after reconnect.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Operation or pool-acquire deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Anything else.
    #[error("store failure: {0}")]
    Failure(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Deadlock(_) | StoreError::ConnectionLost(_))
    }
}

impl From<StoreError> for gr_core::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Constraint(msg) => gr_core::Error::Conflict(msg),
            StoreError::Deadlock(msg)
            | StoreError::ConnectionLost(msg)
            | StoreError::Timeout(msg) => gr_core::Error::Transient(msg),
            StoreError::Failure(msg) => gr_core::Error::Failure(msg),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            StoreError::Timeout(e.to_string())
        } else if e.is_connection_dropped() || e.is_io_error() {
            StoreError::ConnectionLost(e.to_string())
        } else {
            StoreError::Failure(e.to_string())
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let code = db.code().unwrap_or_default().to_string();
                // 23xxx: integrity constraint violations.
                // 40001/40P01: serialization failure / deadlock detected.
                if code.starts_with("23") {
                    StoreError::Constraint(db.message().to_string())
                } else if code == "40001" || code == "40P01" {
                    StoreError::Deadlock(db.message().to_string())
                } else {
                    StoreError::Failure(db.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => {
                StoreError::Timeout("connection pool acquire timed out".into())
            }
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed => StoreError::ConnectionLost(e.to_string()),
            sqlx::Error::RowNotFound => StoreError::Failure("row not found".into()),
            _ => StoreError::Failure(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
