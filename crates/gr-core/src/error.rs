use std::time::Duration;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// The error taxonomy shared by every subsystem.
///
/// Component boundaries translate store- and provider-specific failures into
/// one of these classes; the HTTP layer maps them onto status codes and the
/// pipeline decides retry behavior from them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input. Surfaced as 400/422 at the HTTP boundary; never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// Missing or insufficient credentials. 401/403; never retried.
    #[error("auth: {0}")]
    Auth(String),

    /// State-machine mismatch (e.g. approving an item that is not in
    /// review). 404/409; not retried.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store timeout, connection loss, or provider throttling. Retried with
    /// exponential backoff under a capped budget, then promoted to
    /// [`Error::Failure`].
    #[error("transient: {0}")]
    Transient(String),

    /// Too many requests. 429 with a retry-after hint.
    #[error("rate limited – retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Unexpected. Logged with context and surfaced as 500.
    #[error("failure: {0}")]
    Failure(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::RateLimited { .. })
    }

    /// Suggested wait before the next attempt, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }

    /// Promote a retryable error to a terminal [`Error::Failure`] once the
    /// retry budget is exhausted.
    pub fn into_failure(self) -> Error {
        match self {
            Error::Transient(msg) => Error::Failure(format!("retry budget exhausted: {msg}")),
            Error::RateLimited { retry_after_secs } => Error::Failure(format!(
                "retry budget exhausted: still rate limited ({retry_after_secs}s)"
            )),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Failure(format!("json: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(Error::Transient("pool exhausted".into()).is_retryable());
        assert!(Error::RateLimited {
            retry_after_secs: 30
        }
        .is_retryable());
        assert!(!Error::Conflict("not pending".into()).is_retryable());
        assert!(!Error::Validation("empty body".into()).is_retryable());
    }

    #[test]
    fn retry_after_only_on_rate_limited() {
        let e = Error::RateLimited {
            retry_after_secs: 60,
        };
        assert_eq!(e.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(Error::Transient("x".into()).retry_after(), None);
    }

    #[test]
    fn into_failure_promotes_retryable() {
        let promoted = Error::Transient("timeout".into()).into_failure();
        assert!(matches!(promoted, Error::Failure(_)));

        // Non-retryable classes pass through unchanged.
        let conflict = Error::Conflict("already claimed".into()).into_failure();
        assert!(matches!(conflict, Error::Conflict(_)));
    }
}
