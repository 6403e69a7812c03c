use thiserror::Error;

/// Errors surfaced by the idempotency guard and its adapters.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// No token could be resolved for a synchronous caller.
    #[error("validation error: {0}")]
    Validation(String),

    /// Asynchronous caller signal: acknowledge the message and do not redeliver it.
    #[error("message discarded without requeue: {0}")]
    Discard(String),

    #[error("{0}")]
    DuplicateRejected(String),

    #[error("retry limit exhausted, please try again later")]
    RetryExhausted,

    #[error("timed out waiting for the original request to finish")]
    WaitTimedOut,

    /// The guarded operation itself failed; the record has been marked FAILED.
    #[error("guarded operation failed: {0}")]
    OperationFailed(#[source] anyhow::Error),

    #[error("state store error: {0}")]
    Store(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IdempotencyError {
    /// Store-level failures: the mutual-exclusion guarantee cannot be upheld.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IdempotencyError::Store(_) | IdempotencyError::Redis(_) | IdempotencyError::Internal(_)
        )
    }

    /// Whether a message consumer should let the broker redeliver after this error.
    ///
    /// Duplicates are never requeued: another delivery of the same token owns it.
    pub fn should_requeue(&self) -> bool {
        !matches!(
            self,
            IdempotencyError::Discard(_)
                | IdempotencyError::Validation(_)
                | IdempotencyError::DuplicateRejected(_)
        )
    }

    /// Stable machine-readable code used in API error bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            IdempotencyError::Validation(_) => "TOKEN_MISSING",
            IdempotencyError::Discard(_) => "DISCARDED",
            IdempotencyError::DuplicateRejected(_) => "DUPLICATE_REQUEST",
            IdempotencyError::RetryExhausted => "RETRY_EXHAUSTED",
            IdempotencyError::WaitTimedOut => "WAIT_TIMEOUT",
            IdempotencyError::OperationFailed(_) => "OPERATION_FAILED",
            IdempotencyError::Store(_) | IdempotencyError::Redis(_) => "STORE_UNAVAILABLE",
            IdempotencyError::Serialization(_) => "SERIALIZATION_ERROR",
            IdempotencyError::Config(_) => "CONFIG_ERROR",
            IdempotencyError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;
