use super::context::CallerKind;
use crate::error::{IdempotencyError, Result};

/// Recoverable outcomes that did not run the guarded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    TokenMissing,
    DuplicateRejected(String),
    RetryExhausted,
    WaitTimedOut,
}

/// Shapes a rejection for the classified caller.
///
/// Synchronous callers always get a typed error. Asynchronous callers get a
/// discard signal for a missing token and the operation's default value when
/// waiting or retrying gave up, so the message is acknowledged rather than
/// redelivered forever.
pub fn translate<T: Default>(kind: CallerKind, rejection: Rejection) -> Result<T> {
    match (kind, rejection) {
        (CallerKind::Synchronous, Rejection::TokenMissing) => Err(IdempotencyError::Validation(
            "idempotency token is required".to_string(),
        )),
        (CallerKind::Asynchronous, Rejection::TokenMissing) => Err(IdempotencyError::Discard(
            "message carries no idempotency token".to_string(),
        )),
        (_, Rejection::DuplicateRejected(message)) => {
            Err(IdempotencyError::DuplicateRejected(message))
        }
        (CallerKind::Synchronous, Rejection::RetryExhausted) => {
            Err(IdempotencyError::RetryExhausted)
        }
        (CallerKind::Synchronous, Rejection::WaitTimedOut) => Err(IdempotencyError::WaitTimedOut),
        (CallerKind::Asynchronous, Rejection::RetryExhausted | Rejection::WaitTimedOut) => {
            Ok(T::default())
        }
    }
}
