use std::fmt;
use std::str::FromStr;

use crate::error::IdempotencyError;

/// Lifecycle state of an idempotency record as stored in the external store.
///
/// `ABSENT` has no stored representation: it is the missing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
    Processing,
    Success,
    Failed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Processing => "PROCESSING",
            RecordState::Success => "SUCCESS",
            RecordState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordState::Processing)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = IdempotencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(RecordState::Processing),
            "SUCCESS" => Ok(RecordState::Success),
            "FAILED" => Ok(RecordState::Failed),
            other => Err(IdempotencyError::Store(format!(
                "unexpected idempotency record value: {}",
                other
            ))),
        }
    }
}

/// Store keys belonging to one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKeys {
    /// `{prefix}{token}`
    pub record: String,
    /// `{prefix}{token}:result`
    pub result: String,
    /// `{prefix}{token}:retry:count`
    pub retry_count: String,
}

impl RecordKeys {
    pub fn new(key_prefix: &str, token: &str) -> Self {
        let record = format!("{}{}", key_prefix, token);
        Self {
            result: format!("{}:result", record),
            retry_count: format!("{}:retry:count", record),
            record,
        }
    }

    /// Keys scoped by operation name so equal tokens of different operations do not collide.
    pub fn scoped(key_prefix: &str, operation: &str, token: &str) -> Self {
        Self::new(key_prefix, &format!("{}:{}", operation, token))
    }
}
