//! Per-invocation mode resolution.
//!
//! Three tiers are merged: the per-call [`IdempotentOptions`], the live
//! defaults read from a [`ConfigSource`], and the hard-coded fallbacks below.
//! Scalar per-call fields that still hold their documented default count as
//! unset; `wait_and_replay` is tri-state and only `None` falls through.

use std::borrow::Cow;
use std::str::FromStr;
use std::time::Duration;
use validator::{Validate, ValidationError, ValidationErrors};

use super::record::RecordKeys;
use super::token::TokenExpression;
use crate::error::{IdempotencyError, Result};
use crate::live_config::{keys, ConfigSource};

pub const DEFAULT_KEY_PREFIX: &str = "idempotent:";
pub const DEFAULT_EXPIRE_TIME_SECS: u64 = 300;
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_WAIT_ATTEMPTS: u32 = 50;
pub const DEFAULT_REJECT_MESSAGE: &str =
    "Request is already being processed, please do not resubmit";
pub const DEFAULT_HEADER_NAME: &str = "Idempotency-Token";
pub const DEFAULT_PARAM_NAME: &str = "idempotency_token";

/// Per-call configuration of a guarded operation.
#[derive(Debug, Clone, Validate)]
pub struct IdempotentOptions {
    /// Derives the token from the operation's own parameters; probed first.
    pub token_expression: Option<TokenExpression>,
    #[validate(length(min = 1, message = "header_name cannot be empty"))]
    pub header_name: String,
    /// Allows the token to come from a request parameter when the header is absent.
    pub allow_param: bool,
    #[validate(length(min = 1, message = "param_name cannot be empty"))]
    pub param_name: String,
    /// Record TTL in seconds.
    pub expire_time: u64,
    pub wait_and_replay: Option<bool>,
    pub max_retry_count: u32,
    pub retry_interval_ms: u64,
    /// Message returned with duplicate rejections. Empty means unset.
    pub reject_message: String,
    /// Whether a failure of the guarded operation is returned to the caller.
    pub surface_failure: bool,
    /// Scope the record key by operation name as well as token.
    pub scope_by_operation: bool,
}

impl Default for IdempotentOptions {
    fn default() -> Self {
        Self {
            token_expression: None,
            header_name: DEFAULT_HEADER_NAME.to_string(),
            allow_param: false,
            param_name: DEFAULT_PARAM_NAME.to_string(),
            expire_time: DEFAULT_EXPIRE_TIME_SECS,
            wait_and_replay: None,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            reject_message: String::new(),
            surface_failure: true,
            scope_by_operation: false,
        }
    }
}

impl IdempotentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token_expression(mut self, expression: TokenExpression) -> Self {
        self.token_expression = Some(expression);
        self
    }

    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    pub fn allow_param(mut self, name: impl Into<String>) -> Self {
        self.allow_param = true;
        self.param_name = name.into();
        self
    }

    pub fn with_expire_time(mut self, seconds: u64) -> Self {
        self.expire_time = seconds;
        self
    }

    pub fn wait_and_replay(mut self, enabled: bool) -> Self {
        self.wait_and_replay = Some(enabled);
        self
    }

    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn with_retry_interval_ms(mut self, millis: u64) -> Self {
        self.retry_interval_ms = millis;
        self
    }

    pub fn with_reject_message(mut self, message: impl Into<String>) -> Self {
        self.reject_message = message.into();
        self
    }

    pub fn suppress_failure(mut self) -> Self {
        self.surface_failure = false;
        self
    }

    pub fn scoped_by_operation(mut self) -> Self {
        self.scope_by_operation = true;
        self
    }

    /// Field validation plus the numeric bounds.
    pub fn check(&self) -> Result<()> {
        let mut errors = self.validate().err().unwrap_or_else(ValidationErrors::new);
        if self.expire_time == 0 {
            errors.add("expire_time", positive("expire_time must be at least one second"));
        }
        if self.retry_interval_ms == 0 {
            errors.add("retry_interval_ms", positive("retry_interval_ms must be positive"));
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(IdempotencyError::Validation(errors.to_string()))
        }
    }
}

fn positive(message: &'static str) -> ValidationError {
    let mut error = ValidationError::new("range");
    error.message = Some(Cow::Borrowed(message));
    error
}

/// The effective settings for one invocation. Never cached beyond it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMode {
    pub token: String,
    pub key_prefix: String,
    pub keys: RecordKeys,
    pub expire_time: Duration,
    pub wait_and_replay: bool,
    pub max_retry_count: u32,
    pub retry_interval: Duration,
    pub max_wait_attempts: u32,
    pub reject_message: String,
    pub surface_failure: bool,
}

impl ResolvedMode {
    pub fn mode_name(&self) -> &'static str {
        if self.wait_and_replay {
            "wait_and_replay"
        } else {
            "fail_fast"
        }
    }
}

fn live<T: FromStr>(source: &dyn ConfigSource, key: &str) -> Option<T> {
    let raw = source.get(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable live configuration value");
            None
        }
    }
}

fn live_flag(source: &dyn ConfigSource, key: &str) -> Option<bool> {
    let raw = source.get(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable live configuration flag");
            None
        }
    }
}

fn per_call<T: PartialEq>(value: T, sentinel: T) -> Option<T> {
    if value == sentinel {
        None
    } else {
        Some(value)
    }
}

/// Merges the three configuration tiers into the settings for one invocation.
pub fn resolve(
    options: &IdempotentOptions,
    source: &dyn ConfigSource,
    token: &str,
    operation: &str,
) -> ResolvedMode {
    let key_prefix = source
        .get(keys::KEY_PREFIX)
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

    let expire_secs = per_call(options.expire_time, DEFAULT_EXPIRE_TIME_SECS)
        .or_else(|| live::<u64>(source, keys::EXPIRE_TIME).filter(|s| *s > 0))
        .unwrap_or(DEFAULT_EXPIRE_TIME_SECS);

    let wait_and_replay = match options.wait_and_replay {
        Some(explicit) => explicit,
        None => live_flag(source, keys::WAIT_AND_REPLAY).unwrap_or(false),
    };

    let max_retry_count = per_call(options.max_retry_count, DEFAULT_MAX_RETRY_COUNT)
        .or_else(|| live::<u32>(source, keys::MAX_RETRY_COUNT))
        .unwrap_or(DEFAULT_MAX_RETRY_COUNT);

    let retry_interval_ms = per_call(options.retry_interval_ms, DEFAULT_RETRY_INTERVAL_MS)
        .or_else(|| live::<u64>(source, keys::RETRY_INTERVAL_MS).filter(|ms| *ms > 0))
        .unwrap_or(DEFAULT_RETRY_INTERVAL_MS);

    let max_wait_attempts = live::<u32>(source, keys::MAX_WAIT_ATTEMPTS)
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_WAIT_ATTEMPTS);

    let reject_message = per_call(options.reject_message.trim(), "")
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_REJECT_MESSAGE.to_string());

    let keys = if options.scope_by_operation {
        RecordKeys::scoped(&key_prefix, operation, token)
    } else {
        RecordKeys::new(&key_prefix, token)
    };

    ResolvedMode {
        token: token.to_string(),
        key_prefix,
        keys,
        expire_time: Duration::from_secs(expire_secs),
        wait_and_replay,
        max_retry_count,
        retry_interval: Duration::from_millis(retry_interval_ms),
        max_wait_attempts,
        reject_message,
        surface_failure: options.surface_failure,
    }
}
