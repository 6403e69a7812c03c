//! Narrow adapter over the external key-value store.
//!
//! Every operation is atomic with respect to concurrent callers in other
//! processes. The adapter carries no retry or business logic; the guard in
//! [`crate::idempotency`] is written purely against [`StateStore`].

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use self::memory::InMemoryStateStore;
pub use self::redis::RedisStateStore;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Creates `key` only if it does not exist. Returns true when this call created it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Deletes `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Increments the counter at `key`; the expiry is set only when the counter is created.
    async fn increment_and_maybe_expire(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Replaces the value of `key` and refreshes its TTL only if the current value equals `expected`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Converts a TTL to whole seconds for stores with second granularity, never below one.
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
