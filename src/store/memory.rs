use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::StateStore;
use crate::error::{IdempotencyError, Result};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Process-local [`StateStore`] for tests, benches and single-node development.
///
/// Expiry is measured with `tokio::time`, so paused test clocks apply.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|e| !e.is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn live<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
    entries.get(key).filter(|e| !e.is_expired())
}

/// Inserts after dropping every expired entry, so abandoned tokens do not pile up.
fn insert(entries: &mut HashMap<String, Entry>, key: &str, value: String, expires_at: Instant) {
    entries.retain(|_, e| !e.is_expired());
    entries.insert(key.to_string(), Entry { value, expires_at });
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if live(&entries, key).is_some() {
            return Ok(false);
        }
        insert(&mut entries, key, value.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(live(&entries, key).map(|e| e.value.clone()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let matches = live(&entries, key).map_or(false, |e| e.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn increment_and_maybe_expire(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let current = match live(&entries, key) {
            Some(entry) => Some((
                entry.value.parse::<i64>().map_err(|_| {
                    IdempotencyError::Store(format!("value at {} is not an integer", key))
                })?,
                entry.expires_at,
            )),
            None => None,
        };

        let (count, expires_at) = match current {
            Some((count, expires_at)) => (count + 1, expires_at),
            None => (1, Instant::now() + ttl),
        };
        insert(&mut entries, key, count.to_string(), expires_at);
        Ok(count)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                entry.value = value.to_string();
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        insert(&mut entries, key, value.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(key).map_or(false, |e| !e.is_expired()))
    }
}
