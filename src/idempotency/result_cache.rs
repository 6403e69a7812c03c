use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::store::StateStore;

/// Serialized return values of guarded operations, kept for wait-and-replay callers.
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn StateStore>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Returns the cached value. Never writes: only the record owner evicts.
    ///
    /// A payload that does not decode as `T` is reported as a serialization
    /// error and left in place for callers expecting the owner's type.
    pub async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(payload) = self.store.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<T>(&payload) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Cached result does not match the requested type");
                Err(e.into())
            }
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.store.set_with_ttl(key, &payload, ttl).await
    }

    pub async fn evict(&self, key: &str) -> Result<bool> {
        self.store.delete(key).await
    }
}
