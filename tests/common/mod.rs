#![allow(dead_code)]

use axum::http::{HeaderMap, HeaderValue};
use idempotency_guard::api::SyncRequest;
use idempotency_guard::idempotency::IdempotencyGuard;
use idempotency_guard::live_config::{ConfigSource, StaticConfigSource};
use idempotency_guard::store::InMemoryStateStore;
use std::collections::HashMap;
use std::sync::Arc;

pub const TOKEN_HEADER: &str = "Idempotency-Token";

pub fn setup_guard() -> (Arc<IdempotencyGuard>, Arc<InMemoryStateStore>) {
    setup_guard_with(Arc::new(StaticConfigSource::default()))
}

pub fn setup_guard_with(config: Arc<dyn ConfigSource>) -> (Arc<IdempotencyGuard>, Arc<InMemoryStateStore>) {
    let store = Arc::new(InMemoryStateStore::new());
    let guard = IdempotencyGuard::new(store.clone(), config);
    (Arc::new(guard), store)
}

/// A synchronous caller context carrying `token` in the default header.
pub fn sync_request(token: Option<&str>) -> SyncRequest {
    let mut headers = HeaderMap::new();
    if let Some(token) = token {
        headers.insert(TOKEN_HEADER, HeaderValue::from_str(token).expect("valid header value"));
    }
    SyncRequest::new(headers, HashMap::new())
}

/// An asynchronous caller context carrying `token` in the message headers.
pub fn message(token: Option<&str>) -> HashMap<String, String> {
    token
        .map(|t| HashMap::from([(TOKEN_HEADER.to_string(), t.to_string())]))
        .unwrap_or_default()
}

pub fn redis_url() -> String {
    dotenvy::dotenv().ok();
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}
