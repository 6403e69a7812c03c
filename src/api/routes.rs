use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use super::handlers::{self, OrderBook};
use crate::idempotency::{IdempotencyGuard, IdempotentOptions, TokenExpression};
use crate::live_config::LiveConfig;
use crate::store::RedisStateStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<IdempotencyGuard>,
    pub live_config: Arc<LiveConfig>,
    pub orders: Arc<OrderBook>,
    pub order_options: IdempotentOptions,
    pub store_probe: Option<RedisStateStore>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(guard: Arc<IdempotencyGuard>, live_config: Arc<LiveConfig>) -> Self {
        Self {
            guard,
            live_config,
            orders: Arc::new(OrderBook::new()),
            order_options: default_order_options(),
            store_probe: None,
            metrics_handle: None,
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Probes Redis from the health endpoint.
    pub fn with_store_probe(mut self, store: RedisStateStore) -> Self {
        self.store_probe = Some(store);
        self
    }

    pub fn with_order_options(mut self, options: IdempotentOptions) -> Self {
        self.order_options = options;
        self
    }
}

/// Token from `client_reference` in the body, else the `Idempotency-Token`
/// header, else the `idempotency_token` query parameter.
pub fn default_order_options() -> IdempotentOptions {
    IdempotentOptions::new()
        .with_token_expression(TokenExpression::field("client_reference"))
        .allow_param("idempotency_token")
        .scoped_by_operation()
}

/// Creates the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/orders", post(handlers::create_order))
        .with_state(state)
}
