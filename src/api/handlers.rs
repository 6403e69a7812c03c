use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::api::extract::SyncRequest;
use crate::api::requests::CreateOrderRequest;
use crate::api::responses::{
    ApiResponse, ErrorResponse, HealthResponse, OrderResponse, ServiceHealth,
};
use crate::idempotency::{Invocation, OperationParams};

use super::routes::AppState;

/// In-memory order book backing the demo endpoint.
#[derive(Debug, Default)]
pub struct OrderBook {
    orders: RwLock<HashMap<Uuid, OrderResponse>>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, request: CreateOrderRequest) -> OrderResponse {
        let order = OrderResponse {
            id: Uuid::new_v4(),
            customer_id: request.customer_id,
            sku: request.sku,
            quantity: request.quantity,
            amount_cents: request.amount_cents,
            created_at: chrono::Utc::now(),
        };
        self.orders.write().await.insert(order.id, order.clone());
        order
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let store_healthy = match &state.store_probe {
        Some(store) => store.ping().await.is_ok(),
        None => true,
    };
    let snapshot = state.live_config.snapshot();

    let response = HealthResponse {
        status: if store_healthy { "healthy".to_string() } else { "degraded".to_string() },
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        services: ServiceHealth {
            state_store: store_healthy,
            live_config_version: snapshot.version,
            live_config_refreshed_at: snapshot.refreshed_at,
        },
    };

    Json(ApiResponse::success(response))
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics exporter not installed").into_response(),
    }
}

/// Create an order at most once per idempotency token.
pub async fn create_order(
    State(state): State<AppState>,
    request: SyncRequest,
    Json(body): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderResponse>>), Response> {
    if let Err(details) = body.check() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::error(
                ErrorResponse::new("VALIDATION_ERROR", "Request validation failed")
                    .with_details(details),
            )),
        )
            .into_response());
    }

    let params = OperationParams::from_serializable(&body).map_err(IntoResponse::into_response)?;
    let invocation = Invocation::new("create_order")
        .with_params(params)
        .with_request(&request);

    let orders = Arc::clone(&state.orders);
    let order = state
        .guard
        .execute(&state.order_options, &invocation, move || async move {
            Ok::<_, anyhow::Error>(orders.create(body).await)
        })
        .await
        .map_err(IntoResponse::into_response)?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}
