mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use idempotency_guard::api::responses::{ApiResponse, ErrorResponse, OrderResponse};
use idempotency_guard::api::{create_router, AppState};
use idempotency_guard::live_config::LiveConfig;
use idempotency_guard::store::InMemoryStateStore;
use idempotency_guard::IdempotencyGuard;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;

fn test_app() -> (Router, AppState) {
    let live = Arc::new(LiveConfig::default());
    let guard = IdempotencyGuard::new(Arc::new(InMemoryStateStore::new()), live.clone());
    let state = AppState::new(Arc::new(guard), live);
    (create_router(state.clone()), state)
}

fn order_request(uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header(common::TOKEN_HEADER, token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn order_body() -> serde_json::Value {
    json!({ "customer_id": "cust-7", "sku": "SKU-9", "quantity": 1, "amount_cents": 2500 })
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_api_response_error_serialization() {
    let response = ApiResponse::<()>::error(ErrorResponse::new("DUPLICATE_REQUEST", "busy"));
    let json = serde_json::to_string(&response).unwrap();
    assert!(json.contains("\"success\":false"));
    assert!(json.contains("\"code\":\"DUPLICATE_REQUEST\""));
}

#[tokio::test]
async fn test_create_order_then_duplicate_is_conflict() {
    let (app, state) = test_app();

    let created = app
        .clone()
        .oneshot(order_request("/orders", Some("order-T1"), order_body()))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let body: ApiResponse<OrderResponse> = read_json(created).await;
    assert_eq!(body.data.unwrap().sku, "SKU-9");

    let duplicate = app
        .oneshot(order_request("/orders", Some("order-T1"), order_body()))
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let body: ApiResponse<()> = read_json(duplicate).await;
    let error = body.error.unwrap();
    assert_eq!(error.code, "DUPLICATE_REQUEST");
    assert_eq!(error.message, "Request is already being processed, please do not resubmit");

    assert_eq!(state.orders.len().await, 1);
}

#[tokio::test]
async fn test_missing_token_is_bad_request() {
    let (app, state) = test_app();

    let response = app
        .oneshot(order_request("/orders", None, order_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ApiResponse<()> = read_json(response).await;
    assert_eq!(body.error.unwrap().code, "TOKEN_MISSING");
    assert!(state.orders.is_empty().await);
}

#[tokio::test]
async fn test_token_from_query_and_body() {
    let (app, state) = test_app();

    let by_query = app
        .clone()
        .oneshot(order_request("/orders?idempotency_token=q-1", None, order_body()))
        .await
        .unwrap();
    assert_eq!(by_query.status(), StatusCode::CREATED);

    let mut body = order_body();
    body["client_reference"] = json!("ref-1");
    let by_body = app
        .clone()
        .oneshot(order_request("/orders", Some("ignored-header"), body.clone()))
        .await
        .unwrap();
    assert_eq!(by_body.status(), StatusCode::CREATED);

    // Same client reference under a different header still collides.
    let again = app
        .oneshot(order_request("/orders", Some("other-header"), body))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);

    assert_eq!(state.orders.len().await, 2);
}

#[tokio::test]
async fn test_invalid_body_reports_details() {
    let (app, _state) = test_app();

    let response = app
        .oneshot(order_request(
            "/orders",
            Some("order-bad"),
            json!({ "customer_id": "", "sku": "SKU-1", "quantity": 0, "amount_cents": 100 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ApiResponse<()> = read_json(response).await;
    let error = body.error.unwrap();
    assert_eq!(error.code, "VALIDATION_ERROR");
    assert_eq!(error.details.unwrap().len(), 2);
}

#[tokio::test]
async fn test_health_reports_live_config_version() {
    let (app, state) = test_app();
    state.live_config.replace(Default::default());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = read_json(response).await;
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["services"]["live_config_version"], 1);
}

#[tokio::test]
async fn test_metrics_without_exporter_is_unavailable() {
    let (app, _state) = test_app();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
