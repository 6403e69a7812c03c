use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdempotencyError;

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorResponse) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Option<Vec<ValidationErrorDetail>>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Vec<ValidationErrorDetail>) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorDetail {
    pub field: String,
    pub message: String,
}

pub fn error_status(error: &IdempotencyError) -> StatusCode {
    match error {
        IdempotencyError::Validation(_) | IdempotencyError::Discard(_) => StatusCode::BAD_REQUEST,
        IdempotencyError::DuplicateRejected(_) => StatusCode::CONFLICT,
        IdempotencyError::RetryExhausted => StatusCode::TOO_MANY_REQUESTS,
        IdempotencyError::WaitTimedOut => StatusCode::GATEWAY_TIMEOUT,
        IdempotencyError::Store(_) | IdempotencyError::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
        IdempotencyError::OperationFailed(_)
        | IdempotencyError::Serialization(_)
        | IdempotencyError::Config(_)
        | IdempotencyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for IdempotencyError {
    fn into_response(self) -> Response {
        let status = error_status(&self);

        // Internal causes stay in the logs.
        let message = if status.is_server_error() && status != StatusCode::GATEWAY_TIMEOUT {
            tracing::error!(error = %self, code = self.code(), "Request failed");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ApiResponse::<()>::error(ErrorResponse::new(self.code(), message))),
        )
            .into_response()
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub services: ServiceHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub state_store: bool,
    pub live_config_version: u64,
    pub live_config_refreshed_at: DateTime<Utc>,
}

/// Order created by the demo endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub customer_id: String,
    pub sku: String,
    pub quantity: u32,
    pub amount_cents: u64,
    pub created_at: DateTime<Utc>,
}
