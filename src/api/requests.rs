use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationErrors};

use super::responses::ValidationErrorDetail;

/// Request to create an order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 64, message = "customer_id must be 1-64 characters"))]
    pub customer_id: String,
    #[validate(length(min = 1, max = 64, message = "sku must be 1-64 characters"))]
    pub sku: String,
    pub quantity: u32,
    pub amount_cents: u64,
    /// Optional client reference, usable as the idempotency token source.
    #[serde(default)]
    pub client_reference: Option<String>,
}

impl CreateOrderRequest {
    pub fn check(&self) -> Result<(), Vec<ValidationErrorDetail>> {
        let mut details = match self.validate() {
            Ok(()) => Vec::new(),
            Err(errors) => validation_details(&errors),
        };
        if self.quantity == 0 {
            details.push(ValidationErrorDetail {
                field: "quantity".to_string(),
                message: "quantity must be positive".to_string(),
            });
        }
        if self.amount_cents == 0 {
            details.push(ValidationErrorDetail {
                field: "amount_cents".to_string(),
                message: "amount_cents must be positive".to_string(),
            });
        }
        if details.is_empty() {
            Ok(())
        } else {
            Err(details)
        }
    }
}

pub fn validation_details(errors: &ValidationErrors) -> Vec<ValidationErrorDetail> {
    errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errors)| {
            errors.iter().map(move |e| ValidationErrorDetail {
                field: field.to_string(),
                message: e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string()),
            })
        })
        .collect()
}
