pub mod api;
pub mod config;
pub mod error;
#[cfg(feature = "kafka")]
pub mod events;
pub mod idempotency;
pub mod live_config;
pub mod observability;
pub mod store;

pub use error::{IdempotencyError, Result};
pub use idempotency::{IdempotencyGuard, IdempotentOptions, Invocation};
