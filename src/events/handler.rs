use async_trait::async_trait;
use std::sync::Arc;

use super::consumer::{ConsumedMessage, MessageHandler};
use crate::error::Result;
use crate::idempotency::{IdempotencyGuard, IdempotentOptions, Invocation};

/// Runs the wrapped handler at most once per message token.
///
/// The message is the asynchronous caller context: a missing token yields
/// `Discard`, a concurrent duplicate yields `DuplicateRejected`, and both are
/// acknowledged by the consumer instead of redelivered.
pub struct IdempotentMessageHandler<H> {
    inner: Arc<H>,
    guard: Arc<IdempotencyGuard>,
    options: IdempotentOptions,
    operation: String,
}

impl<H: MessageHandler> IdempotentMessageHandler<H> {
    pub fn new(operation: impl Into<String>, inner: Arc<H>, guard: Arc<IdempotencyGuard>) -> Self {
        Self {
            inner,
            guard,
            options: IdempotentOptions::default(),
            operation: operation.into(),
        }
    }

    pub fn with_options(mut self, options: IdempotentOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl<H: MessageHandler + 'static> MessageHandler for IdempotentMessageHandler<H> {
    async fn handle(&self, message: &ConsumedMessage) -> Result<()> {
        let invocation = Invocation::new(self.operation.as_str())
            .with_params(message.params())
            .with_message(message);

        let inner = Arc::clone(&self.inner);
        self.guard
            .execute(&self.options, &invocation, || async move { inner.handle(message).await })
            .await
    }
}
