pub mod consumer;
pub mod handler;
pub mod producer;

pub use consumer::{disposition, ConsumedMessage, ConsumerConfig, Disposition, EventConsumer, MessageHandler};
pub use handler::IdempotentMessageHandler;
pub use producer::{EventProducer, TOKEN_HEADER};
