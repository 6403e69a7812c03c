use anyhow::anyhow;
use async_trait::async_trait;
use rskafka::client::partition::{OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::RecordAndOffset;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::producer::{dead_letter_record, EventProducer};
use crate::error::{IdempotencyError, Result};
use crate::idempotency::{MessageEnvelope, OperationParams};

/// Configuration for the Kafka consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    pub auto_offset_reset: OffsetReset,
    pub fetch_max_wait_ms: i32,
    pub max_poll_records: usize,
    pub dead_letter_topic: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topics: vec!["orders.commands".to_string()],
            auto_offset_reset: OffsetReset::default(),
            fetch_max_wait_ms: 500,
            max_poll_records: 100,
            dead_letter_topic: Some("orders.dlq".to_string()),
        }
    }
}

/// Message received from Kafka.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, Vec<u8>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ConsumedMessage {
    /// Deserializes the message value as JSON.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }

    /// Gets the key as a string.
    pub fn key_str(&self) -> Option<String> {
        self.key.as_ref().and_then(|k| String::from_utf8(k.clone()).ok())
    }

    /// The JSON object payload as operation parameters; empty for anything else.
    pub fn params(&self) -> OperationParams {
        serde_json::from_slice::<serde_json::Value>(&self.value)
            .ok()
            .and_then(|value| OperationParams::from_serializable(&value).ok())
            .unwrap_or_default()
    }
}

impl MessageEnvelope for ConsumedMessage {
    fn header(&self, name: &str) -> Option<String> {
        self.headers.header(name)
    }
}

/// What the consumer does with a message once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Advance past the message.
    Acknowledge,
    /// Advance past the message and copy it to the dead-letter topic.
    DeadLetter,
}

/// Discards and duplicates are acknowledged; anything redeliverable is dead-lettered.
pub fn disposition(result: &Result<()>) -> Disposition {
    match result {
        Ok(()) => Disposition::Acknowledge,
        Err(e) if !e.should_requeue() => Disposition::Acknowledge,
        Err(_) => Disposition::DeadLetter,
    }
}

/// Handler trait for processing consumed messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a single message. Errors are routed through [`disposition`].
    async fn handle(&self, message: &ConsumedMessage) -> Result<()>;

    /// Called when a message fails processing and is sent to DLQ.
    async fn on_dead_letter(&self, message: &ConsumedMessage, error: &IdempotencyError) {
        error!(
            "Message sent to DLQ: topic={}, partition={}, offset={}, error={}",
            message.topic, message.partition, message.offset, error
        );
    }
}

/// Single-partition Kafka consumer with manual offset tracking.
pub struct EventConsumer {
    config: ConsumerConfig,
    client: Option<Arc<Client>>,
    producer: Option<EventProducer>,
    partition_clients: Arc<RwLock<BTreeMap<String, Arc<PartitionClient>>>>,
    offsets: Arc<RwLock<BTreeMap<String, AtomicI64>>>,
    running: Arc<AtomicBool>,
}

impl EventConsumer {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            client: None,
            producer: None,
            partition_clients: Arc::new(RwLock::new(BTreeMap::new())),
            offsets: Arc::new(RwLock::new(BTreeMap::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connects to the Kafka cluster.
    pub async fn connect(&mut self) -> Result<()> {
        info!("Connecting consumer to Kafka brokers: {:?}", self.config.brokers);

        let client = ClientBuilder::new(self.config.brokers.clone())
            .build()
            .await
            .map_err(|e| IdempotencyError::Internal(anyhow!("Failed to connect to Kafka: {}", e)))?;
        let client = Arc::new(client);

        self.producer = Some(EventProducer::from_client(Arc::clone(&client)));
        self.client = Some(client);

        for topic in &self.config.topics {
            self.get_partition_client(topic).await?;
        }

        info!("Consumer successfully connected to Kafka");
        Ok(())
    }

    async fn get_partition_client(&self, topic: &str) -> Result<Arc<PartitionClient>> {
        {
            let clients = self.partition_clients.read().await;
            if let Some(client) = clients.get(topic) {
                return Ok(client.clone());
            }
        }

        let kafka_client = self
            .client
            .as_ref()
            .ok_or_else(|| IdempotencyError::Internal(anyhow!("Kafka client not connected")))?;

        let partition_client = kafka_client
            .partition_client(topic.to_string(), 0, UnknownTopicHandling::Retry)
            .await
            .map_err(|e| IdempotencyError::Internal(anyhow!("Failed to get partition client: {}", e)))?;

        let client = Arc::new(partition_client);
        self.partition_clients
            .write()
            .await
            .insert(topic.to_string(), client.clone());

        let needs_offset = !self.offsets.read().await.contains_key(topic);
        if needs_offset {
            let initial_offset = match self.config.auto_offset_reset {
                OffsetReset::Earliest => client.get_offset(OffsetAt::Earliest).await,
                OffsetReset::Latest => client.get_offset(OffsetAt::Latest).await,
            }
            .map_err(|e| IdempotencyError::Internal(anyhow!("Failed to resolve offset: {}", e)))?;

            self.offsets
                .write()
                .await
                .entry(topic.to_string())
                .or_insert_with(|| AtomicI64::new(initial_offset));
        }

        Ok(client)
    }

    async fn get_offset(&self, topic: &str) -> i64 {
        let offsets = self.offsets.read().await;
        offsets
            .get(topic)
            .map(|o| o.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    async fn update_offset(&self, topic: &str, offset: i64) {
        let offsets = self.offsets.read().await;
        if let Some(o) = offsets.get(topic) {
            o.store(offset, Ordering::SeqCst);
        }
    }

    /// Polls for messages from a specific topic.
    pub async fn poll(&self, topic: &str) -> Result<Vec<ConsumedMessage>> {
        let partition_client = self.get_partition_client(topic).await?;
        let current_offset = self.get_offset(topic).await;

        let (records, _high_watermark) = partition_client
            .fetch_records(current_offset, 1..1_000_000, self.config.fetch_max_wait_ms)
            .await
            .map_err(|e| IdempotencyError::Internal(anyhow!("Failed to fetch records: {}", e)))?;

        let messages: Vec<ConsumedMessage> = records
            .into_iter()
            .take(self.config.max_poll_records)
            .map(|r: RecordAndOffset| ConsumedMessage {
                topic: topic.to_string(),
                partition: 0,
                offset: r.offset,
                key: r.record.key,
                value: r.record.value.unwrap_or_default(),
                headers: r.record.headers,
                timestamp: r.record.timestamp,
            })
            .collect();

        if let Some(last) = messages.last() {
            self.update_offset(topic, last.offset + 1).await;
        }

        debug!("Polled {} messages from topic {}", messages.len(), topic);
        Ok(messages)
    }

    /// Polls for messages from all configured topics.
    pub async fn poll_all(&self) -> Result<Vec<ConsumedMessage>> {
        let mut all_messages = Vec::new();

        for topic in &self.config.topics {
            match self.poll(topic).await {
                Ok(messages) => all_messages.extend(messages),
                Err(e) => {
                    warn!("Failed to poll topic {}: {}", topic, e);
                }
            }
        }

        Ok(all_messages)
    }

    /// Starts consuming messages with the given handler until [`stop`](Self::stop) is called.
    pub async fn start<H: MessageHandler + 'static>(&self, handler: Arc<H>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("Starting consumer for topics: {:?}", self.config.topics);

        while self.running.load(Ordering::SeqCst) {
            let messages = self.poll_all().await?;

            for message in messages {
                let result = handler.handle(&message).await;
                match (disposition(&result), result) {
                    (Disposition::Acknowledge, Ok(())) => {
                        debug!("Processed message at offset {}", message.offset);
                    }
                    (Disposition::Acknowledge, Err(e)) => {
                        info!(offset = message.offset, code = e.code(), "Acknowledged without processing: {}", e);
                    }
                    (Disposition::DeadLetter, Err(e)) => {
                        handler.on_dead_letter(&message, &e).await;
                        if let Some(dlq_topic) = &self.config.dead_letter_topic {
                            if let Err(dlq_err) = self.send_to_dlq(dlq_topic, &message, &e).await {
                                error!("Failed to send message to DLQ: {}", dlq_err);
                            }
                        }
                    }
                    (Disposition::DeadLetter, Ok(())) => {}
                }
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        info!("Consumer stopped");
        Ok(())
    }

    async fn send_to_dlq(
        &self,
        dlq_topic: &str,
        message: &ConsumedMessage,
        reason: &IdempotencyError,
    ) -> Result<()> {
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| IdempotencyError::Internal(anyhow!("Kafka client not connected")))?;

        producer
            .send_record(dlq_topic, dead_letter_record(message, reason))
            .await?;

        warn!("Message sent to DLQ: {}", dlq_topic);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Consumer stop requested");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }
}
