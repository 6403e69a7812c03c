use anyhow::anyhow;
use chrono::Utc;
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::consumer::ConsumedMessage;
use crate::error::{IdempotencyError, Result};

/// Record header carrying the idempotency token.
pub const TOKEN_HEADER: &str = "Idempotency-Token";

/// Produces records with the idempotency token stamped into their headers.
pub struct EventProducer {
    client: Arc<Client>,
    partition_clients: Arc<RwLock<BTreeMap<String, Arc<PartitionClient>>>>,
    retry_count: u32,
    retry_delay_ms: u64,
}

impl EventProducer {
    pub async fn connect(brokers: Vec<String>) -> Result<Self> {
        info!("Connecting producer to Kafka brokers: {:?}", brokers);

        let client = ClientBuilder::new(brokers)
            .build()
            .await
            .map_err(|e| IdempotencyError::Internal(anyhow!("Failed to connect to Kafka: {}", e)))?;

        Ok(Self::from_client(Arc::new(client)))
    }

    /// Shares an already connected client.
    pub fn from_client(client: Arc<Client>) -> Self {
        Self {
            client,
            partition_clients: Arc::new(RwLock::new(BTreeMap::new())),
            retry_count: 3,
            retry_delay_ms: 100,
        }
    }

    pub fn with_retry(mut self, retry_count: u32, retry_delay_ms: u64) -> Self {
        self.retry_count = retry_count;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    async fn get_partition_client(&self, topic: &str) -> Result<Arc<PartitionClient>> {
        {
            let clients = self.partition_clients.read().await;
            if let Some(client) = clients.get(topic) {
                return Ok(client.clone());
            }
        }

        let partition_client = self
            .client
            .partition_client(topic.to_string(), 0, UnknownTopicHandling::Retry)
            .await
            .map_err(|e| IdempotencyError::Internal(anyhow!("Failed to get partition client: {}", e)))?;

        let client = Arc::new(partition_client);
        self.partition_clients
            .write()
            .await
            .insert(topic.to_string(), client.clone());

        Ok(client)
    }

    /// Serializes `payload` as JSON and sends it, stamping `token` when given.
    pub async fn send<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        token: Option<&str>,
        payload: &T,
    ) -> Result<i64> {
        let value = serde_json::to_vec(payload)?;
        let mut headers = BTreeMap::new();
        if let Some(token) = token {
            headers.insert(TOKEN_HEADER.to_string(), token.as_bytes().to_vec());
        }
        self.send_record(topic, build_record(key.map(str::as_bytes), value, headers))
            .await
    }

    /// Sends a record, retrying with linear delay.
    pub async fn send_record(&self, topic: &str, record: Record) -> Result<i64> {
        let partition_client = self.get_partition_client(topic).await?;

        let mut last_error = None;
        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                warn!("Retrying Kafka send, attempt {}/{}", attempt, self.retry_count);
                tokio::time::sleep(Duration::from_millis(self.retry_delay_ms * u64::from(attempt))).await;
            }

            match partition_client
                .produce(vec![record.clone()], Compression::NoCompression)
                .await
            {
                Ok(offsets) => {
                    let offset = offsets.first().copied().unwrap_or(0);
                    debug!("Message sent to topic {} at offset {}", topic, offset);
                    return Ok(offset);
                }
                Err(e) => {
                    error!("Failed to send message to Kafka: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(IdempotencyError::Internal(anyhow!(
            "Failed to send message after {} retries: {:?}",
            self.retry_count,
            last_error
        )))
    }
}

pub fn build_record(key: Option<&[u8]>, value: Vec<u8>, headers: BTreeMap<String, Vec<u8>>) -> Record {
    Record {
        key: key.map(<[u8]>::to_vec),
        value: Some(value),
        headers,
        timestamp: Utc::now(),
    }
}

/// Copy of a failed message for the dead-letter topic. Original headers,
/// including the idempotency token, are preserved.
pub fn dead_letter_record(message: &ConsumedMessage, reason: &IdempotencyError) -> Record {
    let mut headers = message.headers.clone();
    headers.insert("original_topic".to_string(), message.topic.as_bytes().to_vec());
    headers.insert("original_offset".to_string(), message.offset.to_string().into_bytes());
    headers.insert("failure_code".to_string(), reason.code().as_bytes().to_vec());

    build_record(message.key.as_deref(), message.value.clone(), headers)
}
