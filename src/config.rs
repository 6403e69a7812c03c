use serde::Deserialize;
use std::collections::HashMap;

use crate::live_config::keys;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub redis: RedisSettings,
    pub application: ApplicationSettings,
    #[serde(default)]
    pub live_config: LiveConfigSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub kafka: Option<KafkaSettings>,
}

#[derive(Debug, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ApplicationSettings {
    pub port: u16,
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Where the live global defaults come from. With neither `file` nor `url`
/// set, the static `[idempotency]` section is used for the process lifetime.
#[derive(Debug, Deserialize)]
pub struct LiveConfigSettings {
    pub file: Option<String>,
    pub url: Option<String>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_refresh_interval() -> u64 {
    30
}

impl Default for LiveConfigSettings {
    fn default() -> Self {
        Self {
            file: None,
            url: None,
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

/// Static seed for the live snapshot.
#[derive(Debug, Default, Deserialize)]
pub struct IdempotencySettings {
    pub key_prefix: Option<String>,
    pub expire_time: Option<u64>,
    pub wait_and_replay: Option<bool>,
    pub max_retry_count: Option<u32>,
    pub retry_interval_ms: Option<u64>,
    pub max_wait_attempts: Option<u32>,
}

impl IdempotencySettings {
    /// Flattens the section into live configuration keys, skipping unset values.
    pub fn to_snapshot(&self) -> HashMap<String, String> {
        let entries = [
            (keys::KEY_PREFIX, self.key_prefix.clone()),
            (keys::EXPIRE_TIME, self.expire_time.map(|v| v.to_string())),
            (keys::WAIT_AND_REPLAY, self.wait_and_replay.map(|v| v.to_string())),
            (keys::MAX_RETRY_COUNT, self.max_retry_count.map(|v| v.to_string())),
            (keys::RETRY_INTERVAL_MS, self.retry_interval_ms.map(|v| v.to_string())),
            (keys::MAX_WAIT_ATTEMPTS, self.max_wait_attempts.map(|v| v.to_string())),
        ];

        entries
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key.to_string(), v)))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct KafkaSettings {
    pub brokers: String,
    pub topic: String,
    pub dead_letter_topic: Option<String>,
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}
