//! Live (hot-reloadable) global defaults.
//!
//! The guard pins one [`ConfigSource::generation`] per invocation and reads
//! every global default from it. [`LiveConfig`] holds a process-wide snapshot
//! that a [`LiveConfigRefresher`] replaces wholesale on each tick, so a pinned
//! generation always holds one complete set of values.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::Result;
use crate::observability::get_metrics;

/// Keys of the dynamic configuration.
pub mod keys {
    pub const KEY_PREFIX: &str = "idempotency.key_prefix";
    pub const EXPIRE_TIME: &str = "idempotency.expire_time";
    pub const WAIT_AND_REPLAY: &str = "idempotency.wait_and_replay";
    pub const MAX_RETRY_COUNT: &str = "idempotency.max_retry_count";
    pub const RETRY_INTERVAL_MS: &str = "idempotency.retry_interval_ms";
    pub const MAX_WAIT_ATTEMPTS: &str = "idempotency.max_wait_attempts";

    pub const ALL: [&str; 6] = [
        KEY_PREFIX,
        EXPIRE_TIME,
        WAIT_AND_REPLAY,
        MAX_RETRY_COUNT,
        RETRY_INTERVAL_MS,
        MAX_WAIT_ATTEMPTS,
    ];
}

pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// A view that does not change while held. The guard resolves each
    /// invocation against one generation.
    fn generation(&self) -> Arc<dyn ConfigSource>;
}

/// Fixed values, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    values: Arc<HashMap<String, String>>,
}

impl StaticConfigSource {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self {
            values: Arc::new(values),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl ConfigSource for StaticConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn generation(&self) -> Arc<dyn ConfigSource> {
        Arc::new(self.clone())
    }
}

/// One generation of live values.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub values: HashMap<String, String>,
    pub version: u64,
    pub refreshed_at: DateTime<Utc>,
}

impl ConfigSource for ConfigSnapshot {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn generation(&self) -> Arc<dyn ConfigSource> {
        Arc::new(self.clone())
    }
}

/// Process-wide live configuration with whole-snapshot replacement.
#[derive(Debug)]
pub struct LiveConfig {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl LiveConfig {
    pub fn new(initial: HashMap<String, String>) -> Self {
        Self {
            current: RwLock::new(Arc::new(ConfigSnapshot {
                values: initial,
                version: 0,
                refreshed_at: Utc::now(),
            })),
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Installs a new generation and returns its version.
    pub fn replace(&self, values: HashMap<String, String>) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let version = guard.version + 1;
        *guard = Arc::new(ConfigSnapshot {
            values,
            version,
            refreshed_at: Utc::now(),
        });
        version
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl ConfigSource for LiveConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.snapshot().get(key)
    }

    fn generation(&self) -> Arc<dyn ConfigSource> {
        self.snapshot()
    }
}

/// Produces a complete set of live values from an external source.
#[async_trait]
pub trait SnapshotLoader: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, String>>;

    fn describe(&self) -> String;
}

/// Re-reads a configuration file plus `APP__IDEMPOTENCY__*` environment overrides.
#[derive(Debug, Clone)]
pub struct FileSnapshotLoader {
    path: String,
}

impl FileSnapshotLoader {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    fn load_blocking(path: &str) -> Result<HashMap<String, String>> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(keys::ALL
            .iter()
            .filter_map(|key| config.get_string(key).ok().map(|v| (key.to_string(), v)))
            .collect())
    }
}

#[async_trait]
impl SnapshotLoader for FileSnapshotLoader {
    async fn load(&self) -> Result<HashMap<String, String>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::load_blocking(&path))
            .await
            .context("live configuration file loader panicked")?
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path)
    }
}

/// Fetches a flat JSON object of live values from a configuration service.
#[derive(Debug, Clone)]
pub struct HttpSnapshotLoader {
    client: reqwest::Client,
    url: String,
}

impl HttpSnapshotLoader {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build configuration service client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

/// Keeps the known keys; scalars are rendered as text, anything else is ignored.
pub fn flatten_known(values: HashMap<String, serde_json::Value>) -> HashMap<String, String> {
    values
        .into_iter()
        .filter(|(key, _)| keys::ALL.contains(&key.as_str()))
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(s) => Some((key, s)),
            serde_json::Value::Number(n) => Some((key, n.to_string())),
            serde_json::Value::Bool(b) => Some((key, b.to_string())),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl SnapshotLoader for HttpSnapshotLoader {
    async fn load(&self) -> Result<HashMap<String, String>> {
        let values: HashMap<String, serde_json::Value> = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .context("configuration service request failed")?
            .json()
            .await
            .context("configuration service returned invalid JSON")?;

        Ok(flatten_known(values))
    }

    fn describe(&self) -> String {
        format!("http:{}", self.url)
    }
}

/// Background job that periodically refreshes a [`LiveConfig`].
pub struct LiveConfigRefresher {
    config: Arc<LiveConfig>,
    loader: Arc<dyn SnapshotLoader>,
    interval: Duration,
}

impl LiveConfigRefresher {
    pub fn new(config: Arc<LiveConfig>, loader: Arc<dyn SnapshotLoader>, interval: Duration) -> Self {
        Self {
            config,
            loader,
            interval,
        }
    }

    /// Loads once and installs the result. A failed load keeps the previous snapshot.
    pub async fn run_once(&self) -> Result<u64> {
        match self.loader.load().await {
            Ok(values) => {
                let version = self.config.replace(values);
                get_metrics().record_config_refresh(true);
                Ok(version)
            }
            Err(e) => {
                get_metrics().record_config_refresh(false);
                Err(e)
            }
        }
    }

    /// Starts the refresh loop in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(version) => {
                        tracing::debug!(
                            source = %self.loader.describe(),
                            version,
                            "Refreshed live idempotency configuration"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            source = %self.loader.describe(),
                            error = %e,
                            "Failed to refresh live idempotency configuration, keeping previous snapshot"
                        );
                    }
                }
            }
        })
    }
}
