use idempotency_guard::api::{create_router, AppState};
use idempotency_guard::config::Settings;
use idempotency_guard::idempotency::IdempotencyGuard;
use idempotency_guard::live_config::{
    FileSnapshotLoader, HttpSnapshotLoader, LiveConfig, LiveConfigRefresher, SnapshotLoader,
};
use idempotency_guard::observability::{init_logging, init_metrics, LogConfig, LogFormat};
use idempotency_guard::store::RedisStateStore;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let settings = Settings::new()?;
    init_logging(&LogConfig::new(
        settings.application.log_level.clone(),
        LogFormat::from(settings.application.log_format.as_str()),
    ));
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    info!("Connecting to Redis at {}...", settings.redis.url);
    let store = RedisStateStore::connect(&settings.redis.url).await?;
    store.ping().await?;
    info!("Redis connection established");

    let live_config = Arc::new(LiveConfig::new(settings.idempotency.to_snapshot()));
    let loader: Option<Arc<dyn SnapshotLoader>> = match (&settings.live_config.url, &settings.live_config.file) {
        (Some(url), _) => Some(Arc::new(HttpSnapshotLoader::new(url.clone(), Duration::from_secs(5))?)),
        (None, Some(file)) => Some(Arc::new(FileSnapshotLoader::new(file.clone()))),
        (None, None) => None,
    };
    if let Some(loader) = loader {
        info!(source = %loader.describe(), "Starting live configuration refresher");
        LiveConfigRefresher::new(
            Arc::clone(&live_config),
            loader,
            Duration::from_secs(settings.live_config.refresh_interval_secs.max(1)),
        )
        .start();
    }

    let guard = Arc::new(IdempotencyGuard::new(
        Arc::new(store.clone()),
        live_config.clone(),
    ));

    #[cfg(feature = "kafka")]
    if let Some(kafka) = &settings.kafka {
        consumer::spawn(kafka, Arc::clone(&guard)).await?;
    }

    let state = AppState::new(guard, live_config)
        .with_metrics(metrics_handle)
        .with_store_probe(store);
    let app = create_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let addr = format!("0.0.0.0:{}", settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(feature = "kafka")]
mod consumer {
    use async_trait::async_trait;
    use idempotency_guard::config::KafkaSettings;
    use idempotency_guard::events::{
        ConsumedMessage, ConsumerConfig, EventConsumer, IdempotentMessageHandler, MessageHandler,
    };
    use idempotency_guard::idempotency::IdempotencyGuard;
    use std::sync::Arc;
    use tracing::{error, info};

    /// Logs order commands; stands in for a real downstream effect.
    struct OrderCommandLogger;

    #[async_trait]
    impl MessageHandler for OrderCommandLogger {
        async fn handle(&self, message: &ConsumedMessage) -> idempotency_guard::Result<()> {
            let command: serde_json::Value = message.deserialize()?;
            info!(offset = message.offset, %command, "Processing order command");
            Ok(())
        }
    }

    pub async fn spawn(
        settings: &KafkaSettings,
        guard: Arc<IdempotencyGuard>,
    ) -> idempotency_guard::Result<()> {
        let mut consumer = EventConsumer::new(ConsumerConfig {
            brokers: settings.brokers.split(',').map(|b| b.trim().to_string()).collect(),
            topics: vec![settings.topic.clone()],
            dead_letter_topic: settings.dead_letter_topic.clone(),
            ..ConsumerConfig::default()
        });
        consumer.connect().await?;

        let handler = Arc::new(IdempotentMessageHandler::new(
            "order_command",
            Arc::new(OrderCommandLogger),
            guard,
        ));
        tokio::spawn(async move {
            if let Err(e) = consumer.start(handler).await {
                error!("Kafka consumer stopped: {}", e);
            }
        });
        Ok(())
    }
}
