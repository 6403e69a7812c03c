pub mod logging;
pub mod metrics;

pub use logging::{init_logging, mask_sensitive, mask_token, LogConfig, LogFormat};
pub use metrics::{get_metrics, init_metrics, LatencyTimer, Metrics, METRICS};
