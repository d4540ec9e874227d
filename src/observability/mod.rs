// Structured logging
pub mod logging;

// Metric names and the Prometheus exporter
pub mod metrics;

// Re-export commonly used types for convenience
pub use logging::{init_logging, RequestId};
pub use metrics::install_prometheus;
