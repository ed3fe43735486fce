//! Observability: structured logging and transport metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsSnapshot, TransportMetrics};

// Span macros for structured logging
pub use logging::{mqtt_span, provisioning_span, session_span};
