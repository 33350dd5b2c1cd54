//! Metrics module for Prometheus-based monitoring.
//!
//! Counts retired events by status and skip reason, tracks pool occupancy,
//! run headers and per-processor time.
//!
//! # Example
//!
//! ```ignore
//! use eventforge::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run a scheduler ...
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{EventStatus, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, EVENTS_TOTAL, EVENT_DURATION, PROCESSOR_SECONDS_TOTAL, QUEUE_OCCUPANCY,
    REGISTRY, RUN_HEADERS_TOTAL, SKIPPED_EVENTS_TOTAL,
};
