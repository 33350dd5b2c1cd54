//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by eventforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all eventforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of retired events, labeled by status (processed/skipped/failed).
pub static EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time one event spent in its sequence, in seconds.
pub static EVENT_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Skipped events, labeled by skip reason.
pub static SKIPPED_EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Run headers passed through the barrier.
pub static RUN_HEADERS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Queued plus executing events in the worker pool.
pub static QUEUE_OCCUPANCY: OnceLock<Gauge> = OnceLock::new();

/// Number of workers currently executing an event.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Accumulated processor time, labeled by processor and kind (app/proc).
pub static PROCESSOR_SECONDS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup; later calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let events_total = CounterVec::new(
        Opts::new("eventforge_events_total", "Total number of retired events"),
        &["status"],
    )?;

    let event_duration = Histogram::with_opts(
        HistogramOpts::new(
            "eventforge_event_duration_seconds",
            "Time spent by one event in its processor chain",
        )
        .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )?;

    let skipped_events_total = CounterVec::new(
        Opts::new("eventforge_skipped_events_total", "Skipped events by reason"),
        &["reason"],
    )?;

    let run_headers_total = Counter::new(
        "eventforge_run_headers_total",
        "Run headers processed through the barrier",
    )?;

    let queue_occupancy = Gauge::new(
        "eventforge_queue_occupancy",
        "Queued plus executing events in the worker pool",
    )?;

    let active_workers = Gauge::new(
        "eventforge_active_workers",
        "Number of workers currently executing an event",
    )?;

    let processor_seconds_total = CounterVec::new(
        Opts::new(
            "eventforge_processor_seconds_total",
            "Accumulated processor time in seconds",
        ),
        &["processor", "kind"],
    )?;

    registry.register(Box::new(events_total.clone()))?;
    registry.register(Box::new(event_duration.clone()))?;
    registry.register(Box::new(skipped_events_total.clone()))?;
    registry.register(Box::new(run_headers_total.clone()))?;
    registry.register(Box::new(queue_occupancy.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(processor_seconds_total.clone()))?;

    // Already-set cells mean a previous call won; keep those.
    let _ = REGISTRY.set(registry);
    let _ = EVENTS_TOTAL.set(events_total);
    let _ = EVENT_DURATION.set(event_duration);
    let _ = SKIPPED_EVENTS_TOTAL.set(skipped_events_total);
    let _ = RUN_HEADERS_TOTAL.set(run_headers_total);
    let _ = QUEUE_OCCUPANCY.set(queue_occupancy);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = PROCESSOR_SECONDS_TOTAL.set(processor_seconds_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
