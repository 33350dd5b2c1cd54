//! Metric recording helpers for scheduler operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent
//! labels. Every method is a no-op until `init_metrics()` has run, so the
//! schedulers record unconditionally.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, EVENTS_TOTAL, EVENT_DURATION, PROCESSOR_SECONDS_TOTAL, QUEUE_OCCUPANCY,
    RUN_HEADERS_TOTAL, SKIPPED_EVENTS_TOTAL,
};
use crate::scheduler::ProcessorStatistics;

/// Final status of a retired event, used as the `status` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Processed,
    Skipped,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a retired event and the time it spent in its sequence.
    pub fn record_event(&self, status: EventStatus, duration: Duration) {
        if let Some(events_total) = EVENTS_TOTAL.get() {
            events_total.with_label_values(&[status.as_str()]).inc();
        }

        if let Some(event_duration) = EVENT_DURATION.get() {
            event_duration.observe(duration.as_secs_f64());
        }

        tracing::trace!(
            status = status.as_str(),
            duration_secs = duration.as_secs_f64(),
            "Recorded event metric"
        );
    }

    /// Record a skipped event under its reason.
    pub fn record_skip(&self, reason: &str) {
        if let Some(skipped) = SKIPPED_EVENTS_TOTAL.get() {
            skipped.with_label_values(&[reason]).inc();
        }
    }

    pub fn record_run_header(&self) {
        if let Some(run_headers) = RUN_HEADERS_TOTAL.get() {
            run_headers.inc();
        }
    }

    /// Update the pool occupancy and busy-worker gauges.
    pub fn update_pool(&self, occupancy: usize, running: usize) {
        if let Some(gauge) = QUEUE_OCCUPANCY.get() {
            gauge.set(occupancy as f64);
        }
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.set(running as f64);
        }
    }

    /// Add the end-of-run processor totals.
    pub fn record_processor_statistics(&self, statistics: &[ProcessorStatistics]) {
        let Some(counter) = PROCESSOR_SECONDS_TOTAL.get() else {
            return;
        };
        for stats in statistics {
            counter
                .with_label_values(&[stats.name.as_str(), "app"])
                .inc_by(stats.app_seconds.max(0.0));
            counter
                .with_label_values(&[stats.name.as_str(), "proc"])
                .inc_by(stats.proc_seconds.max(0.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_event_status_labels() {
        assert_eq!(EventStatus::Processed.as_str(), "processed");
        assert_eq!(EventStatus::Skipped.as_str(), "skipped");
        assert_eq!(EventStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn test_record_event() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_event(EventStatus::Processed, Duration::from_micros(300));
        collector.record_event(EventStatus::Failed, Duration::from_millis(2));
        collector.record_skip("no tracks");

        let text = export_metrics();
        assert!(text.contains("eventforge_events_total"));
        assert!(text.contains("no tracks"));
    }

    #[test]
    fn test_update_pool_and_run_headers() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_pool(6, 3);
        collector.record_run_header();
        if let Some(gauge) = QUEUE_OCCUPANCY.get() {
            // Tests in this module may run concurrently; just check it was set once.
            assert!(gauge.get() >= 0.0);
        }
    }

    #[test]
    fn test_record_processor_statistics() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();
        collector.record_processor_statistics(&[ProcessorStatistics {
            name: "Crunch".to_string(),
            clone: true,
            critical: false,
            instances: 2,
            calls: 4,
            app_seconds: 0.5,
            proc_seconds: 0.4,
        }]);

        let text = export_metrics();
        assert!(text.contains("eventforge_processor_seconds_total"));
        assert!(text.contains("processor=\"Crunch\""));
    }
}
