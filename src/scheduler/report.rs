//! End-of-run performance report.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Timing and call totals of one logical processor, summed over all sequences.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorStatistics {
    pub name: String,
    pub clone: bool,
    pub critical: bool,
    /// Number of distinct instances (K for cloned processors, 1 otherwise).
    pub instances: usize,
    pub calls: u64,
    pub app_seconds: f64,
    pub proc_seconds: f64,
}

impl ProcessorStatistics {
    /// Seconds spent waiting for this processor's lock.
    pub fn lock_seconds(&self) -> f64 {
        (self.app_seconds - self.proc_seconds).max(0.0)
    }
}

/// Event and boundary counters kept by a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounters {
    pub pushed: u64,
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub run_headers: u64,
}

/// Wall-clock totals kept by a scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerTimings {
    /// From `init` completing until `end` has drained the workers, before
    /// processors are finalized.
    pub elapsed: Duration,
    /// Time spent running run headers once the workers are idle. The wait
    /// for the drain is not included.
    pub run_header_time: Duration,
    /// Time spent in push calls.
    pub queue_lock_time: Duration,
    /// Time spent in pop calls.
    pub pop_time: Duration,
}

/// Speedup of the parallel run over running the same processor time serially.
pub fn speedup(processor_seconds: f64, parallel_seconds: f64) -> f64 {
    if parallel_seconds <= 0.0 {
        return 0.0;
    }
    processor_seconds / parallel_seconds
}

/// Speedup percentage relative to ideal scaling, defined for more than one worker.
pub fn speedup_efficiency(speedup: f64, concurrency: usize) -> Option<f64> {
    if concurrency <= 1 {
        return None;
    }
    Some(((speedup - 1.0) * 100.0 / (concurrency as f64 - 1.0)).max(0.0))
}

/// Share of application time lost waiting for locks, in percent.
pub fn lock_time_fraction(application_seconds: f64, processor_seconds: f64) -> f64 {
    if application_seconds <= 0.0 {
        return 0.0;
    }
    (application_seconds - processor_seconds) / application_seconds * 100.0
}

/// Threading summary produced by `Scheduler::end`.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerReport {
    pub scheduler: String,
    pub concurrency: usize,
    pub events: EventCounters,
    pub elapsed_seconds: f64,
    pub run_header_seconds: f64,
    /// Elapsed time minus run-header barriers.
    pub parallel_seconds: f64,
    /// Sum of processor time over every call.
    pub processor_seconds: f64,
    /// Sum of application time over every call.
    pub application_seconds: f64,
    pub speedup: f64,
    /// Percent, only for more than one worker.
    pub speedup_efficiency: Option<f64>,
    pub lock_time_fraction: f64,
    pub queue_lock_seconds: f64,
    pub pop_seconds: f64,
    /// Events still outstanding at `end`; anything but zero is a bug.
    pub pending_at_end: usize,
    pub skipped_events: BTreeMap<String, u64>,
    pub processors: Vec<ProcessorStatistics>,
}

impl SchedulerReport {
    pub fn build(
        scheduler: impl Into<String>,
        concurrency: usize,
        events: EventCounters,
        timings: SchedulerTimings,
        processors: Vec<ProcessorStatistics>,
        skipped_events: BTreeMap<String, u64>,
        pending_at_end: usize,
    ) -> Self {
        let elapsed_seconds = timings.elapsed.as_secs_f64();
        let run_header_seconds = timings.run_header_time.as_secs_f64();
        let parallel_seconds = (elapsed_seconds - run_header_seconds).max(0.0);
        let processor_seconds: f64 = processors.iter().map(|p| p.proc_seconds).sum();
        let application_seconds: f64 = processors.iter().map(|p| p.app_seconds).sum();
        let speedup = speedup(processor_seconds, parallel_seconds);

        Self {
            scheduler: scheduler.into(),
            concurrency,
            events,
            elapsed_seconds,
            run_header_seconds,
            parallel_seconds,
            processor_seconds,
            application_seconds,
            speedup,
            speedup_efficiency: speedup_efficiency(speedup, concurrency),
            lock_time_fraction: lock_time_fraction(application_seconds, processor_seconds),
            queue_lock_seconds: timings.queue_lock_time.as_secs_f64(),
            pop_seconds: timings.pop_time.as_secs_f64(),
            pending_at_end,
            skipped_events,
            processors,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for SchedulerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------------------ Threading summary ------------------")?;
        writeln!(f, " Scheduler:                  {}", self.scheduler)?;
        writeln!(f, " Number of threads:          {}", self.concurrency)?;
        writeln!(
            f,
            " Events:                     {} pushed, {} processed, {} skipped, {} failed",
            self.events.pushed, self.events.processed, self.events.skipped, self.events.failed
        )?;
        writeln!(f, " Run headers:                {}", self.events.run_headers)?;
        writeln!(
            f,
            " Speedup (serial/parallel):  {:.3}s / {:.3}s = {:.2}",
            self.processor_seconds, self.parallel_seconds, self.speedup
        )?;
        if let Some(efficiency) = self.speedup_efficiency {
            writeln!(f, " Speedup percentage:         {:.1} %", efficiency)?;
        }
        writeln!(f, " Run header time:            {:.3}s", self.run_header_seconds)?;
        writeln!(f, " Queue lock time:            {:.3}s", self.queue_lock_seconds)?;
        writeln!(f, " Pop time:                   {:.3}s", self.pop_seconds)?;
        writeln!(f, " Lock time fraction:         {:.2} %", self.lock_time_fraction)?;

        if !self.skipped_events.is_empty() {
            writeln!(f, " Skipped events:")?;
            for (reason, count) in &self.skipped_events {
                writeln!(f, "   {:<40} {}", reason, count)?;
            }
        }

        if !self.processors.is_empty() {
            writeln!(
                f,
                " {:<24} {:>6} {:>6} {:>9} {:>10} {:>10} {:>10}",
                "Processor", "clone", "crit", "instances", "calls", "proc [s]", "lock [s]"
            )?;
            for p in &self.processors {
                writeln!(
                    f,
                    " {:<24} {:>6} {:>6} {:>9} {:>10} {:>10.3} {:>10.3}",
                    p.name,
                    p.clone,
                    p.critical,
                    p.instances,
                    p.calls,
                    p.proc_seconds,
                    p.lock_seconds()
                )?;
            }
        }

        if self.pending_at_end > 0 {
            writeln!(f, " WARNING: {} events still pending at end", self.pending_at_end)?;
        }
        write!(f, "-------------------------------------------------------")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(name: &str, app: f64, proc: f64) -> ProcessorStatistics {
        ProcessorStatistics {
            name: name.to_string(),
            clone: true,
            critical: false,
            instances: 4,
            calls: 10,
            app_seconds: app,
            proc_seconds: proc,
        }
    }

    #[test]
    fn test_speedup_formulas() {
        assert!((speedup(8.0, 2.0) - 4.0).abs() < 1e-9);
        assert_eq!(speedup(1.0, 0.0), 0.0);

        assert_eq!(speedup_efficiency(4.0, 1), None);
        let efficiency = speedup_efficiency(4.0, 4).unwrap();
        assert!((efficiency - 100.0).abs() < 1e-9);
        // Slower than serial clamps to zero.
        assert_eq!(speedup_efficiency(0.5, 4), Some(0.0));

        assert!((lock_time_fraction(10.0, 9.0) - 10.0).abs() < 1e-9);
        assert_eq!(lock_time_fraction(0.0, 0.0), 0.0);
    }

    #[test]
    fn test_build_report() {
        let timings = SchedulerTimings {
            elapsed: Duration::from_secs(3),
            run_header_time: Duration::from_secs(1),
            ..Default::default()
        };
        let mut skipped = BTreeMap::new();
        skipped.insert("no tracks".to_string(), 2);
        let report = SchedulerReport::build(
            "parallel",
            4,
            EventCounters {
                pushed: 10,
                processed: 8,
                skipped: 2,
                ..Default::default()
            },
            timings,
            vec![stats("A", 5.0, 4.0), stats("B", 3.0, 2.0)],
            skipped,
            0,
        );

        assert!((report.parallel_seconds - 2.0).abs() < 1e-9);
        assert!((report.processor_seconds - 6.0).abs() < 1e-9);
        assert!((report.application_seconds - 8.0).abs() < 1e-9);
        assert!((report.speedup - 3.0).abs() < 1e-9);
        assert!((report.speedup_efficiency.unwrap() - 200.0 / 3.0).abs() < 1e-9);
        assert!((report.lock_time_fraction - 25.0).abs() < 1e-9);

        let text = report.to_string();
        assert!(text.contains("Number of threads:          4"));
        assert!(text.contains("Speedup percentage"));
        assert!(text.contains("no tracks"));
        assert!(!text.contains("WARNING"));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["concurrency"], 4);
        assert_eq!(json["events"]["skipped"], 2);
    }

    #[test]
    fn test_single_thread_report_has_no_efficiency() {
        let report = SchedulerReport::build(
            "simple",
            1,
            EventCounters::default(),
            SchedulerTimings::default(),
            Vec::new(),
            BTreeMap::new(),
            3,
        );
        assert_eq!(report.speedup_efficiency, None);
        let text = report.to_string();
        assert!(!text.contains("Speedup percentage"));
        assert!(text.contains("3 events still pending"));
    }
}
