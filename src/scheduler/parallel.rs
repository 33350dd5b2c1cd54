//! Parallel scheduler: K worker threads, each pinned to one sequence.
//!
//! Events go into a bounded pool queue (`queue_factor × K`). Results are
//! collected by polling the outstanding handles. Run headers are handled
//! behind a stop-the-world barrier: admission closes, the pool drains, the
//! header runs single-threaded over the distinct processors, and admission
//! reopens.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::app::Application;
use crate::config::Concurrency;
use crate::error::{PoolError, ProcessorError, SchedulerError};
use crate::event::{Event, RunHeader};
use crate::metrics::{EventStatus, MetricsCollector};

use super::report::{EventCounters, SchedulerReport, SchedulerTimings};
use super::sequence::{EventResult, SequenceOutcome, SequenceWorker};
use super::super_sequence::SuperSequence;
use super::worker_pool::{PoolStats, PushPolicy, TaskHandle, WorkerPool, WorkerPoolConfig};
use super::{build_super_sequence, Scheduler};

/// Lifecycle of a [`ParallelScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Unconfigured,
    Running,
    Draining,
    Terminated,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconfigured => "unconfigured",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// Outstanding event: its uid and the handle to its result.
type Pending = (u64, TaskHandle<EventResult>);

pub struct ParallelScheduler {
    state: SchedulerState,
    concurrency: usize,
    hardware_threads: Option<usize>,
    poll_interval: Duration,
    super_sequence: Option<SuperSequence>,
    pool: Option<WorkerPool<SequenceWorker>>,
    pending: Vec<Pending>,
    counters: EventCounters,
    timings: SchedulerTimings,
    started_at: Option<Instant>,
    metrics: MetricsCollector,
}

impl Default for ParallelScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelScheduler {
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Unconfigured,
            concurrency: 0,
            hardware_threads: None,
            poll_interval: Duration::from_micros(10),
            super_sequence: None,
            pool: None,
            pending: Vec::new(),
            counters: EventCounters::default(),
            timings: SchedulerTimings::default(),
            started_at: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Overrides the detected hardware thread count used to resolve "auto".
    pub fn with_hardware_threads(mut self, threads: usize) -> Self {
        self.hardware_threads = Some(threads);
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Resolved number of workers; zero before `init`.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn counters(&self) -> EventCounters {
        self.counters
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(WorkerPool::stats)
    }

    fn ensure_state(&self, expected: SchedulerState, operation: &'static str) -> Result<(), SchedulerError> {
        if self.state != expected {
            return Err(SchedulerError::InvalidState {
                operation,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn resolve_concurrency(&self, app: &Application) -> Result<usize, SchedulerError> {
        let hardware = self.hardware_threads.unwrap_or_else(Concurrency::hardware_threads);
        let concurrency = app.concurrency().resolve_with(hardware)?;

        if let Concurrency::Fixed(n) = app.concurrency() {
            if n != hardware {
                warn!(
                    concurrency = n,
                    hardware_threads = hardware,
                    "Configured concurrency differs from the hardware thread count"
                );
            }
        }
        if concurrency == 1 {
            warn!("Running the parallel scheduler with a single thread, consider the simple scheduler");
        }
        Ok(concurrency)
    }

    fn record_pool_gauges(&self) {
        if let Some(pool) = &self.pool {
            let stats = pool.stats();
            self.metrics.update_pool(stats.queued + stats.running, stats.running);
        }
    }

    /// Retires one finished event. Failures are returned, skipped events are
    /// counted but not output.
    fn retire(
        &mut self,
        uid: u64,
        result: Result<EventResult, PoolError>,
        out: &mut Vec<Arc<Event>>,
    ) -> Result<(), SchedulerError> {
        let result = match result {
            Ok(result) => result,
            Err(PoolError::TaskPanicked(message)) => {
                self.counters.failed += 1;
                self.metrics.record_event(EventStatus::Failed, Duration::ZERO);
                error!(uid, panic = %message, "Event task panicked");
                return Err(SchedulerError::EventFailed {
                    uid,
                    source: ProcessorError::Panicked {
                        processor: "sequence".to_string(),
                        message,
                    },
                });
            }
            Err(err) => {
                self.counters.failed += 1;
                self.metrics.record_event(EventStatus::Failed, Duration::ZERO);
                error!(uid, error = %err, "Event result lost");
                return Err(err.into());
            }
        };

        match result.outcome {
            Ok(SequenceOutcome::Processed) => {
                self.counters.processed += 1;
                self.metrics.record_event(EventStatus::Processed, result.duration);
                debug!(uid, "Event finished");
                out.push(result.event);
                Ok(())
            }
            Ok(SequenceOutcome::Skipped(reason)) => {
                self.counters.skipped += 1;
                self.metrics.record_event(EventStatus::Skipped, result.duration);
                self.metrics.record_skip(&reason);
                debug!(uid, reason = %reason, "Event skipped");
                Ok(())
            }
            Err(source) => {
                self.counters.failed += 1;
                self.metrics.record_event(EventStatus::Failed, result.duration);
                error!(uid, error = %source, "Event failed");
                Err(SchedulerError::EventFailed { uid, source })
            }
        }
    }

    fn collect_finished(&mut self, out: &mut Vec<Arc<Event>>) -> Result<(), SchedulerError> {
        let mut index = 0;
        while index < self.pending.len() {
            let Some(result) = self.pending[index].1.try_take() else {
                index += 1;
                continue;
            };
            // Removed before retiring so a failure is reported exactly once.
            let (uid, _) = self.pending.remove(index);
            self.retire(uid, result, out)?;
        }
        Ok(())
    }

    /// Waits until the pool has neither queued nor executing events.
    fn wait_idle(&self) {
        if let Some(pool) = &self.pool {
            while pool.active() {
                thread::sleep(self.poll_interval);
            }
        }
    }

    /// Retrieves every result still outstanding at `end`. Failures are
    /// logged rather than returned.
    fn drain(&mut self) {
        self.wait_idle();
        let mut leftover = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            let Some(result) = self.pending[index].1.try_take() else {
                index += 1;
                continue;
            };
            let (uid, _) = self.pending.remove(index);
            if let Err(err) = self.retire(uid, result, &mut leftover) {
                error!(uid, error = %err, "Event failed while draining");
            }
        }
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "Finished events were never popped");
        }
    }
}

impl Scheduler for ParallelScheduler {
    fn init(&mut self, app: &Application) -> Result<(), SchedulerError> {
        self.ensure_state(SchedulerState::Unconfigured, "init")?;

        let concurrency = self.resolve_concurrency(app)?;
        info!(concurrency, "Starting parallel scheduler");

        let mut super_sequence = build_super_sequence(app, concurrency)?;

        let config = app.scheduler_config();
        let pool_config = WorkerPoolConfig::new(config.queue_factor.saturating_mul(concurrency))
            .with_thread_name_prefix(config.thread_name_prefix.clone());
        let mut pool = WorkerPool::new(pool_config);
        for sequence in super_sequence.take_sequences()? {
            pool.add_worker(SequenceWorker::new(sequence))?;
        }
        pool.start()?;
        pool.set_accept_push(true);

        debug!(
            unique_processors = super_sequence.unique_items().len(),
            max_queue_size = pool.max_queue_size(),
            "Parallel scheduler ready"
        );

        self.concurrency = concurrency;
        self.poll_interval = config.barrier_poll_interval();
        self.super_sequence = Some(super_sequence);
        self.pool = Some(pool);
        self.state = SchedulerState::Running;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn push_event(&mut self, event: Arc<Event>) -> Result<(), SchedulerError> {
        self.ensure_state(SchedulerState::Running, "push event")?;
        let Some(pool) = self.pool.as_ref() else {
            return Err(PoolError::NotRunning.into());
        };

        let uid = event.uid();
        let start = Instant::now();
        let pushed = pool.push(PushPolicy::ThrowIfFull, event);
        self.timings.queue_lock_time += start.elapsed();

        let handle = pushed?.ok_or(PoolError::NotAccepting)?;
        self.pending.push((uid, handle));
        self.counters.pushed += 1;
        self.record_pool_gauges();
        Ok(())
    }

    fn pop_finished_events(&mut self, out: &mut Vec<Arc<Event>>) -> Result<(), SchedulerError> {
        self.ensure_state(SchedulerState::Running, "pop finished events")?;
        let start = Instant::now();
        let result = self.collect_finished(out);
        self.timings.pop_time += start.elapsed();
        result
    }

    fn process_run_header(&mut self, header: &RunHeader) -> Result<(), SchedulerError> {
        self.ensure_state(SchedulerState::Running, "process run header")?;

        if let Some(pool) = &self.pool {
            pool.set_accept_push(false);
        }
        debug!(run = header.run_number(), "Run header barrier: waiting for workers");
        self.wait_idle();

        // Only the single-threaded header work is timed; the drain above is
        // parallel time.
        let start = Instant::now();

        let result = match &self.super_sequence {
            Some(super_sequence) => super_sequence
                .modify_run_header(header)
                .and_then(|()| super_sequence.process_run_header(header)),
            None => Ok(()),
        };
        self.timings.run_header_time += start.elapsed();

        if let Some(pool) = &self.pool {
            pool.set_accept_push(true);
        }
        self.counters.run_headers += 1;
        self.metrics.record_run_header();
        debug!(run = header.run_number(), "Run header barrier: released");
        result
    }

    fn end(&mut self) -> Result<SchedulerReport, SchedulerError> {
        self.ensure_state(SchedulerState::Running, "end")?;
        self.state = SchedulerState::Draining;

        if let Some(pool) = &self.pool {
            pool.set_accept_push(false);
        }
        self.drain();

        let mut super_sequence = self.super_sequence.take().ok_or_else(|| SchedulerError::InvalidState {
            operation: "end",
            state: "missing sequences".to_string(),
        })?;
        if let Some(mut pool) = self.pool.take() {
            let workers = pool.stop(true)?;
            let sequences = workers.into_iter().map(SequenceWorker::into_sequence).collect();
            if let Err(err) = super_sequence.restore_sequences(sequences) {
                error!(error = %err, "Could not recover every sequence");
            }
        }
        // Events finishing during the drain still count as parallel time.
        self.timings.elapsed = self.started_at.map(|s| s.elapsed()).unwrap_or_default();

        let pending_at_end = self.pending.len();
        if pending_at_end > 0 {
            error!(pending = pending_at_end, "Events still pending at end of processing");
            self.pending.clear();
        }

        let finalized = super_sequence.end();

        let processors = super_sequence.processor_statistics();
        self.metrics.record_processor_statistics(&processors);
        let report = SchedulerReport::build(
            "parallel",
            self.concurrency,
            self.counters,
            self.timings,
            processors,
            super_sequence.skipped_events(),
            pending_at_end,
        );
        info!(
            threads = report.concurrency,
            speedup = report.speedup,
            efficiency = report.speedup_efficiency.unwrap_or(0.0),
            lock_time_fraction = report.lock_time_fraction,
            "Threading summary"
        );

        self.state = SchedulerState::Terminated;
        finalized?;
        Ok(report)
    }

    fn free_slots(&self) -> usize {
        match (&self.pool, self.state) {
            (Some(pool), SchedulerState::Running) => pool.free_slots(),
            _ => 0,
        }
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ProcessorParameters};
    use crate::error::ConfigError;

    fn app(concurrency: usize) -> Application {
        let config = AppConfig::new()
            .with_concurrency(Concurrency::Fixed(concurrency))
            .with_processor(
                ProcessorParameters::new("Crunch", "CpuCrunch").with_parameter("CrunchTime", 50),
            )
            .with_processor(ProcessorParameters::new("Status", "Statusmonitor"));
        Application::with_builtins(config).unwrap()
    }

    fn pop_all(scheduler: &mut ParallelScheduler, expected: usize) -> Vec<Arc<Event>> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut out = Vec::new();
        while out.len() < expected {
            assert!(Instant::now() < deadline, "events not finished in time");
            scheduler.pop_finished_events(&mut out).unwrap();
            thread::sleep(Duration::from_micros(100));
        }
        out
    }

    #[test]
    fn test_scheduler_state_display() {
        assert_eq!(SchedulerState::Unconfigured.to_string(), "unconfigured");
        assert_eq!(SchedulerState::Terminated.to_string(), "terminated");
    }

    #[test]
    fn test_lifecycle() {
        let mut scheduler = ParallelScheduler::new();
        assert_eq!(scheduler.free_slots(), 0);
        assert!(matches!(
            scheduler.push_event(Arc::new(Event::new(1, 0, 1))),
            Err(SchedulerError::InvalidState { .. })
        ));

        scheduler.init(&app(2)).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert_eq!(scheduler.concurrency(), 2);
        assert_eq!(scheduler.free_slots(), 4);
        assert!(scheduler.init(&app(2)).is_err());

        for uid in 0..4 {
            scheduler.push_event(Arc::new(Event::new(uid, 0, uid as i32))).unwrap();
        }
        let out = pop_all(&mut scheduler, 4);
        assert_eq!(out.len(), 4);
        assert_eq!(scheduler.pending(), 0);

        let report = scheduler.end().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Terminated);
        assert_eq!(report.concurrency, 2);
        assert_eq!(report.events.pushed, 4);
        assert_eq!(report.events.processed, 4);
        assert_eq!(report.pending_at_end, 0);
        assert!(scheduler.end().is_err());
    }

    #[test]
    fn test_push_throws_when_full() {
        let config = AppConfig::new()
            .with_concurrency(Concurrency::Fixed(1))
            .with_processor(
                ProcessorParameters::new("Crunch", "CpuCrunch").with_parameter("CrunchTime", 20_000),
            );
        let app = Application::with_builtins(config).unwrap();
        let mut scheduler = ParallelScheduler::new();
        scheduler.init(&app).unwrap();

        scheduler.push_event(Arc::new(Event::new(1, 0, 1))).unwrap();
        scheduler.push_event(Arc::new(Event::new(2, 0, 2))).unwrap();
        assert_eq!(scheduler.free_slots(), 0);
        let err = scheduler.push_event(Arc::new(Event::new(3, 0, 3))).unwrap_err();
        assert!(matches!(err, SchedulerError::Pool(PoolError::QueueFull { capacity: 2 })));

        let report = scheduler.end().unwrap();
        assert_eq!(report.events.pushed, 2);
    }

    #[test]
    fn test_end_drains_unpopped_events() {
        let mut scheduler = ParallelScheduler::new();
        scheduler.init(&app(2)).unwrap();
        for uid in 0..3 {
            scheduler.push_event(Arc::new(Event::new(uid, 0, uid as i32))).unwrap();
        }
        let report = scheduler.end().unwrap();
        assert_eq!(report.events.processed, 3);
        assert_eq!(report.pending_at_end, 0);
    }

    #[test]
    fn test_auto_concurrency_uses_hardware_threads() {
        let config = AppConfig::new()
            .with_concurrency(Concurrency::Auto)
            .with_processor(ProcessorParameters::new("Crunch", "CpuCrunch"));
        let app = Application::with_builtins(config).unwrap();
        let mut scheduler = ParallelScheduler::new().with_hardware_threads(3);
        scheduler.init(&app).unwrap();
        assert_eq!(scheduler.concurrency(), 3);
        assert_eq!(scheduler.pool_stats().unwrap().num_workers, 3);
        scheduler.end().unwrap();
    }

    #[test]
    fn test_undefined_processor() {
        let config = AppConfig::new()
            .with_concurrency(Concurrency::Fixed(2))
            .with_execute(vec!["Ghost".to_string()]);
        let app = Application::with_builtins(config).unwrap();
        let err = ParallelScheduler::new().init(&app).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Config(ConfigError::UndefinedProcessor(name)) if name == "Ghost"
        ));
    }

    #[test]
    fn test_run_header_counts() {
        let mut scheduler = ParallelScheduler::new();
        scheduler.init(&app(2)).unwrap();
        scheduler.push_event(Arc::new(Event::new(1, 0, 1))).unwrap();
        scheduler.process_run_header(&RunHeader::new(1)).unwrap();
        // The barrier drained the pool, so the result is ready.
        let mut out = Vec::new();
        scheduler.pop_finished_events(&mut out).unwrap();
        assert_eq!(out.len(), 1);

        let report = scheduler.end().unwrap();
        assert_eq!(report.events.run_headers, 1);
        assert!(report.run_header_seconds <= report.elapsed_seconds);
    }

    fn slow_app() -> Application {
        let config = AppConfig::new()
            .with_concurrency(Concurrency::Fixed(1))
            .with_processor(
                ProcessorParameters::new("Crunch", "CpuCrunch").with_parameter("CrunchTime", 50_000),
            );
        Application::with_builtins(config).unwrap()
    }

    #[test]
    fn test_run_header_time_excludes_drain_wait() {
        let mut scheduler = ParallelScheduler::new();
        scheduler.init(&slow_app()).unwrap();
        scheduler.push_event(Arc::new(Event::new(1, 0, 1))).unwrap();
        scheduler.push_event(Arc::new(Event::new(2, 0, 2))).unwrap();
        scheduler.process_run_header(&RunHeader::new(1)).unwrap();
        let report = scheduler.end().unwrap();

        assert_eq!(report.events.processed, 2);
        assert!(report.processor_seconds >= 0.09);
        assert!(report.run_header_seconds < 0.05);
        assert!(report.parallel_seconds >= report.processor_seconds);
        assert!(report.speedup <= 1.05, "speedup {}", report.speedup);
    }

    #[test]
    fn test_elapsed_covers_events_finished_during_end() {
        let mut scheduler = ParallelScheduler::new();
        scheduler.init(&slow_app()).unwrap();
        scheduler.push_event(Arc::new(Event::new(1, 0, 1))).unwrap();
        scheduler.push_event(Arc::new(Event::new(2, 0, 2))).unwrap();
        let report = scheduler.end().unwrap();

        assert_eq!(report.events.processed, 2);
        assert!(report.elapsed_seconds >= report.processor_seconds);
        assert!(report.speedup <= 1.05, "speedup {}", report.speedup);
    }
}
