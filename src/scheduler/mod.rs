//! Event scheduling across a fixed pool of worker threads.
//!
//! - **WorkerPool**: bounded queue feeding one thread per stateful worker
//! - **Sequence**: one worker's ordered processor chain with timing and skip counters
//! - **SuperSequence**: the K sequences plus de-duplication of shared processors
//! - **ParallelScheduler**: pushes events into the pool, retrieves finished
//!   events, and runs run headers behind a stop-the-world barrier
//! - **SimpleScheduler**: same contract, processes events in-line
//!
//! # Architecture
//!
//! ```text
//!                 push_event          pop_finished_events
//!                     │                       ▲
//!              ┌──────▼───────────────────────┴──────┐
//!              │          ParallelScheduler          │
//!              └──────┬──────────────────────────────┘
//!                     │  bounded queue (2 × K)
//!         ┌───────────┼───────────┬───────────┐
//!         ▼           ▼           ▼           ▼
//!    ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐
//!    │ Worker 0│ │ Worker 1│ │   ...   │ │Worker K-1│
//!    │ Seq 0   │ │ Seq 1   │ │         │ │ Seq K-1 │
//!    └─────────┘ └─────────┘ └─────────┘ └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use eventforge::{Application, AppConfig, Event, ParallelScheduler, Scheduler};
//! use std::sync::Arc;
//!
//! let app = Application::with_builtins(AppConfig::from_file("steering.yaml")?)?;
//! let mut scheduler = ParallelScheduler::new();
//! scheduler.init(&app)?;
//!
//! let mut finished = Vec::new();
//! for uid in 0..100 {
//!     while scheduler.free_slots() == 0 {
//!         scheduler.pop_finished_events(&mut finished)?;
//!     }
//!     scheduler.push_event(Arc::new(Event::new(uid, 0, uid as i32)))?;
//! }
//! let report = scheduler.end()?;
//! println!("{}", report);
//! ```

pub mod parallel;
pub mod report;
pub mod sequence;
pub mod simple;
pub mod super_sequence;
pub mod worker_pool;

pub use parallel::{ParallelScheduler, SchedulerState};
pub use report::{EventCounters, ProcessorStatistics, SchedulerReport, SchedulerTimings};
pub use sequence::{
    ClockMeasure, ClockPair, EventResult, Sequence, SequenceItem, SequenceOutcome, SequenceWorker,
};
pub use simple::SimpleScheduler;
pub use super_sequence::SuperSequence;
pub use worker_pool::{PoolStats, PushPolicy, TaskHandle, Worker, WorkerPool, WorkerPoolConfig};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::error;

use crate::app::Application;
use crate::error::{ConfigError, SchedulerError};
use crate::event::{Event, RunHeader};

/// Contract shared by the parallel and the serial scheduler.
///
/// The calls are made from a single driving thread; they are not meant to
/// be invoked concurrently with each other.
pub trait Scheduler {
    /// Resolves concurrency, builds the processor chains and initializes
    /// every distinct processor once.
    fn init(&mut self, app: &Application) -> Result<(), SchedulerError>;

    /// Submits one event. Fails instead of blocking when no slot is free.
    fn push_event(&mut self, event: Arc<Event>) -> Result<(), SchedulerError>;

    /// Moves finished events into `out` without blocking.
    ///
    /// A processing failure is returned by the call that retrieves it.
    fn pop_finished_events(&mut self, out: &mut Vec<Arc<Event>>) -> Result<(), SchedulerError>;

    /// Runs a run header through every distinct processor once, with no
    /// event in flight.
    fn process_run_header(&mut self, header: &RunHeader) -> Result<(), SchedulerError>;

    /// Drains, finalizes every distinct processor once and reports timings.
    fn end(&mut self) -> Result<SchedulerReport, SchedulerError>;

    /// Number of events that can be pushed right now.
    fn free_slots(&self) -> usize;

    /// Number of pushed events not yet retrieved.
    fn pending(&self) -> usize;
}

/// Rejects an empty active list and duplicated names.
///
/// Every duplicate is logged with its instance count before failing.
pub(crate) fn check_active_processors(active: &[String]) -> Result<(), ConfigError> {
    if active.is_empty() {
        return Err(ConfigError::EmptyProcessorList);
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for name in active {
        *counts.entry(name.as_str()).or_insert(0) += 1;
    }
    let duplicates: Vec<String> = counts
        .iter()
        .filter(|&(_, &count)| count > 1)
        .map(|(name, count)| {
            error!(processor = %name, instances = count, "Duplicated active processor");
            name.to_string()
        })
        .collect();

    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::DuplicateProcessors(duplicates))
    }
}

/// Builds `size` sequences from the application's active list and
/// initializes the distinct processors.
pub(crate) fn build_super_sequence(
    app: &Application,
    size: usize,
) -> Result<SuperSequence, SchedulerError> {
    let active = app.active_processors();
    check_active_processors(active)?;

    let mut super_sequence = SuperSequence::new(size)?;
    for name in active {
        let params = app
            .processor_parameters(name)
            .ok_or_else(|| ConfigError::UndefinedProcessor(name.clone()))?;
        super_sequence.add_processor(app, params)?;
    }
    super_sequence.init(app)?;
    Ok(super_sequence)
}
