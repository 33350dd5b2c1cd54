//! eventforge: parallel event-processing scheduler.
//!
//! Events flow through an ordered chain of processors. The parallel
//! scheduler spreads events over a fixed pool of worker threads, each owning
//! its own copy of the chain, while shared and critical processors are
//! serialized behind per-processor locks and run headers are handled behind
//! a barrier.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod processor;
pub mod scheduler;

pub use app::Application;
pub use config::{AppConfig, Concurrency, ProcessorParameters, SchedulerConfig};
pub use error::{ConfigError, PoolError, ProcessorError, SchedulerError, SequenceError};
pub use event::{Condition, Event, RunHeader};
pub use processor::{EventModifier, Processor, ProcessorInstance, ProcessorRegistry, RuntimeOptions};
pub use scheduler::{ParallelScheduler, Scheduler, SchedulerReport, SimpleScheduler};
