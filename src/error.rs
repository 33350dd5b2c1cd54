//! Error types for eventforge operations.
//!
//! Defines error types for each subsystem:
//! - Configuration and steering-file loading
//! - Processor lifecycle calls (including the skip signal)
//! - Worker pool admission and task execution
//! - Sequence construction
//! - Scheduler orchestration

use thiserror::Error;

/// Errors raised while resolving configuration. All of them are fatal and
/// surface synchronously from `init`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid concurrency value '{0}': expected 'auto' or a positive integer")]
    InvalidConcurrency(String),

    #[error("Undefined concurrency level (computed={0})")]
    UndefinedConcurrency(usize),

    #[error("Active processor list is empty")]
    EmptyProcessorList,

    #[error("Duplicated active processors: {}", .0.join(", "))]
    DuplicateProcessors(Vec<String>),

    #[error("Undefined processor '{0}'")]
    UndefinedProcessor(String),

    #[error("Unknown processor type '{processor_type}' for processor '{name}'")]
    UnknownProcessorType { name: String, processor_type: String },

    #[error("Invalid processor name '{0}': must start with a letter or underscore and contain only alphanumerics, '_', '.', or '-'")]
    InvalidProcessorName(String),

    #[error("Invalid parameter '{key}' for processor '{processor}': {message}")]
    InvalidParameter {
        processor: String,
        key: String,
        message: String,
    },

    #[error("Invalid condition for processor '{processor}': {message}")]
    InvalidCondition { processor: String, message: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised by a processor lifecycle call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProcessorError {
    /// Recoverable signal: abort the rest of the chain for this event.
    #[error("Skip event: {0}")]
    SkipEvent(String),

    #[error("Processor '{processor}' failed: {message}")]
    Failed { processor: String, message: String },

    #[error("Processor '{processor}' panicked: {message}")]
    Panicked { processor: String, message: String },
}

impl ProcessorError {
    /// Convenience constructor for a skip signal.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::SkipEvent(reason.into())
    }

    /// Convenience constructor for a processing failure.
    pub fn failed(processor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            processor: processor.into(),
            message: message.into(),
        }
    }

    /// Returns true for the skip signal.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::SkipEvent(_))
    }
}

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Pool is not accepting new items")]
    NotAccepting,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool has no workers")]
    NoWorkers,

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Task was cancelled before it ran")]
    Cancelled,

    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(#[source] std::io::Error),
}

/// Errors raised while building sequences.
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("Number of sequences must be > 0")]
    NoSequences,

    #[error("Processor '{0}' already in sequence")]
    DuplicateProcessor(String),

    #[error("Sequences are inconsistent: {0}")]
    InconsistentSequences(String),

    #[error("More than one live instance of shared processor '{0}'")]
    SharedInstanceViolation(String),

    #[error("Sequences are currently owned by the worker pool")]
    SequencesLent,
}

/// Errors surfaced by a scheduler to its caller.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("Event {uid} failed: {source}")]
    EventFailed {
        uid: u64,
        #[source]
        source: ProcessorError,
    },

    #[error("Processor '{processor}' failed during {phase}: {source}")]
    ProcessorLifecycle {
        processor: String,
        phase: &'static str,
        #[source]
        source: ProcessorError,
    },

    #[error("Cannot {operation} while scheduler is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
}
