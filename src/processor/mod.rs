//! Processor contract consumed by the scheduler.
//!
//! A processor is a named unit with a fixed lifecycle:
//! `initialize` once, `process_run_header` once per boundary item,
//! `process_event` (followed by `check`) once per event, and `finalize`
//! once at the end. All calls take `&self`; processors that keep mutable
//! state use interior mutability, and the scheduler guarantees mutual
//! exclusion for shared or critical instances (see [`RuntimeOptions`]).
//!
//! Processors may additionally implement [`EventModifier`]. The capability is
//! resolved once when the [`ProcessorInstance`] is built, not per call.

pub mod builtin;
pub mod registry;

pub use builtin::{CpuCrunch, EventSelector, Statusmonitor};
pub use registry::{ProcessorFactory, ProcessorRegistry};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::app::Application;
use crate::config::ProcessorParameters;
use crate::error::ProcessorError;
use crate::event::{Event, RunHeader};

/// Lifecycle contract of one processing unit.
pub trait Processor: Send + Sync {
    /// Unique name of this processor within a configuration.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Runtime options the processor imposes regardless of configuration.
    fn forced_options(&self) -> RuntimeOverrides {
        RuntimeOverrides::default()
    }

    fn initialize(&self, _app: &Application) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn process_run_header(&self, _header: &RunHeader) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Processes one event. Returning [`ProcessorError::SkipEvent`] aborts the
    /// rest of the chain for this event without failing it.
    fn process_event(&self, event: &Event) -> Result<(), ProcessorError>;

    /// Post-processing check, called right after `process_event`.
    fn check(&self, _event: &Event) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn finalize(&self) -> Result<(), ProcessorError> {
        Ok(())
    }
}

/// Optional capability: in-place modification of events and run headers.
pub trait EventModifier: Send + Sync {
    fn modify_event(&self, event: &Event) -> Result<(), ProcessorError>;

    fn modify_run_header(&self, _header: &RunHeader) -> Result<(), ProcessorError> {
        Ok(())
    }
}

/// Resolved runtime options of a configured processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// One private instance per worker instead of one shared instance.
    pub clone: bool,
    /// Never executes concurrently with itself.
    pub critical: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            clone: true,
            critical: false,
        }
    }
}

impl RuntimeOptions {
    /// A shared instance is always guarded, as is a critical one.
    pub fn needs_lock(&self) -> bool {
        self.critical || !self.clone
    }

    /// Resolves options: forced values win over parameters, which win over
    /// the defaults.
    pub fn resolve(forced: RuntimeOverrides, params: &ProcessorParameters) -> Self {
        let defaults = Self::default();
        Self {
            clone: forced.clone.or(params.clone).unwrap_or(defaults.clone),
            critical: forced.critical.or(params.critical).unwrap_or(defaults.critical),
        }
    }
}

/// Partial runtime options, `None` meaning "not imposed".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeOverrides {
    pub clone: Option<bool>,
    pub critical: Option<bool>,
}

impl RuntimeOverrides {
    pub fn with_clone(mut self, clone: bool) -> Self {
        self.clone = Some(clone);
        self
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = Some(critical);
        self
    }
}

/// A constructed processor plus its resolved modifier capability.
#[derive(Clone)]
pub struct ProcessorInstance {
    processor: Arc<dyn Processor>,
    modifier: Option<Arc<dyn EventModifier>>,
}

impl ProcessorInstance {
    /// Wraps a processor without the modifier capability.
    pub fn new<P: Processor + 'static>(processor: P) -> Self {
        Self {
            processor: Arc::new(processor),
            modifier: None,
        }
    }

    /// Wraps a processor that also modifies events.
    pub fn with_modifier<P: Processor + EventModifier + 'static>(processor: P) -> Self {
        let processor = Arc::new(processor);
        let modifier: Arc<dyn EventModifier> = processor.clone();
        Self {
            processor,
            modifier: Some(modifier),
        }
    }

    pub fn name(&self) -> &str {
        self.processor.name()
    }

    pub fn processor(&self) -> &Arc<dyn Processor> {
        &self.processor
    }

    pub fn modifier(&self) -> Option<&Arc<dyn EventModifier>> {
        self.modifier.as_ref()
    }

    /// Address of the underlying processor, used to de-duplicate shared instances.
    pub fn instance_id(&self) -> usize {
        Arc::as_ptr(&self.processor) as *const () as usize
    }

    pub fn same_instance(&self, other: &ProcessorInstance) -> bool {
        self.instance_id() == other.instance_id()
    }

    /// Number of live handles to the underlying processor.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.processor)
    }
}

impl std::fmt::Debug for ProcessorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorInstance")
            .field("name", &self.name())
            .field("modifier", &self.modifier.is_some())
            .finish()
    }
}
