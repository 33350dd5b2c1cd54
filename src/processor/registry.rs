//! Processor registry: maps processor type names to factories.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::ProcessorParameters;
use crate::error::ConfigError;

use super::builtin::{CpuCrunch, EventSelector, Statusmonitor};
use super::ProcessorInstance;

/// Builds one processor instance from its parameter block.
pub type ProcessorFactory =
    Arc<dyn Fn(&ProcessorParameters) -> Result<ProcessorInstance, ConfigError> + Send + Sync>;

/// Registry of processor factories keyed by type name.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    factories: HashMap<String, ProcessorFactory>,
}

impl ProcessorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in processors registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(EventSelector::TYPE_NAME, |params| {
            EventSelector::from_parameters(params).map(ProcessorInstance::new)
        });
        registry.register(Statusmonitor::TYPE_NAME, |params| {
            Statusmonitor::from_parameters(params).map(ProcessorInstance::new)
        });
        registry.register(CpuCrunch::TYPE_NAME, |params| {
            CpuCrunch::from_parameters(params).map(ProcessorInstance::new)
        });
        registry
    }

    /// Registers (or replaces) the factory for `processor_type`.
    pub fn register<F>(&mut self, processor_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ProcessorParameters) -> Result<ProcessorInstance, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(processor_type.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, processor_type: &str) -> bool {
        self.factories.contains_key(processor_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Constructs a new instance for `params`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownProcessorType` for unregistered types, any
    /// error raised by the factory, and `ConfigError::ValidationFailed` if
    /// the instance does not carry the configured name.
    pub fn create(&self, params: &ProcessorParameters) -> Result<ProcessorInstance, ConfigError> {
        let factory = self.factories.get(&params.processor_type).ok_or_else(|| {
            ConfigError::UnknownProcessorType {
                name: params.name.clone(),
                processor_type: params.processor_type.clone(),
            }
        })?;
        let instance = factory(params)?;
        if instance.name() != params.name {
            return Err(ConfigError::ValidationFailed(format!(
                "factory for '{}' built a processor named '{}', expected '{}'",
                params.processor_type,
                instance.name(),
                params.name
            )));
        }
        Ok(instance)
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ProcessorRegistry::with_builtins();
        assert_eq!(registry.types(), vec!["CpuCrunch", "EventSelector", "Statusmonitor"]);
        assert!(registry.contains("CpuCrunch"));
        assert!(!registry.contains("Missing"));
    }

    #[test]
    fn test_create_unknown_type() {
        let registry = ProcessorRegistry::new();
        let params = ProcessorParameters::new("X", "Nope");
        assert!(matches!(
            registry.create(&params),
            Err(ConfigError::UnknownProcessorType { .. })
        ));
    }

    #[test]
    fn test_create_names_instance_after_parameters() {
        let registry = ProcessorRegistry::with_builtins();
        let instance = registry
            .create(&ProcessorParameters::new("Crunchy", "CpuCrunch"))
            .unwrap();
        assert_eq!(instance.name(), "Crunchy");
    }

    #[test]
    fn test_create_rejects_misnamed_instance() {
        let mut registry = ProcessorRegistry::new();
        registry.register("Fixed", |_params| {
            let params = ProcessorParameters::new("Other", "CpuCrunch");
            CpuCrunch::from_parameters(&params).map(ProcessorInstance::new)
        });
        let err = registry
            .create(&ProcessorParameters::new("Mine", "Fixed"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }
}
