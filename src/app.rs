//! Application handle shared with schedulers and processors.
//!
//! Bundles the validated steering configuration with the processor registry.
//! Schedulers read the concurrency setting, the active processor list and
//! the per-processor parameter blocks from here; processors receive it in
//! `initialize`.

use crate::config::{AppConfig, Concurrency, ProcessorParameters, SchedulerConfig};
use crate::error::ConfigError;
use crate::processor::{ProcessorInstance, ProcessorRegistry};

#[derive(Debug, Clone)]
pub struct Application {
    config: AppConfig,
    registry: ProcessorRegistry,
}

impl Application {
    /// Creates an application from a configuration and a registry.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration fails validation.
    pub fn new(config: AppConfig, registry: ProcessorRegistry) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, registry })
    }

    /// Creates an application with the built-in processors registered.
    pub fn with_builtins(config: AppConfig) -> Result<Self, ConfigError> {
        Self::new(config, ProcessorRegistry::with_builtins())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn concurrency(&self) -> Concurrency {
        self.config.global.concurrency
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.config.scheduler
    }

    /// Active processor names in execution order.
    pub fn active_processors(&self) -> &[String] {
        &self.config.execute
    }

    pub fn processor_parameters(&self, name: &str) -> Option<&ProcessorParameters> {
        self.config.processors.get(name)
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Constructs a fresh processor instance from `params`.
    pub fn create_processor(
        &self,
        params: &ProcessorParameters,
    ) -> Result<ProcessorInstance, ConfigError> {
        self.registry.create(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_accessors() {
        let config = AppConfig::new()
            .with_concurrency(Concurrency::Fixed(2))
            .with_processor(ProcessorParameters::new("Crunch", "CpuCrunch"));
        let app = Application::with_builtins(config).unwrap();

        assert_eq!(app.concurrency(), Concurrency::Fixed(2));
        assert_eq!(app.active_processors().to_vec(), vec!["Crunch".to_string()]);
        assert!(app.processor_parameters("Crunch").is_some());
        assert!(app.processor_parameters("Missing").is_none());

        let params = app.processor_parameters("Crunch").unwrap().clone();
        assert_eq!(app.create_processor(&params).unwrap().name(), "Crunch");
    }

    #[test]
    fn test_application_rejects_invalid_config() {
        let config = AppConfig::new()
            .with_scheduler(SchedulerConfig::default().with_queue_factor(0));
        assert!(Application::with_builtins(config).is_err());
    }
}
