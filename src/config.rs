//! Application and scheduler configuration.
//!
//! The steering document is YAML:
//!
//! ```yaml
//! global:
//!   concurrency: auto          # or an integer
//! scheduler:
//!   queue_factor: 2
//!   barrier_poll_micros: 10
//! execute: [Selector, Status, Crunch]
//! processors:
//!   Selector:
//!     type: EventSelector
//!     parameters:
//!       EventList: [1, 0, 3, 0]
//!   Status:
//!     type: Statusmonitor
//!   Crunch:
//!     type: CpuCrunch
//!     clone: true
//!     critical: false
//!     condition: Selector
//!     parameters:
//!       CrunchTime: 200
//! ```
//!
//! Environment variables override file values (see [`AppConfig::apply_env_overrides`]).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::event::Condition;

/// Environment variable overriding `global.concurrency`.
pub const ENV_CONCURRENCY: &str = "EVENTFORGE_CONCURRENCY";
/// Environment variable overriding `scheduler.queue_factor`.
pub const ENV_QUEUE_FACTOR: &str = "EVENTFORGE_QUEUE_FACTOR";
/// Environment variable overriding `scheduler.barrier_poll_micros`.
pub const ENV_BARRIER_POLL_MICROS: &str = "EVENTFORGE_BARRIER_POLL_MICROS";
/// Environment variable overriding `scheduler.thread_name_prefix`.
pub const ENV_THREAD_PREFIX: &str = "EVENTFORGE_THREAD_PREFIX";

const DEFAULT_QUEUE_FACTOR: usize = 2;
const DEFAULT_BARRIER_POLL_MICROS: u64 = 10;
const DEFAULT_THREAD_PREFIX: &str = "eventforge-worker";

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").ok())
        .as_ref()
}

/// Checks that a processor name is usable in condition expressions.
pub fn validate_processor_name(name: &str) -> Result<(), ConfigError> {
    let pattern = name_pattern().ok_or_else(|| {
        ConfigError::ValidationFailed("processor name pattern failed to compile".to_string())
    })?;
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidProcessorName(name.to_string()))
    }
}

/// Requested concurrency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ConcurrencyRepr", into = "ConcurrencyRepr")]
pub enum Concurrency {
    /// One worker per hardware thread.
    #[default]
    Auto,
    /// Explicit worker count.
    Fixed(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ConcurrencyRepr {
    Int(i64),
    Str(String),
}

impl TryFrom<ConcurrencyRepr> for Concurrency {
    type Error = ConfigError;

    fn try_from(repr: ConcurrencyRepr) -> Result<Self, Self::Error> {
        match repr {
            ConcurrencyRepr::Int(n) => usize::try_from(n)
                .map(Concurrency::Fixed)
                .map_err(|_| ConfigError::InvalidConcurrency(n.to_string())),
            ConcurrencyRepr::Str(s) => s.parse(),
        }
    }
}

impl From<Concurrency> for ConcurrencyRepr {
    fn from(value: Concurrency) -> Self {
        match value {
            Concurrency::Auto => ConcurrencyRepr::Str("auto".to_string()),
            Concurrency::Fixed(n) => ConcurrencyRepr::Int(n as i64),
        }
    }
}

impl FromStr for Concurrency {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(Concurrency::Auto);
        }
        trimmed
            .parse::<usize>()
            .map(Concurrency::Fixed)
            .map_err(|_| ConfigError::InvalidConcurrency(s.to_string()))
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Auto => write!(f, "auto"),
            Concurrency::Fixed(n) => write!(f, "{}", n),
        }
    }
}

impl Concurrency {
    /// Number of hardware threads reported by the host (0 if unknown).
    pub fn hardware_threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(0)
    }

    /// Resolves against the host's hardware thread count.
    pub fn resolve(&self) -> Result<usize, ConfigError> {
        self.resolve_with(Self::hardware_threads())
    }

    /// Resolves against an explicit hardware thread count.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UndefinedConcurrency` if the resolved value is 0.
    pub fn resolve_with(&self, hardware_threads: usize) -> Result<usize, ConfigError> {
        let resolved = match self {
            Concurrency::Auto => hardware_threads,
            Concurrency::Fixed(n) => *n,
        };
        if resolved == 0 {
            return Err(ConfigError::UndefinedConcurrency(resolved));
        }
        Ok(resolved)
    }
}

/// Global application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub concurrency: Concurrency,
}

/// Tuning knobs for the parallel scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pool bound is `queue_factor * concurrency`.
    pub queue_factor: usize,
    /// Sleep between idle checks while a run header waits for the pool.
    pub barrier_poll_micros: u64,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_factor: DEFAULT_QUEUE_FACTOR,
            barrier_poll_micros: DEFAULT_BARRIER_POLL_MICROS,
            thread_name_prefix: DEFAULT_THREAD_PREFIX.to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `EVENTFORGE_QUEUE_FACTOR`: pool bound multiplier (default: 2)
    /// - `EVENTFORGE_BARRIER_POLL_MICROS`: barrier poll interval (default: 10)
    /// - `EVENTFORGE_THREAD_PREFIX`: worker thread name prefix
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(&|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_QUEUE_FACTOR) {
            self.queue_factor = parse_env_value(&val, ENV_QUEUE_FACTOR)?;
        }
        if let Some(val) = lookup(ENV_BARRIER_POLL_MICROS) {
            self.barrier_poll_micros = parse_env_value(&val, ENV_BARRIER_POLL_MICROS)?;
        }
        if let Some(val) = lookup(ENV_THREAD_PREFIX) {
            self.thread_name_prefix = val;
        }
        Ok(())
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_factor == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue_factor must be greater than 0".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "thread_name_prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn barrier_poll_interval(&self) -> Duration {
        Duration::from_micros(self.barrier_poll_micros)
    }

    pub fn with_queue_factor(mut self, factor: usize) -> Self {
        self.queue_factor = factor;
        self
    }

    pub fn with_barrier_poll_interval(mut self, interval: Duration) -> Self {
        self.barrier_poll_micros = interval.as_micros() as u64;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

/// Parameter block of one configured processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorParameters {
    /// Instance name, taken from the key in the `processors` map.
    #[serde(default, skip_serializing)]
    pub name: String,
    /// Registered processor type used to look up the factory.
    #[serde(rename = "type")]
    pub processor_type: String,
    /// Requests one private instance per worker (`true`) or one shared instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<bool>,
    /// Requests that the processor never runs concurrently with itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<bool>,
    /// Run condition over upstream processor results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

impl ProcessorParameters {
    pub fn new(name: impl Into<String>, processor_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processor_type: processor_type.into(),
            clone: None,
            critical: None,
            condition: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_clone(mut self, clone: bool) -> Self {
        self.clone = Some(clone);
        self
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = Some(critical);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<serde_yaml::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Reads a typed parameter value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidParameter` if the value does not
    /// deserialize into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.parameters.get(key) {
            None => Ok(None),
            Some(value) => serde_yaml::from_value(value.clone())
                .map(Some)
                .map_err(|e| ConfigError::InvalidParameter {
                    processor: self.name.clone(),
                    key: key.to_string(),
                    message: e.to_string(),
                }),
        }
    }

    /// Reads a typed parameter value, falling back to `default` when absent.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Parses the configured run condition, if any.
    pub fn parsed_condition(&self) -> Result<Option<Condition>, ConfigError> {
        match self.condition.as_deref() {
            None => Ok(None),
            Some(expr) if expr.trim().is_empty() => Ok(None),
            Some(expr) => expr
                .parse::<Condition>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidCondition {
                    processor: self.name.clone(),
                    message: e.to_string(),
                }),
        }
    }
}

/// Full steering document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub global: GlobalConfig,
    pub scheduler: SchedulerConfig,
    /// Active processors, in execution order.
    pub execute: Vec<String>,
    pub processors: BTreeMap<String, ProcessorParameters>,
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML steering document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: AppConfig = serde_yaml::from_str(yaml)?;
        for (name, params) in config.processors.iter_mut() {
            params.name = name.clone();
        }
        Ok(config)
    }

    /// Loads a YAML steering file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Applies environment variable overrides.
    ///
    /// # Environment Variables
    ///
    /// - `EVENTFORGE_CONCURRENCY`: "auto" or a worker count
    /// - `EVENTFORGE_QUEUE_FACTOR`, `EVENTFORGE_BARRIER_POLL_MICROS`,
    ///   `EVENTFORGE_THREAD_PREFIX`: see [`SchedulerConfig::from_env`]
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(&|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_CONCURRENCY) {
            self.global.concurrency = val.parse()?;
        }
        self.scheduler.apply_overrides(lookup)
    }

    /// Validates names, conditions and scheduler settings.
    ///
    /// Duplicates in `execute` are not rejected here; the scheduler reports
    /// them with instance counts when it is initialised.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        for name in &self.execute {
            validate_processor_name(name)?;
        }
        for (name, params) in &self.processors {
            validate_processor_name(name)?;
            if params.name != *name {
                return Err(ConfigError::ValidationFailed(format!(
                    "processor '{}' is registered under key '{}'",
                    params.name, name
                )));
            }
            if params.processor_type.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "processor '{}' has no type",
                    name
                )));
            }
            params.parsed_condition()?;
        }
        Ok(())
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.global.concurrency = concurrency;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Defines a processor and appends it to the active list.
    pub fn with_processor(mut self, params: ProcessorParameters) -> Self {
        self.execute.push(params.name.clone());
        self.processors.insert(params.name.clone(), params);
        self
    }

    /// Replaces the active list.
    pub fn with_execute(mut self, names: Vec<String>) -> Self {
        self.execute = names;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
