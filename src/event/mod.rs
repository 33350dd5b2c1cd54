//! Event and run-header types processed by the scheduler.
//!
//! An [`Event`] is an independently processable unit of work with a stable
//! uid. It carries a free-form data map that processors read and write, and
//! a [`ProcessorConditions`] extension in which processors publish their
//! per-event result values. A [`RunHeader`] is the rare boundary item that
//! every unique processor observes exactly once.
//!
//! Both types are shared between the caller and the in-flight task through
//! `Arc`, so mutable state sits behind interior locks. Only one worker runs
//! a given event's chain at a time, so these locks are never contended in
//! practice.

pub mod condition;

pub use condition::{Condition, ConditionParseError};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-event result values published by processors.
///
/// A processor sets its own value (e.g. an event selector marks whether the
/// event passed). Downstream processors configured with a [`Condition`] are
/// only called when the condition holds for these values.
#[derive(Debug, Default)]
pub struct ProcessorConditions {
    values: Mutex<HashMap<String, bool>>,
}

impl ProcessorConditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the result value of processor `name` for this event.
    pub fn set(&self, name: impl Into<String>, value: bool) {
        lock(&self.values).insert(name.into(), value);
    }

    /// Returns the result value of processor `name`, if it set one.
    pub fn get(&self, name: &str) -> Option<bool> {
        lock(&self.values).get(name).copied()
    }

    /// Decides whether a processor guarded by `condition` should run.
    ///
    /// Without a condition the processor always runs. Processors that never
    /// published a value count as `true`.
    pub fn should_run(&self, condition: Option<&Condition>) -> bool {
        match condition {
            None => true,
            Some(condition) => {
                let values = lock(&self.values);
                condition.evaluate(&|name| values.get(name).copied().unwrap_or(true))
            }
        }
    }

    pub fn clear(&self) {
        lock(&self.values).clear();
    }
}

/// One unit of work pushed through the scheduler.
#[derive(Debug)]
pub struct Event {
    uid: u64,
    run_number: i32,
    event_number: i32,
    data: Mutex<BTreeMap<String, Value>>,
    conditions: ProcessorConditions,
}

impl Event {
    /// Creates an event with a caller-chosen uid.
    pub fn new(uid: u64, run_number: i32, event_number: i32) -> Self {
        Self {
            uid,
            run_number,
            event_number,
            data: Mutex::new(BTreeMap::new()),
            conditions: ProcessorConditions::new(),
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn run_number(&self) -> i32 {
        self.run_number
    }

    pub fn event_number(&self) -> i32 {
        self.event_number
    }

    /// Runtime extension holding processor result values.
    pub fn conditions(&self) -> &ProcessorConditions {
        &self.conditions
    }

    /// Stores a value in the event's data map, returning the previous one.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        lock(&self.data).insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.data).get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        lock(&self.data).remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.data).contains_key(key)
    }

    /// Runs `f` with mutable access to the data map.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut BTreeMap<String, Value>) -> R) -> R {
        f(&mut lock(&self.data))
    }
}

/// Boundary item separating runs of events.
#[derive(Debug)]
pub struct RunHeader {
    run_number: i32,
    detector_name: String,
    description: String,
    parameters: Mutex<BTreeMap<String, Value>>,
}

impl RunHeader {
    pub fn new(run_number: i32) -> Self {
        Self {
            run_number,
            detector_name: String::new(),
            description: String::new(),
            parameters: Mutex::new(BTreeMap::new()),
        }
    }

    /// Sets the detector name.
    pub fn with_detector_name(mut self, name: impl Into<String>) -> Self {
        self.detector_name = name.into();
        self
    }

    /// Sets the run description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn run_number(&self) -> i32 {
        self.run_number
    }

    pub fn detector_name(&self) -> &str {
        &self.detector_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_parameter(&self, key: impl Into<String>, value: impl Into<Value>) {
        lock(&self.parameters).insert(key.into(), value.into());
    }

    pub fn parameter(&self, key: &str) -> Option<Value> {
        lock(&self.parameters).get(key).cloned()
    }

    /// Snapshot of all run parameters.
    pub fn parameters(&self) -> BTreeMap<String, Value> {
        lock(&self.parameters).clone()
    }
}

/// Serializable summary of an event, used by the CLI output.
#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub uid: u64,
    pub run_number: i32,
    pub event_number: i32,
    pub keys: Vec<String>,
}

impl From<&Event> for EventSummary {
    fn from(event: &Event) -> Self {
        Self {
            uid: event.uid,
            run_number: event.run_number,
            event_number: event.event_number,
            keys: lock(&event.data).keys().cloned().collect(),
        }
    }
}
