//! Built-in processors.
//!
//! - [`EventSelector`]: publishes whether an event is in a configured list
//! - [`Statusmonitor`]: shared, lock-guarded progress counter
//! - [`CpuCrunch`]: busy-spins for a fixed time per event

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::app::Application;
use crate::config::ProcessorParameters;
use crate::error::{ConfigError, ProcessorError};
use crate::event::{Event, RunHeader};

use super::{Processor, RuntimeOverrides};

/// Publishes `true` for events whose (event number, run number) pair is in
/// `EventList`, `false` otherwise. With an empty list every event passes.
///
/// With `SkipUnselected: true` unselected events are skipped instead.
#[derive(Debug)]
pub struct EventSelector {
    name: String,
    event_list: Vec<i32>,
    skip_unselected: bool,
    selected: OnceLock<HashSet<(i32, i32)>>,
}

impl EventSelector {
    pub const TYPE_NAME: &'static str = "EventSelector";

    pub fn new(name: impl Into<String>, event_list: Vec<i32>) -> Self {
        Self {
            name: name.into(),
            event_list,
            skip_unselected: false,
            selected: OnceLock::new(),
        }
    }

    pub fn with_skip_unselected(mut self, skip: bool) -> Self {
        self.skip_unselected = skip;
        self
    }

    /// Builds the selector from `EventList` (a list of integers or a
    /// whitespace separated string) and `SkipUnselected`.
    pub fn from_parameters(params: &ProcessorParameters) -> Result<Self, ConfigError> {
        let event_list = match params.get::<Vec<i32>>("EventList") {
            Ok(list) => list.unwrap_or_default(),
            Err(list_err) => match params.get::<String>("EventList") {
                Ok(Some(text)) => parse_int_list(&text).ok_or(list_err)?,
                _ => return Err(list_err),
            },
        };
        let skip_unselected = params.get_or("SkipUnselected", false)?;
        Ok(Self::new(&params.name, event_list).with_skip_unselected(skip_unselected))
    }

    fn is_selected(&self, event: &Event) -> bool {
        match self.selected.get() {
            Some(set) => set.contains(&(event.event_number(), event.run_number())),
            None => false,
        }
    }
}

fn parse_int_list(text: &str) -> Option<Vec<i32>> {
    text.split_whitespace().map(|s| s.parse().ok()).collect()
}

impl Processor for EventSelector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Sets its result to true if the event is in EventList"
    }

    fn initialize(&self, _app: &Application) -> Result<(), ProcessorError> {
        if self.event_list.len() % 2 != 0 {
            return Err(ProcessorError::failed(
                &self.name,
                "event list size should be even (list of event / run ids)",
            ));
        }
        let set = self
            .event_list
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
            .collect();
        // A second initialize keeps the first set.
        let _ = self.selected.set(set);
        Ok(())
    }

    fn process_event(&self, event: &Event) -> Result<(), ProcessorError> {
        if self.event_list.is_empty() {
            event.conditions().set(&self.name, true);
            return Ok(());
        }
        let selected = self.is_selected(event);
        debug!(
            processor = %self.name,
            event = event.event_number(),
            run = event.run_number(),
            selected,
            "Event selection"
        );
        event.conditions().set(&self.name, selected);
        if !selected && self.skip_unselected {
            return Err(ProcessorError::skip(format!("{}: not in event list", self.name)));
        }
        Ok(())
    }
}

/// Counts runs and events, logging every `HowOften` events.
///
/// Thread safe on its own, so it always runs as one shared instance.
#[derive(Debug)]
pub struct Statusmonitor {
    name: String,
    how_often: u64,
    runs: AtomicU64,
    events: AtomicU64,
}

impl Statusmonitor {
    pub const TYPE_NAME: &'static str = "Statusmonitor";

    pub fn new(name: impl Into<String>, how_often: u64) -> Self {
        Self {
            name: name.into(),
            how_often,
            runs: AtomicU64::new(0),
            events: AtomicU64::new(0),
        }
    }

    pub fn from_parameters(params: &ProcessorParameters) -> Result<Self, ConfigError> {
        let how_often = params.get_or("HowOften", 1u64)?;
        Ok(Self::new(&params.name, how_often))
    }

    pub fn runs_seen(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn events_seen(&self) -> u64 {
        self.events.load(Ordering::SeqCst)
    }
}

impl Processor for Statusmonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Prints the number of runs and events processed"
    }

    fn forced_options(&self) -> RuntimeOverrides {
        RuntimeOverrides::default()
            .with_clone(false)
            .with_critical(false)
    }

    fn process_run_header(&self, header: &RunHeader) -> Result<(), ProcessorError> {
        let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        info!(processor = %self.name, run = header.run_number(), runs, "New run");
        Ok(())
    }

    fn process_event(&self, event: &Event) -> Result<(), ProcessorError> {
        let count = self.events.fetch_add(1, Ordering::SeqCst) + 1;
        if self.how_often > 0 && count % self.how_often == 0 {
            info!(
                processor = %self.name,
                run = event.run_number(),
                event = event.event_number(),
                count,
                "Processing event"
            );
        }
        Ok(())
    }

    fn finalize(&self) -> Result<(), ProcessorError> {
        info!(
            processor = %self.name,
            runs = self.runs_seen(),
            events = self.events_seen(),
            "Processed runs and events"
        );
        Ok(())
    }
}

/// Spends `CrunchTime` microseconds of CPU per event.
#[derive(Debug)]
pub struct CpuCrunch {
    name: String,
    crunch_time: Duration,
}

impl CpuCrunch {
    pub const TYPE_NAME: &'static str = "CpuCrunch";

    pub fn new(name: impl Into<String>, crunch_time: Duration) -> Self {
        Self {
            name: name.into(),
            crunch_time,
        }
    }

    pub fn from_parameters(params: &ProcessorParameters) -> Result<Self, ConfigError> {
        let micros = params.get_or("CrunchTime", 200u64)?;
        Ok(Self::new(&params.name, Duration::from_micros(micros)))
    }
}

impl Processor for CpuCrunch {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Busy-spins for CrunchTime microseconds per event"
    }

    fn process_event(&self, event: &Event) -> Result<(), ProcessorError> {
        let start = Instant::now();
        let mut acc = event.uid();
        while start.elapsed() < self.crunch_time {
            acc = std::hint::black_box(acc.wrapping_mul(6364136223846793005).wrapping_add(1));
        }
        event.insert(format!("{}.checksum", self.name), acc);
        Ok(())
    }
}
