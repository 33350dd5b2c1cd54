//! Per-worker processor chains.
//!
//! A [`Sequence`] is one worker's private, ordered list of [`SequenceItem`]s.
//! Each item wraps a processor instance together with the lock that guards
//! it (if any) and the runtime condition that gates it. Items time every
//! call twice: application time includes waiting for the lock, processor
//! time starts once the lock is held.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{ProcessorError, SequenceError};
use crate::event::{Condition, Event, RunHeader};
use crate::processor::ProcessorInstance;

use super::worker_pool::{panic_message, Worker};

/// Application and processor time of a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockPair {
    pub app_time: Duration,
    pub proc_time: Duration,
}

/// Accumulated timing of one processor within a sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockMeasure {
    pub app_time: Duration,
    pub proc_time: Duration,
    pub counter: u64,
}

impl ClockMeasure {
    pub fn record(&mut self, clock: ClockPair) {
        self.app_time += clock.app_time;
        self.proc_time += clock.proc_time;
        self.counter += 1;
    }

    /// Adds time without counting an invocation.
    pub fn add_time(&mut self, clock: ClockPair) {
        self.app_time += clock.app_time;
        self.proc_time += clock.proc_time;
    }

    pub fn merge(&mut self, other: &ClockMeasure) {
        self.app_time += other.app_time;
        self.proc_time += other.proc_time;
        self.counter += other.counter;
    }

    /// Time spent waiting for the processor lock.
    pub fn lock_time(&self) -> Duration {
        self.app_time.saturating_sub(self.proc_time)
    }
}

/// How an event left the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Every item that was due to run ran.
    Processed,
    /// A processor raised the skip signal with this reason.
    Skipped(String),
}

/// One processor slot in a sequence.
#[derive(Debug, Clone)]
pub struct SequenceItem {
    instance: ProcessorInstance,
    lock: Option<Arc<Mutex<()>>>,
    condition: Option<Condition>,
}

impl SequenceItem {
    pub fn new(
        instance: ProcessorInstance,
        lock: Option<Arc<Mutex<()>>>,
        condition: Option<Condition>,
    ) -> Self {
        Self {
            instance,
            lock,
            condition,
        }
    }

    pub fn name(&self) -> &str {
        self.instance.name()
    }

    pub fn instance(&self) -> &ProcessorInstance {
        &self.instance
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    pub fn lock(&self) -> Option<&Arc<Mutex<()>>> {
        self.lock.as_ref()
    }

    /// Calls `process_event` then `check` inside one lock and timing window.
    pub fn process_event(&self, event: &Event) -> (Result<(), ProcessorError>, ClockPair) {
        let processor = self.instance.processor();
        self.call(|| {
            processor.process_event(event)?;
            processor.check(event)
        })
    }

    pub fn process_run_header(&self, header: &RunHeader) -> (Result<(), ProcessorError>, ClockPair) {
        let processor = self.instance.processor();
        self.call(|| processor.process_run_header(header))
    }

    /// No-op with zero durations unless the processor is a modifier.
    pub fn modify_event(&self, event: &Event) -> (Result<(), ProcessorError>, ClockPair) {
        match self.instance.modifier() {
            Some(modifier) => self.call(|| modifier.modify_event(event)),
            None => (Ok(()), ClockPair::default()),
        }
    }

    /// No-op with zero durations unless the processor is a modifier.
    pub fn modify_run_header(&self, header: &RunHeader) -> (Result<(), ProcessorError>, ClockPair) {
        match self.instance.modifier() {
            Some(modifier) => self.call(|| modifier.modify_run_header(header)),
            None => (Ok(()), ClockPair::default()),
        }
    }

    fn call<F>(&self, f: F) -> (Result<(), ProcessorError>, ClockPair)
    where
        F: FnOnce() -> Result<(), ProcessorError>,
    {
        let start = Instant::now();
        // A panic in a previous holder poisons the lock; the guarded data is `()`.
        let _guard = self
            .lock
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));
        let locked = Instant::now();

        let result = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
            Err(ProcessorError::Panicked {
                processor: self.name().to_string(),
                message: panic_message(payload.as_ref()),
            })
        });

        let end = Instant::now();
        (
            result,
            ClockPair {
                app_time: end - start,
                proc_time: end - locked,
            },
        )
    }
}

/// A worker's private ordered processor chain.
#[derive(Debug, Default)]
pub struct Sequence {
    items: Vec<SequenceItem>,
    clock_measures: HashMap<String, ClockMeasure>,
    skipped_events: BTreeMap<String, u64>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item.
    ///
    /// # Errors
    ///
    /// Returns `SequenceError::DuplicateProcessor` if an item with the same
    /// processor name is already present.
    pub fn add_item(&mut self, item: SequenceItem) -> Result<(), SequenceError> {
        if self.contains(item.name()) {
            return Err(SequenceError::DuplicateProcessor(item.name().to_string()));
        }
        self.items.push(item);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|item| item.name() == name)
    }

    pub fn items(&self) -> &[SequenceItem] {
        &self.items
    }

    pub fn item(&self, index: usize) -> Option<&SequenceItem> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Runs the event through the chain.
    ///
    /// Items whose condition does not hold for this event are passed over.
    /// A skip signal ends the chain and is counted under its reason; any
    /// other error is returned as is.
    pub fn process_event(&mut self, event: &Event) -> Result<SequenceOutcome, ProcessorError> {
        for item in &self.items {
            if !event.conditions().should_run(item.condition()) {
                trace!(processor = item.name(), uid = event.uid(), "Condition false, not running");
                continue;
            }
            let (result, clock) = item.process_event(event);
            self.clock_measures
                .entry(item.name().to_string())
                .or_default()
                .record(clock);

            match result {
                Ok(()) => {}
                Err(ProcessorError::SkipEvent(reason)) => {
                    debug!(processor = item.name(), uid = event.uid(), reason = %reason, "Event skipped");
                    *self.skipped_events.entry(reason.clone()).or_insert(0) += 1;
                    return Ok(SequenceOutcome::Skipped(reason));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(SequenceOutcome::Processed)
    }

    /// Runs every modifier in the chain over the event.
    ///
    /// Conditions gate modifiers like processors. Time is added to the
    /// processor's measure but the call is not counted.
    pub fn modify_event(&mut self, event: &Event) -> Result<(), ProcessorError> {
        for item in &self.items {
            if item.instance().modifier().is_none()
                || !event.conditions().should_run(item.condition())
            {
                continue;
            }
            let (result, clock) = item.modify_event(event);
            self.clock_measures
                .entry(item.name().to_string())
                .or_default()
                .add_time(clock);
            result?;
        }
        Ok(())
    }

    /// Runs every modifier in the chain over the run header.
    pub fn modify_run_header(&self, header: &RunHeader) -> Result<(), ProcessorError> {
        for item in &self.items {
            item.modify_run_header(header).0?;
        }
        Ok(())
    }

    pub fn clock_measures(&self) -> &HashMap<String, ClockMeasure> {
        &self.clock_measures
    }

    /// Sum of all per-processor measures.
    pub fn clock_measure_summary(&self) -> ClockMeasure {
        self.clock_measures
            .values()
            .fold(ClockMeasure::default(), |mut acc, measure| {
                acc.merge(measure);
                acc
            })
    }

    /// Skip counters keyed by reason.
    pub fn skipped_events(&self) -> &BTreeMap<String, u64> {
        &self.skipped_events
    }
}

/// Result of one event run by a [`SequenceWorker`].
#[derive(Debug)]
pub struct EventResult {
    pub event: Arc<Event>,
    pub outcome: Result<SequenceOutcome, ProcessorError>,
    pub duration: Duration,
}

/// Pool worker owning exactly one sequence.
#[derive(Debug)]
pub struct SequenceWorker {
    sequence: Sequence,
}

impl SequenceWorker {
    pub fn new(sequence: Sequence) -> Self {
        Self { sequence }
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn into_sequence(self) -> Sequence {
        self.sequence
    }
}

impl Worker for SequenceWorker {
    type Input = Arc<Event>;
    type Output = EventResult;

    fn process(&mut self, event: Arc<Event>) -> EventResult {
        let start = Instant::now();
        let outcome = self.sequence.process_event(&event);
        EventResult {
            event,
            outcome,
            duration: start.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{EventModifier, Processor};

    struct Recorder {
        name: String,
        skip_uid: Option<u64>,
        fail_uid: Option<u64>,
    }

    impl Recorder {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                skip_uid: None,
                fail_uid: None,
            }
        }
    }

    impl Processor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn process_event(&self, event: &Event) -> Result<(), ProcessorError> {
            if self.skip_uid == Some(event.uid()) {
                return Err(ProcessorError::skip("unlucky"));
            }
            if self.fail_uid == Some(event.uid()) {
                return Err(ProcessorError::failed(&self.name, "bad event"));
            }
            if event.uid() == 666 {
                panic!("cursed event");
            }
            event.insert(self.name.clone(), true);
            Ok(())
        }
    }

    struct Stamper;

    impl Processor for Stamper {
        fn name(&self) -> &str {
            "Stamper"
        }

        fn process_event(&self, _event: &Event) -> Result<(), ProcessorError> {
            Ok(())
        }
    }

    impl EventModifier for Stamper {
        fn modify_event(&self, event: &Event) -> Result<(), ProcessorError> {
            event.insert("stamped", true);
            Ok(())
        }

        fn modify_run_header(&self, header: &RunHeader) -> Result<(), ProcessorError> {
            header.set_parameter("stamped", true);
            Ok(())
        }
    }

    fn item(processor: Recorder) -> SequenceItem {
        SequenceItem::new(ProcessorInstance::new(processor), None, None)
    }

    #[test]
    fn test_add_item_rejects_duplicate_name() {
        let mut sequence = Sequence::new();
        sequence.add_item(item(Recorder::new("A"))).unwrap();
        let err = sequence.add_item(item(Recorder::new("A"))).unwrap_err();
        assert!(matches!(err, SequenceError::DuplicateProcessor(name) if name == "A"));
        assert_eq!(sequence.len(), 1);
    }

    #[test]
    fn test_process_event_runs_chain_in_order() {
        let mut sequence = Sequence::new();
        sequence.add_item(item(Recorder::new("A"))).unwrap();
        sequence.add_item(item(Recorder::new("B"))).unwrap();

        let event = Event::new(1, 0, 1);
        assert_eq!(sequence.process_event(&event).unwrap(), SequenceOutcome::Processed);
        assert!(event.contains("A"));
        assert!(event.contains("B"));

        let summary = sequence.clock_measure_summary();
        assert_eq!(summary.counter, 2);
        assert!(summary.app_time >= summary.proc_time);
    }

    #[test]
    fn test_skip_aborts_chain_and_counts_reason() {
        let mut skipper = Recorder::new("A");
        skipper.skip_uid = Some(2);
        let mut sequence = Sequence::new();
        sequence.add_item(item(skipper)).unwrap();
        sequence.add_item(item(Recorder::new("B"))).unwrap();

        let event = Event::new(2, 0, 2);
        let outcome = sequence.process_event(&event).unwrap();
        assert_eq!(outcome, SequenceOutcome::Skipped("unlucky".to_string()));
        assert!(!event.contains("B"));
        assert_eq!(sequence.skipped_events().get("unlucky"), Some(&1));
        assert_eq!(sequence.skipped_events().len(), 1);
    }

    #[test]
    fn test_failure_propagates() {
        let mut failing = Recorder::new("A");
        failing.fail_uid = Some(3);
        let mut sequence = Sequence::new();
        sequence.add_item(item(failing)).unwrap();
        sequence.add_item(item(Recorder::new("B"))).unwrap();

        let event = Event::new(3, 0, 3);
        let err = sequence.process_event(&event).unwrap_err();
        assert!(matches!(err, ProcessorError::Failed { ref processor, .. } if processor == "A"));
        assert!(!event.contains("B"));
        assert!(sequence.skipped_events().is_empty());
    }

    #[test]
    fn test_panic_becomes_processor_error() {
        let mut sequence = Sequence::new();
        sequence.add_item(item(Recorder::new("A"))).unwrap();

        let err = sequence.process_event(&Event::new(666, 0, 0)).unwrap_err();
        match err {
            ProcessorError::Panicked { processor, message } => {
                assert_eq!(processor, "A");
                assert_eq!(message, "cursed event");
            }
            other => panic!("unexpected error {:?}", other),
        }
        // The sequence keeps working afterwards.
        assert!(sequence.process_event(&Event::new(1, 0, 1)).is_ok());
    }

    #[test]
    fn test_condition_gates_item() {
        let gated = SequenceItem::new(
            ProcessorInstance::new(Recorder::new("B")),
            None,
            Some("Selector".parse().unwrap()),
        );
        let mut sequence = Sequence::new();
        sequence.add_item(gated).unwrap();

        let vetoed = Event::new(1, 0, 1);
        vetoed.conditions().set("Selector", false);
        sequence.process_event(&vetoed).unwrap();
        assert!(!vetoed.contains("B"));

        let passed = Event::new(2, 0, 2);
        passed.conditions().set("Selector", true);
        sequence.process_event(&passed).unwrap();
        assert!(passed.contains("B"));

        assert_eq!(sequence.clock_measures()["B"].counter, 1);
    }

    #[test]
    fn test_locked_item_measures_wait() {
        let lock = Arc::new(Mutex::new(()));
        let item = SequenceItem::new(
            ProcessorInstance::new(Recorder::new("A")),
            Some(Arc::clone(&lock)),
            None,
        );

        let holder = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let _guard = lock.lock().unwrap();
                std::thread::sleep(Duration::from_millis(30));
            })
        };
        std::thread::sleep(Duration::from_millis(5));
        let (result, clock) = item.process_event(&Event::new(1, 0, 1));
        holder.join().unwrap();

        assert!(result.is_ok());
        assert!(clock.app_time >= clock.proc_time);
        assert!(clock.app_time - clock.proc_time >= Duration::from_millis(10));
    }

    #[test]
    fn test_modify_without_capability_is_noop() {
        let plain = item(Recorder::new("A"));
        let (result, clock) = plain.modify_event(&Event::new(1, 0, 1));
        assert!(result.is_ok());
        assert_eq!(clock, ClockPair::default());

        let (result, clock) = plain.modify_run_header(&RunHeader::new(1));
        assert!(result.is_ok());
        assert_eq!(clock, ClockPair::default());
    }

    #[test]
    fn test_modifier_items() {
        let mut sequence = Sequence::new();
        sequence.add_item(item(Recorder::new("A"))).unwrap();
        sequence
            .add_item(SequenceItem::new(ProcessorInstance::with_modifier(Stamper), None, None))
            .unwrap();

        let event = Event::new(1, 0, 1);
        sequence.modify_event(&event).unwrap();
        assert!(event.contains("stamped"));
        assert!(!event.contains("A"));

        let header = RunHeader::new(4);
        sequence.modify_run_header(&header).unwrap();
        assert!(header.parameter("stamped").is_some());
    }

    #[test]
    fn test_modify_event_honours_conditions_and_keeps_counter() {
        let mut sequence = Sequence::new();
        sequence
            .add_item(SequenceItem::new(
                ProcessorInstance::with_modifier(Stamper),
                None,
                Some("Selector".parse().unwrap()),
            ))
            .unwrap();

        let vetoed = Event::new(1, 0, 1);
        vetoed.conditions().set("Selector", false);
        sequence.modify_event(&vetoed).unwrap();
        assert!(!vetoed.contains("stamped"));
        assert!(sequence.clock_measures().get("Stamper").is_none());

        let passed = Event::new(2, 0, 2);
        passed.conditions().set("Selector", true);
        sequence.modify_event(&passed).unwrap();
        assert!(passed.contains("stamped"));
        assert_eq!(sequence.clock_measures()["Stamper"].counter, 0);

        sequence.process_event(&passed).unwrap();
        assert_eq!(sequence.clock_measures()["Stamper"].counter, 1);
    }

    #[test]
    fn test_sequence_worker_reports_outcome() {
        let mut sequence = Sequence::new();
        sequence.add_item(item(Recorder::new("A"))).unwrap();
        let mut worker = SequenceWorker::new(sequence);

        let result = worker.process(Arc::new(Event::new(9, 0, 9)));
        assert_eq!(result.event.uid(), 9);
        assert_eq!(result.outcome, Ok(SequenceOutcome::Processed));
        assert_eq!(worker.into_sequence().clock_measure_summary().counter, 1);
    }

    #[test]
    fn test_clock_measure_lock_time() {
        let mut measure = ClockMeasure::default();
        measure.record(ClockPair {
            app_time: Duration::from_millis(5),
            proc_time: Duration::from_millis(3),
        });
        assert_eq!(measure.lock_time(), Duration::from_millis(2));
        assert_eq!(measure.counter, 1);

        measure.add_time(ClockPair {
            app_time: Duration::from_millis(1),
            proc_time: Duration::from_millis(1),
        });
        assert_eq!(measure.app_time, Duration::from_millis(6));
        assert_eq!(measure.counter, 1);
    }
}
