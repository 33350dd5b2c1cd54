//! The set of per-worker sequences plus de-duplication of shared processors.
//!
//! Cloned processors get one instance per sequence. A shared processor has a
//! single instance referenced from every sequence and guarded by one lock.
//! Lifecycle and run-header calls go through the unique list, so every
//! distinct instance sees them exactly once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::app::Application;
use crate::config::ProcessorParameters;
use crate::error::{ProcessorError, SchedulerError, SequenceError};
use crate::event::RunHeader;
use crate::processor::RuntimeOptions;

use super::report::ProcessorStatistics;
use super::sequence::{ClockMeasure, Sequence, SequenceItem};

#[derive(Debug)]
pub struct SuperSequence {
    size: usize,
    sequences: Vec<Sequence>,
    lent: bool,
    unique: Vec<SequenceItem>,
    /// Configured processors in insertion order with their resolved options.
    options: Vec<(String, RuntimeOptions)>,
}

impl SuperSequence {
    /// Creates `size` empty sequences.
    ///
    /// # Errors
    ///
    /// Returns `SequenceError::NoSequences` when `size` is zero.
    pub fn new(size: usize) -> Result<Self, SequenceError> {
        if size == 0 {
            return Err(SequenceError::NoSequences);
        }
        Ok(Self {
            size,
            sequences: (0..size).map(|_| Sequence::new()).collect(),
            lent: false,
            unique: Vec::new(),
            options: Vec::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Appends the processor described by `params` to every sequence.
    pub fn add_processor(
        &mut self,
        app: &Application,
        params: &ProcessorParameters,
    ) -> Result<(), SchedulerError> {
        if self.lent {
            return Err(SequenceError::SequencesLent.into());
        }
        if self.options.iter().any(|(name, _)| *name == params.name) {
            return Err(SequenceError::DuplicateProcessor(params.name.clone()).into());
        }

        let first = app.create_processor(params)?;
        let options = RuntimeOptions::resolve(first.processor().forced_options(), params);
        let condition = params.parsed_condition()?;
        let lock = options.needs_lock().then(|| Arc::new(Mutex::new(())));

        debug!(
            processor = %params.name,
            clone = options.clone,
            critical = options.critical,
            sequences = self.size,
            "Adding processor"
        );

        let mut instances = Vec::with_capacity(self.size);
        instances.push(first);
        for _ in 1..self.size {
            let instance = if options.clone {
                app.create_processor(params)?
            } else {
                instances[0].clone()
            };
            instances.push(instance);
        }

        for (sequence, instance) in self.sequences.iter_mut().zip(instances) {
            sequence.add_item(SequenceItem::new(instance, lock.clone(), condition.clone()))?;
        }
        self.options.push((params.name.clone(), options));
        self.build_unique_list()?;
        Ok(())
    }

    /// Rebuilds the list of distinct processor instances.
    ///
    /// Walks item index 0..len across all sequences and keeps the first item
    /// seen for each instance.
    pub fn build_unique_list(&mut self) -> Result<(), SequenceError> {
        if self.lent {
            return Err(SequenceError::SequencesLent);
        }
        let len = self.sequences[0].len();
        if let Some(bad) = self.sequences.iter().position(|s| s.len() != len) {
            return Err(SequenceError::InconsistentSequences(format!(
                "sequence {} has {} items, sequence 0 has {}",
                bad,
                self.sequences[bad].len(),
                len
            )));
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for index in 0..len {
            let mut instances_at_index = HashSet::new();
            let name = self.sequences[0].items()[index].name().to_string();
            for sequence in &self.sequences {
                let item = &sequence.items()[index];
                if item.name() != name {
                    return Err(SequenceError::InconsistentSequences(format!(
                        "item {} is '{}' in one sequence and '{}' in another",
                        index,
                        name,
                        item.name()
                    )));
                }
                let id = item.instance().instance_id();
                instances_at_index.insert(id);
                if seen.insert(id) {
                    unique.push(item.clone());
                }
            }
            if !self.is_cloned(&name) && instances_at_index.len() > 1 {
                return Err(SequenceError::SharedInstanceViolation(name));
            }
        }

        self.unique = unique;
        Ok(())
    }

    fn is_cloned(&self, name: &str) -> bool {
        self.runtime_options(name)
            .map(|options| options.clone)
            .unwrap_or(true)
    }

    /// Distinct processor instances, in chain order.
    pub fn unique_items(&self) -> &[SequenceItem] {
        &self.unique
    }

    pub fn runtime_options(&self, name: &str) -> Option<RuntimeOptions> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, options)| *options)
    }

    /// Initializes every distinct instance once.
    pub fn init(&self, app: &Application) -> Result<(), SchedulerError> {
        for item in &self.unique {
            item.instance()
                .processor()
                .initialize(app)
                .map_err(|source| lifecycle_error(item, "init", source))?;
        }
        Ok(())
    }

    /// Runs the header through every distinct instance once.
    pub fn process_run_header(&self, header: &RunHeader) -> Result<(), SchedulerError> {
        for item in &self.unique {
            item.process_run_header(header)
                .0
                .map_err(|source| lifecycle_error(item, "run header", source))?;
        }
        Ok(())
    }

    /// Runs modifiers over the header, once per distinct instance.
    pub fn modify_run_header(&self, header: &RunHeader) -> Result<(), SchedulerError> {
        for item in &self.unique {
            item.modify_run_header(header)
                .0
                .map_err(|source| lifecycle_error(item, "modify run header", source))?;
        }
        Ok(())
    }

    /// Finalizes every distinct instance once. All instances are finalized
    /// even if one fails; the first error is returned.
    pub fn end(&self) -> Result<(), SchedulerError> {
        let mut first_error = None;
        for item in &self.unique {
            if let Err(source) = item.instance().processor().finalize() {
                tracing::error!(processor = item.name(), error = %source, "Finalize failed");
                first_error.get_or_insert_with(|| lifecycle_error(item, "end", source));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Hands the sequences to the worker pool.
    pub fn take_sequences(&mut self) -> Result<Vec<Sequence>, SequenceError> {
        if self.lent {
            return Err(SequenceError::SequencesLent);
        }
        self.lent = true;
        Ok(std::mem::take(&mut self.sequences))
    }

    /// Takes the sequences back from the worker pool.
    pub fn restore_sequences(&mut self, sequences: Vec<Sequence>) -> Result<(), SequenceError> {
        if sequences.len() != self.size {
            let returned = sequences.len();
            self.sequences = sequences;
            self.lent = false;
            return Err(SequenceError::InconsistentSequences(format!(
                "{} of {} sequences returned",
                returned, self.size
            )));
        }
        self.sequences = sequences;
        self.lent = false;
        Ok(())
    }

    pub fn is_lent(&self) -> bool {
        self.lent
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequence_mut(&mut self, index: usize) -> Option<&mut Sequence> {
        self.sequences.get_mut(index)
    }

    /// Per-processor totals over all sequences, in chain order.
    pub fn processor_statistics(&self) -> Vec<ProcessorStatistics> {
        self.options
            .iter()
            .map(|(name, options)| {
                let mut total = ClockMeasure::default();
                for sequence in &self.sequences {
                    if let Some(measure) = sequence.clock_measures().get(name) {
                        total.merge(measure);
                    }
                }
                let instances = self
                    .unique
                    .iter()
                    .filter(|item| item.name() == name)
                    .count();
                ProcessorStatistics {
                    name: name.clone(),
                    clone: options.clone,
                    critical: options.critical,
                    instances,
                    calls: total.counter,
                    app_seconds: total.app_time.as_secs_f64(),
                    proc_seconds: total.proc_time.as_secs_f64(),
                }
            })
            .collect()
    }

    /// Skip counters merged over all sequences.
    pub fn skipped_events(&self) -> BTreeMap<String, u64> {
        let mut merged = BTreeMap::new();
        for sequence in &self.sequences {
            for (reason, count) in sequence.skipped_events() {
                *merged.entry(reason.clone()).or_insert(0) += count;
            }
        }
        merged
    }

    /// Number of live handles per unique instance, keyed by processor name.
    pub fn instance_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for item in &self.unique {
            *counts.entry(item.name().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

fn lifecycle_error(item: &SequenceItem, phase: &'static str, source: ProcessorError) -> SchedulerError {
    SchedulerError::ProcessorLifecycle {
        processor: item.name().to_string(),
        phase,
        source,
    }
}
