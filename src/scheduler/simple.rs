//! Serial scheduler: one sequence, events processed in-line on push.
//!
//! Results are queued and handed out by `pop_finished_events`, so callers
//! see the same contract as with the parallel scheduler.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::app::Application;
use crate::error::{ProcessorError, SchedulerError};
use crate::event::{Event, RunHeader};
use crate::metrics::{EventStatus, MetricsCollector};

use super::build_super_sequence;
use super::report::{EventCounters, SchedulerReport, SchedulerTimings};
use super::sequence::SequenceOutcome;
use super::super_sequence::SuperSequence;
use super::Scheduler;

type Finished = (Arc<Event>, Result<SequenceOutcome, ProcessorError>);

#[derive(Debug, Default)]
pub struct SimpleScheduler {
    super_sequence: Option<SuperSequence>,
    finished: VecDeque<Finished>,
    counters: EventCounters,
    timings: SchedulerTimings,
    started_at: Option<Instant>,
    terminated: bool,
    metrics: MetricsCollector,
}

impl SimpleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn running(&mut self, operation: &'static str) -> Result<&mut SuperSequence, SchedulerError> {
        let state = if self.terminated { "terminated" } else { "unconfigured" };
        self.super_sequence
            .as_mut()
            .ok_or_else(|| SchedulerError::InvalidState {
                operation,
                state: state.to_string(),
            })
    }
}

impl Scheduler for SimpleScheduler {
    fn init(&mut self, app: &Application) -> Result<(), SchedulerError> {
        if self.terminated || self.super_sequence.is_some() {
            return Err(SchedulerError::InvalidState {
                operation: "init",
                state: if self.terminated { "terminated" } else { "running" }.to_string(),
            });
        }
        info!("Starting simple scheduler");
        self.super_sequence = Some(build_super_sequence(app, 1)?);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn push_event(&mut self, event: Arc<Event>) -> Result<(), SchedulerError> {
        let super_sequence = self.running("push event")?;
        let sequence = super_sequence.sequence_mut(0).ok_or_else(|| SchedulerError::InvalidState {
            operation: "push event",
            state: "missing sequence".to_string(),
        })?;

        let start = Instant::now();
        let outcome = sequence.process_event(&event);
        let duration = start.elapsed();

        let status = match &outcome {
            Ok(SequenceOutcome::Processed) => EventStatus::Processed,
            Ok(SequenceOutcome::Skipped(reason)) => {
                self.metrics.record_skip(reason);
                EventStatus::Skipped
            }
            Err(_) => EventStatus::Failed,
        };
        self.metrics.record_event(status, duration);
        self.counters.pushed += 1;
        self.finished.push_back((event, outcome));
        Ok(())
    }

    fn pop_finished_events(&mut self, out: &mut Vec<Arc<Event>>) -> Result<(), SchedulerError> {
        self.running("pop finished events")?;
        let start = Instant::now();
        let mut result = Ok(());
        while let Some((event, outcome)) = self.finished.pop_front() {
            let uid = event.uid();
            match outcome {
                Ok(SequenceOutcome::Processed) => {
                    self.counters.processed += 1;
                    debug!(uid, "Event finished");
                    out.push(event);
                }
                Ok(SequenceOutcome::Skipped(reason)) => {
                    self.counters.skipped += 1;
                    debug!(uid, reason = %reason, "Event skipped");
                }
                Err(source) => {
                    self.counters.failed += 1;
                    error!(uid, error = %source, "Event failed");
                    result = Err(SchedulerError::EventFailed { uid, source });
                    break;
                }
            }
        }
        self.timings.pop_time += start.elapsed();
        result
    }

    fn process_run_header(&mut self, header: &RunHeader) -> Result<(), SchedulerError> {
        let super_sequence = self.running("process run header")?;
        let start = Instant::now();
        let result = super_sequence
            .modify_run_header(header)
            .and_then(|()| super_sequence.process_run_header(header));
        self.timings.run_header_time += start.elapsed();
        self.counters.run_headers += 1;
        self.metrics.record_run_header();
        result
    }

    fn end(&mut self) -> Result<SchedulerReport, SchedulerError> {
        self.running("end")?;

        let mut leftover = Vec::new();
        while !self.finished.is_empty() {
            if let Err(err) = self.pop_finished_events(&mut leftover) {
                error!(error = %err, "Event failed while draining");
            }
        }
        self.timings.elapsed = self.started_at.map(|s| s.elapsed()).unwrap_or_default();

        let super_sequence = self.running("end")?;
        let finalized = super_sequence.end();
        let processors = super_sequence.processor_statistics();
        let skipped = super_sequence.skipped_events();
        self.metrics.record_processor_statistics(&processors);

        let report = SchedulerReport::build(
            "simple",
            1,
            self.counters,
            self.timings,
            processors,
            skipped,
            0,
        );
        info!(
            events = report.events.processed,
            processor_seconds = report.processor_seconds,
            "Processing summary"
        );

        self.terminated = true;
        self.super_sequence = None;
        finalized?;
        Ok(report)
    }

    fn free_slots(&self) -> usize {
        if self.terminated || self.super_sequence.is_none() {
            0
        } else {
            usize::MAX
        }
    }

    fn pending(&self) -> usize {
        self.finished.len()
    }
}
