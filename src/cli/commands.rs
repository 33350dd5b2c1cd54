//! CLI command definitions for eventforge.
//!
//! `run` drives a scheduler with a synthetic event source; `check` validates
//! a steering file without starting any worker.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use crate::app::Application;
use crate::config::AppConfig;
use crate::error::SchedulerError;
use crate::event::{Event, EventSummary, RunHeader};
use crate::metrics::{export_metrics, init_metrics};
use crate::processor::RuntimeOptions;
use crate::scheduler::{
    check_active_processors, ParallelScheduler, Scheduler, SchedulerReport, SimpleScheduler,
};

/// Default number of synthetic events.
const DEFAULT_EVENTS: u64 = 1000;

/// Sleep between polls while waiting for a free slot or the last results.
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Parallel event-processing scheduler.
#[derive(Parser)]
#[command(name = "eventforge")]
#[command(about = "Run chains of event processors across a pool of worker threads")]
#[command(version)]
#[command(
    long_about = "eventforge runs every event through an ordered chain of processors, spreading events over a fixed pool of worker threads.\n\nExample usage:\n  eventforge run --config steering.yaml --events 10000 --run-every 1000"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Process synthetic events through the configured processor chain.
    Run(RunArgs),

    /// Validate a steering file and print the resolved processor chain.
    Check(CheckArgs),
}

/// Which scheduler implementation drives the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchedulerKind {
    /// One worker thread per sequence.
    Parallel,
    /// Single sequence, events processed in-line.
    Simple,
}

/// Arguments for `eventforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Steering file (YAML).
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Number of synthetic events to push.
    #[arg(short = 'n', long, default_value_t = DEFAULT_EVENTS)]
    pub events: u64,

    /// Start a new run (and send a run header) every N events.
    #[arg(long)]
    pub run_every: Option<u64>,

    /// Override the configured concurrency ("auto" or a worker count).
    #[arg(short = 'j', long)]
    pub concurrency: Option<String>,

    /// Scheduler implementation.
    #[arg(long, value_enum, default_value_t = SchedulerKind::Parallel)]
    pub scheduler: SchedulerKind,

    /// Log failed events and continue instead of aborting.
    #[arg(long)]
    pub keep_going: bool,

    /// Write one JSON summary line per finished event to this file.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Print the report as JSON instead of the text summary.
    #[arg(long)]
    pub report_json: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `eventforge check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Steering file (YAML).
    #[arg(short = 'c', long)]
    pub config: PathBuf,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => {
            // Scheduler calls block; keep them off the async workers.
            tokio::task::spawn_blocking(move || run_command(args))
                .await
                .context("run command panicked")??;
        }
        Commands::Check(args) => {
            check_command(args)?;
        }
    }
    Ok(())
}

fn load_application(config: &Path, concurrency: Option<&str>) -> anyhow::Result<Application> {
    let mut app_config = AppConfig::from_file(config)
        .with_context(|| format!("failed to load steering file {}", config.display()))?;
    app_config.apply_env_overrides()?;
    if let Some(concurrency) = concurrency {
        app_config.global.concurrency = concurrency.parse()?;
    }
    Ok(Application::with_builtins(app_config)?)
}

fn run_command(args: RunArgs) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics()?;
    }
    let app = load_application(&args.config, args.concurrency.as_deref())?;

    let mut scheduler: Box<dyn Scheduler> = match args.scheduler {
        SchedulerKind::Parallel => Box::new(ParallelScheduler::new()),
        SchedulerKind::Simple => Box::new(SimpleScheduler::new()),
    };

    let mut writer = match &args.output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => None,
    };

    let report = drive(scheduler.as_mut(), &app, &args, |event| {
        if let Some(writer) = writer.as_mut() {
            let line = serde_json::to_string(&EventSummary::from(event.as_ref()))?;
            writeln!(writer, "{}", line)?;
        }
        Ok(())
    })?;

    if let Some(mut writer) = writer {
        writer.flush()?;
    }

    if args.report_json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report);
    }
    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

/// Pushes `args.events` synthetic events with backpressure on free slots,
/// sending a run header at the start of every run.
fn drive<F>(
    scheduler: &mut dyn Scheduler,
    app: &Application,
    args: &RunArgs,
    mut on_finished: F,
) -> anyhow::Result<SchedulerReport>
where
    F: FnMut(&Arc<Event>) -> anyhow::Result<()>,
{
    scheduler.init(app)?;

    let mut finished = Vec::new();
    let mut run_number = 0;
    let mut event_number = 0;
    scheduler.process_run_header(&RunHeader::new(run_number).with_description("synthetic"))?;

    let run_every = args.run_every.filter(|n| *n > 0);
    for uid in 0..args.events {
        if let Some(every) = run_every {
            if uid > 0 && uid % every == 0 {
                run_number += 1;
                event_number = 0;
                info!(run = run_number, "Starting new run");
                scheduler.process_run_header(
                    &RunHeader::new(run_number).with_description("synthetic"),
                )?;
            }
        }

        while scheduler.free_slots() == 0 {
            pop(scheduler, &mut finished, args.keep_going)?;
            thread::sleep(POLL_INTERVAL);
        }
        scheduler.push_event(Arc::new(Event::new(uid, run_number, event_number)))?;
        event_number += 1;

        for event in finished.drain(..) {
            on_finished(&event)?;
        }
    }

    while scheduler.pending() > 0 {
        pop(scheduler, &mut finished, args.keep_going)?;
        for event in finished.drain(..) {
            on_finished(&event)?;
        }
        thread::sleep(POLL_INTERVAL);
    }

    Ok(scheduler.end()?)
}

fn pop(
    scheduler: &mut dyn Scheduler,
    finished: &mut Vec<Arc<Event>>,
    keep_going: bool,
) -> Result<(), SchedulerError> {
    match scheduler.pop_finished_events(finished) {
        Err(SchedulerError::EventFailed { uid, source }) if keep_going => {
            warn!(uid, error = %source, "Event failed, continuing");
            Ok(())
        }
        other => other,
    }
}

fn check_command(args: CheckArgs) -> anyhow::Result<()> {
    let app = load_application(&args.config, None)?;
    check_active_processors(app.active_processors())?;

    let concurrency = app.concurrency().resolve()?;
    println!("Concurrency: {} ({})", concurrency, app.concurrency());
    println!("Processors:");
    for name in app.active_processors() {
        let params = app
            .processor_parameters(name)
            .ok_or_else(|| anyhow::anyhow!("processor '{}' is not defined", name))?;
        let instance = app.create_processor(params)?;
        let options = RuntimeOptions::resolve(instance.processor().forced_options(), params);
        println!(
            "  {:<24} type={:<16} clone={:<5} critical={:<5} condition={}",
            name,
            params.processor_type,
            options.clone,
            options.critical,
            params.condition.as_deref().unwrap_or("-")
        );
    }
    info!(config = %args.config.display(), "Steering file is valid");
    Ok(())
}
