//! Command-line interface for eventforge.
//!
//! Provides commands for running a processor chain over synthetic events
//! and for validating steering files.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, SchedulerKind};
