//! CLI module for hafailover
//!
//! Provides command-line interface for:
//! - run: Start the engine and consume role events from the FIFO
//! - event: Deliver one role event and print its report
//! - simulate: Dry-run one event against a simulated appliance
//! - check-boot: Classify the previous boot from the watchdog sentinel

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, DEFAULT_SETTINGS_PATH};
pub use commands::{run, run_command, EngineSettings, Scenario};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
