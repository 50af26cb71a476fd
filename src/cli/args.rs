//! CLI argument definitions using clap
//!
//! Commands:
//! - hafailover run --config <path>
//! - hafailover event --config <path> <ifname> <event>
//! - hafailover simulate <ifname> <event> [--pool ...] [--fencing ...]
//! - hafailover check-boot --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default daemon settings file
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/hafailover.json";

/// hafailover - HA failover event engine for dual-controller appliances
#[derive(Parser, Debug)]
#[command(name = "hafailover")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the engine, reading role events from the keepalived FIFO
    Run {
        /// Path to settings file
        #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
        config: PathBuf,
    },

    /// Hand one role event to the running daemon through its FIFO
    Event {
        /// Path to settings file
        #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
        config: PathBuf,

        /// Interface the event is for
        ifname: String,

        /// MASTER, BACKUP or forcetakeover
        event: String,
    },

    /// Run one event against a simulated appliance and print the report
    Simulate {
        /// Interface the event is for
        ifname: String,

        /// MASTER, BACKUP or forcetakeover
        event: String,

        /// Offline pool to import (repeatable)
        #[arg(long = "pool")]
        pools: Vec<String>,

        /// Pools start imported (for BACKUP runs)
        #[arg(long)]
        imported: bool,

        /// Fencing exit codes for successive attempts, e.g. 2,2,0
        #[arg(long, value_delimiter = ',')]
        fencing: Vec<i32>,

        /// Enabled services (repeatable)
        #[arg(long = "service")]
        services: Vec<String>,
    },

    /// Classify the previous boot from the watchdog sentinel
    CheckBoot {
        /// Path to settings file
        #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_arguments() {
        let cli = Cli::try_parse_from([
            "hafailover",
            "simulate",
            "eth0",
            "MASTER",
            "--pool",
            "tank",
            "--pool",
            "dozer",
            "--fencing",
            "2,0",
        ])
        .unwrap();

        match cli.command {
            Command::Simulate {
                ifname,
                pools,
                fencing,
                ..
            } => {
                assert_eq!(ifname, "eth0");
                assert_eq!(pools, vec!["tank".to_string(), "dozer".to_string()]);
                assert_eq!(fencing, vec![2, 0]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_default_settings_path() {
        let cli = Cli::try_parse_from(["hafailover", "--log-json", "run"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Command::Run { config } if config == PathBuf::from(DEFAULT_SETTINGS_PATH)));
    }
}
