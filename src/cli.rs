//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Inspect and operate retry queues and their dead letters.
#[derive(Parser, Debug)]
#[command(name = "retry-dlq", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/config/retry-dlq.yaml", env = "CONFIG_PATH", global = true)]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Returns the log level based on verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration file.
    #[command(name = "config-validate")]
    ConfigValidate,

    /// Display the parsed configuration.
    #[command(name = "config-show")]
    ConfigShow,

    /// List the dead-lettered jobs of a domain.
    #[command(name = "dlq-list")]
    DlqList(DomainArgs),

    /// Move a dead-lettered job back to its retry queue.
    #[command(name = "dlq-revive")]
    DlqRevive {
        #[command(flatten)]
        domain: DomainArgs,

        /// The job ID to revive.
        job_id: String,
    },

    /// Add a JSON payload to a domain's retry queue.
    Enqueue {
        #[command(flatten)]
        domain: DomainArgs,

        /// Job payload as JSON.
        payload: String,
    },

    /// Show job counts per state for a domain's queue.
    #[command(name = "queue-stats")]
    QueueStats(DomainArgs),

    /// Pause a domain's queue.
    #[command(name = "queue-pause")]
    QueuePause(DomainArgs),

    /// Resume a domain's queue.
    #[command(name = "queue-resume")]
    QueueResume(DomainArgs),
}

/// Selects a configured domain.
#[derive(Args, Debug)]
pub struct DomainArgs {
    /// Domain name as configured under `domains`.
    pub domain: String,
}
