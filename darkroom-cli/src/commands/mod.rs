//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;
mod status;

pub use job::JobCommands;
pub use status::StatusCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Job submission and inspection
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Queue metrics, worker pool and cache
    Status {
        #[command(subcommand)]
        command: StatusCommands,
    },
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Job { command } => job::handle_job_command(command, config).await,
        Commands::Status { command } => status::handle_status_command(command, config).await,
    }
}
