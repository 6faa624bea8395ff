use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tarsy", about = "Runs an alert through a configured processing chain")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process one alert through its matching chain to a terminal session.
    Run {
        /// Path to the runtime config (providers, agents, chains).
        #[arg(short, long)]
        config: PathBuf,
        /// Path to a JSON file holding the incoming alert.
        #[arg(short, long)]
        alert: PathBuf,
        /// Identity recorded as the session's author.
        #[arg(long, default_value = "cli")]
        author: String,
    },
    /// Deletes sessions older than the given retention window.
    Retention {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        older_than_days: i64,
    },
}
