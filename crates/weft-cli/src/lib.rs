//! Weft CLI
//!
//! Management commands work against the database alone. The `worker`
//! command needs the process to know the application's workflow and
//! activity definitions, so embedders call [`run`] from their own binary
//! with a populated [`Registry`]; the stock `weft` binary runs with an
//! empty one.

mod commands;

use clap::{Parser, Subcommand};

use weft_runtime::Registry;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:.weft/weft.db?mode=rwc";

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Weft - durable workflow orchestration")]
#[command(version)]
pub struct Cli {
    /// Database URL
    #[arg(long, env = "WEFT_DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a worker pool until interrupted
    Worker {
        /// Number of concurrent drivers
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Seconds between task queue polls
        #[arg(long, default_value_t = 0.5)]
        poll_interval: f64,
    },

    /// Create the database and run migrations
    Init,

    /// List workflows
    List {
        /// Filter by status (RUNNING, COMPLETED, FAILED, CANCELED)
        #[arg(long)]
        status: Option<String>,

        /// Maximum rows to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Show one workflow
    Inspect {
        /// Workflow id
        workflow_id: String,

        /// Also print the event log
        #[arg(long)]
        events: bool,
    },

    /// Show aggregate counts
    Stats,

    /// Delete the database, backing it up first
    Clean {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,

        /// Do not keep a backup copy
        #[arg(long)]
        no_backup: bool,
    },
}

/// Parse arguments and run a command with the given registry.
pub async fn run(registry: Registry) -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli, registry).await
}
