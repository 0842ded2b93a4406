//! gateguard - gate event admission guard
//!
//! Operator CLI over a `SQLite`-backed entity store and event ledger. Feeds
//! gate events through the guard and performs direct status writes through
//! the terminal-state filter.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gateguard_core::{GuardConfig, TaskStatus};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// gateguard - gate event admission guard
#[derive(Parser, Debug)]
#[command(name = "gateguard")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an entity at version 1
    Seed {
        /// Entity ID
        id: String,

        /// Initial status
        #[arg(long, default_value = "todo")]
        status: TaskStatus,
    },

    /// Print an entity snapshot as JSON
    Show {
        /// Entity ID
        id: String,
    },

    /// Process gate events from a JSON Lines file
    Apply {
        /// File with one event per line (`-` for stdin)
        events: PathBuf,
    },

    /// Set an entity's status through the terminal-state filter
    SetStatus {
        /// Entity ID
        id: String,

        /// New status
        status: TaskStatus,
    },

    /// Set the same status on many entities
    BulkSetStatus {
        /// New status
        status: TaskStatus,

        /// Entity IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let config = match &cli.config {
        Some(path) => GuardConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => GuardConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let backend = commands::Backend::open(&config).context("failed to open database")?;
    let mut out = io::stdout().lock();

    runtime.block_on(async {
        match cli.command {
            Commands::Seed { id, status } => commands::seed(&backend, &id, status, &mut out),
            Commands::Show { id } => commands::show(&backend, &id, &mut out).await,
            Commands::Apply { events } => commands::apply(&backend, &events, &mut out).await,
            Commands::SetStatus { id, status } => {
                commands::set_status(&backend, &[id], status, &mut out).await
            },
            Commands::BulkSetStatus { status, ids } => {
                commands::set_status(&backend, &ids, status, &mut out).await
            },
        }
    })
}
