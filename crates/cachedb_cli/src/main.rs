//! cachedb CLI
//!
//! Command-line tools for cachedb inventory stores.
//!
//! # Commands
//!
//! - `inspect` - Show entity counts, sync progress, and identity
//! - `dump-journal` - List journal frames for debugging
//! - `sync` - Turn the persisted sync flag on or off, or show it
//! - `seed-preview` - Write the preview data set into a store

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// cachedb command-line store tools.
#[derive(Parser)]
#[command(name = "cachedb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show entity counts, sync progress, and identity
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List journal frames for debugging
    DumpJournal {
        /// Maximum number of frames to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Turn the persisted sync flag on or off, or show it
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Write the preview data set into a store, creating it if needed
    SeedPreview,
}

#[derive(Subcommand)]
enum SyncAction {
    /// Turn sync on
    Enable,
    /// Turn sync off; the store stays local-only
    Disable,
    /// Show the flag and sync progress
    Status,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let path = cli.path.ok_or("store path required (--path)")?;
    match cli.command {
        Commands::Inspect { format } => commands::inspect::run(&path, format).await?,
        Commands::DumpJournal { limit, format } => {
            commands::dump_journal::run(&path, limit, format)?;
        }
        Commands::Sync { action } => {
            let action = match action {
                SyncAction::Enable => commands::sync_flag::Action::Enable,
                SyncAction::Disable => commands::sync_flag::Action::Disable,
                SyncAction::Status => commands::sync_flag::Action::Status,
            };
            commands::sync_flag::run(&path, action).await?;
        }
        Commands::SeedPreview => commands::seed::run(&path).await?,
    }

    Ok(())
}
