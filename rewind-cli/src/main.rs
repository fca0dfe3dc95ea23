//! Rewind CLI
//!
//! Instant replay recording for Linux.
//!
//! # Usage
//!
//! ```bash
//! # Run the capture service (as root)
//! sudo rewind capture-service
//!
//! # Keep the last 30 seconds in memory
//! rewind record --seconds 30
//!
//! # Save them
//! rewind save
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Rewind - instant replay recording for Linux
#[derive(Parser)]
#[command(name = "rewind")]
#[command(author = "GhostKellz")]
#[command(version)]
#[command(about = "Keep the last seconds of your screen, save them on demand", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record continuously and save the retained window on trigger
    #[command(alias = "rec")]
    Record(commands::RecordArgs),

    /// Ask a running recorder to save now
    Save(commands::SaveArgs),

    /// Serve KMS frames to unprivileged recorders (run as root)
    CaptureService(commands::ServiceArgs),

    /// Manage the configuration file
    Config(commands::ConfigArgs),

    /// Show capture devices and encoder support
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("rewind_core={}", level).parse()?)
                .add_directive(format!("rewind={}", level).parse()?),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Record(args) => commands::record(args).await?,
        Commands::Save(args) => commands::save(args).await?,
        Commands::CaptureService(args) => commands::capture_service(args).await?,
        Commands::Config(args) => commands::config(args).await?,
        Commands::Info => commands::info().await?,
    }

    Ok(())
}
