//! Save command - ask a running recorder to save its window

use anyhow::{Context, Result};
use clap::Args;
use rewind_core::ipc::trigger_socket_path;
use rewind_core::trigger::request_save;
use std::path::PathBuf;

/// Arguments for the save command
#[derive(Args)]
pub struct SaveArgs {
    /// Trigger socket of the recorder
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

/// Request a save over the trigger socket
pub async fn save(args: SaveArgs) -> Result<()> {
    let path = args.socket.unwrap_or_else(trigger_socket_path);
    request_save(&path)
        .await
        .context("Is `rewind record` running with the socket trigger?")?;
    println!("Save requested.");
    Ok(())
}
