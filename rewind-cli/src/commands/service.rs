//! Capture service command - serve KMS frames over the capture socket

use anyhow::{Context, Result};
use clap::Args;
use rewind_core::capture::KmsBackend;
use rewind_core::crash;
use rewind_core::ipc::{CaptureService, ServiceOptions, AUTO_DEVICE, DEFAULT_CAPTURE_SOCKET};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Arguments for the capture-service command
#[derive(Args)]
pub struct ServiceArgs {
    /// Socket to listen on
    #[arg(short, long, default_value = DEFAULT_CAPTURE_SOCKET)]
    socket: PathBuf,

    /// Card opened at startup (auto, card0, ...)
    #[arg(short, long, default_value = AUTO_DEVICE)]
    device: String,

    /// Socket file mode (octal)
    #[arg(long, default_value = "666")]
    mode: String,

    /// Only accept clients with this uid (repeatable)
    #[arg(long = "allow-uid")]
    allow_uids: Vec<u32>,
}

/// Run the capture service until Ctrl+C or SIGTERM
pub async fn capture_service(args: ServiceArgs) -> Result<()> {
    crash::install()?;

    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root; reading other clients' framebuffers usually needs CAP_SYS_ADMIN");
    }

    let socket_mode = u32::from_str_radix(&args.mode, 8)
        .with_context(|| format!("Invalid socket mode '{}'", args.mode))?;

    let backend = KmsBackend::open(&args.device).context("Failed to open the display device")?;
    let options = ServiceOptions {
        socket_path: args.socket,
        socket_mode,
        allowed_uids: args.allow_uids,
        ..ServiceOptions::default()
    };
    let mut service = CaptureService::bind(backend, options)?;
    let running = service.shutdown_handle();

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received interrupt, stopping"),
            _ = sigterm.recv() => info!("Received SIGTERM, stopping"),
        }
        running.store(false, Ordering::SeqCst);
    });

    tokio::task::spawn_blocking(move || service.run())
        .await
        .context("Capture service thread panicked")??;
    Ok(())
}
