//! Record command - keep the last N seconds and save on trigger

use anyhow::{Context, Result};
use clap::Args;
use rewind_core::capture::CaptureBackendKind;
use rewind_core::config::{AudioConfig, ConfigFile, ReplayConfig};
use rewind_core::output::OutputTemplate;
use rewind_core::trigger::{Trigger, TriggerKind};
use rewind_core::{crash, Recorder};
use std::path::PathBuf;
use tracing::{info, warn};

/// Arguments for the record command
#[derive(Args)]
pub struct RecordArgs {
    /// Config file (defaults to ~/.config/rewind/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds of history to keep
    #[arg(short, long)]
    seconds: Option<u32>,

    /// Capture backend (service, kms)
    #[arg(short, long)]
    backend: Option<CaptureBackendKind>,

    /// Device to capture (auto, card0, card0:31)
    #[arg(short, long)]
    device: Option<String>,

    /// Frames per second
    #[arg(short, long)]
    fps: Option<u32>,

    /// Output path template (strftime format)
    #[arg(short, long)]
    output: Option<String>,

    /// Save trigger (socket, hotkey, signal, debug)
    #[arg(short, long)]
    trigger: Option<String>,

    /// Record audio from this PulseAudio source
    #[arg(long)]
    audio: Option<String>,

    /// Command to run after each save ({file} is the saved path)
    #[arg(long)]
    post_save: Option<String>,
}

impl RecordArgs {
    fn resolve(self) -> Result<ReplayConfig> {
        let file = match &self.config {
            Some(path) => ConfigFile::load_from(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ConfigFile::load_or_default(),
        };
        let mut config = file.to_replay_config().context("Invalid configuration")?;

        if let Some(seconds) = self.seconds {
            config = config.with_retention(seconds);
        }
        if let Some(backend) = self.backend {
            config = config.with_backend(backend);
        }
        if let Some(device) = self.device {
            config = config.with_device(device);
        }
        if let Some(fps) = self.fps {
            config = config.with_framerate(fps);
        }
        if let Some(output) = self.output {
            config = config.with_output(OutputTemplate::new(output)?);
        }
        if let Some(trigger) = self.trigger {
            config.trigger.kind = trigger.parse::<TriggerKind>()?;
        }
        if let Some(source) = self.audio {
            let audio = AudioConfig {
                source,
                ..config.audio.clone().unwrap_or_default()
            };
            config = config.with_audio(audio);
        }
        if let Some(command) = self.post_save {
            config = config.with_post_save(command);
        }

        config.validate_strict()?;
        Ok(config)
    }
}

/// Start recording
pub async fn record(args: RecordArgs) -> Result<()> {
    crash::install()?;
    let config = args.resolve()?;

    info!(
        "Keeping {}s of {} at {} fps ({} backend)",
        config.retention_secs, config.device, config.framerate, config.backend
    );
    if config.backend == CaptureBackendKind::Service {
        info!("Capture service socket: {}", config.capture_socket.display());
    }

    let trigger = Trigger::open(&config.trigger)?;
    if config.trigger.kind == TriggerKind::Socket {
        println!(
            "Recording. Run `rewind save` to save the last {} seconds, Ctrl+C to stop.",
            config.retention_secs
        );
    }

    let mut recorder = match Recorder::start(&config) {
        Ok(recorder) => recorder,
        Err(e) => {
            if let Some(hint) = e.user_hint() {
                warn!("{}", hint);
            }
            return Err(e).context("Failed to start recording");
        }
    };

    recorder.run(trigger).await?;
    println!("Recording stopped.");
    Ok(())
}
