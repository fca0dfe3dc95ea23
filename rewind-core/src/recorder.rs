//! The replay recorder
//!
//! A [`Recorder`] owns everything a running instance needs: one worker and
//! retention buffer per stream, the save coordinator, and the shutdown flag.
//! Its [`run`](Recorder::run) loop waits for save triggers until Ctrl+C or
//! SIGTERM.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::config::ReplayConfig;
use crate::error::{Result, RewindError};
use crate::output::Muxer;
use crate::pipeline::{StreamWorker, UnitSource};
use crate::retention::RetentionBuffer;
use crate::save::{SaveCoordinator, SaveReport};
use crate::trigger::Trigger;
use crate::types::StreamKind;

/// Running replay recorder
pub struct Recorder {
    retention_secs: u32,
    coordinator: Arc<Mutex<SaveCoordinator>>,
    buffers: Vec<Arc<RetentionBuffer>>,
    workers: Vec<StreamWorker>,
    shutdown: Arc<AtomicBool>,
}

impl Recorder {
    /// Create a recorder with no streams yet
    pub fn new(config: &ReplayConfig, muxer: Box<dyn Muxer>) -> Self {
        let coordinator = SaveCoordinator::new(muxer, config.output.clone())
            .with_start_on_keyframe(config.start_on_keyframe)
            .with_post_save(config.post_save.clone());

        Self {
            retention_secs: config.retention_secs,
            coordinator: Arc::new(Mutex::new(coordinator)),
            buffers: Vec::new(),
            workers: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build a recorder for `config` with FFmpeg encoders and container output
    #[cfg(feature = "ffmpeg")]
    pub fn start(config: &ReplayConfig) -> Result<Self> {
        config.validate_strict()?;
        for warning in config.validate() {
            warn!("{}", warning);
        }

        let mut recorder = Self::new(config, Box::new(crate::output::FfmpegMuxer::new()));
        recorder.add_stream(sources::video(config)?)?;
        if let Some(audio) = &config.audio {
            recorder.add_stream(sources::audio(audio)?)?;
        }
        Ok(recorder)
    }

    /// Without FFmpeg there is nothing to encode with
    #[cfg(not(feature = "ffmpeg"))]
    pub fn start(_config: &ReplayConfig) -> Result<Self> {
        Err(RewindError::Unsupported(
            "recording needs the 'ffmpeg' feature".to_string(),
        ))
    }

    /// Retain the units of `source` and include them in saves
    ///
    /// Add video streams before audio streams. Returns the stream index.
    pub fn add_stream(&mut self, source: Box<dyn UnitSource>) -> Result<usize> {
        let params = source.params().clone();
        if params.kind == StreamKind::Video
            && self.buffers.iter().any(|b| b.kind() == StreamKind::Audio)
        {
            return Err(RewindError::config("Video streams must be added before audio"));
        }

        let buffer = Arc::new(RetentionBuffer::new(&params, self.retention_secs));
        info!(
            "Stream {}: {} ({}), {} slots for {}s",
            self.buffers.len(),
            params.kind,
            params.codec,
            buffer.capacity(),
            self.retention_secs
        );

        let index = self.coordinator.lock().track(params, Arc::clone(&buffer));
        let worker = StreamWorker::spawn(index, source, Arc::clone(&buffer), Arc::clone(&self.shutdown))?;
        self.buffers.push(buffer);
        self.workers.push(worker);
        Ok(index)
    }

    /// Retention buffers in stream order
    pub fn buffers(&self) -> &[Arc<RetentionBuffer>] {
        &self.buffers
    }

    /// Capture workers in stream order
    pub fn workers(&self) -> &[StreamWorker] {
        &self.workers
    }

    /// Save the retained window now
    ///
    /// Runs on the blocking pool; concurrent calls are serialized.
    pub async fn save(&self) -> Result<SaveReport> {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::task::spawn_blocking(move || coordinator.lock().save())
            .await
            .map_err(|e| RewindError::save(format!("Save task failed: {}", e)))?
    }

    /// Wait for triggers and save on each, until Ctrl+C or SIGTERM
    ///
    /// A save in progress always finishes before shutdown is observed.
    pub async fn run(&mut self, mut trigger: Trigger) -> Result<()> {
        // Both streams live across iterations so a signal that lands during a
        // save is still seen afterwards
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        info!("Recording; {} trigger armed", trigger.kind());

        loop {
            tokio::select! {
                result = trigger.wait() => {
                    if let Err(e) = result {
                        error!("Trigger failed: {}", e);
                        break;
                    }
                    match self.save().await {
                        Ok(report) => info!("Replay saved to {}", report.path.display()),
                        Err(e) => {
                            error!("Save failed: {}", e);
                            if let Some(hint) = e.user_hint() {
                                warn!("{}", hint);
                            }
                        }
                    }
                }
                _ = sigint.recv() => {
                    info!("Received interrupt, stopping");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, stopping");
                    break;
                }
            }

            if self.workers.iter().all(StreamWorker::is_finished) {
                warn!("All capture workers exited, stopping");
                break;
            }
        }

        self.stop();
        Ok(())
    }

    /// Stop and join every worker
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            debug!(
                "Stopping {} ({} units, {} errors)",
                worker.name(),
                worker.stats().units(),
                worker.stats().errors()
            );
            worker.join();
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "ffmpeg")]
mod sources {
    //! Device + encoder assembly for each configured stream

    use tracing::info;

    use crate::capture::{AudioCapture, CaptureBackendKind, KmsCapture, ServiceCapture};
    use crate::config::{AudioConfig, ReplayConfig};
    use crate::encode::{AudioEncoder, VideoEncoder};
    use crate::error::Result;
    use crate::pipeline::{EncodePipeline, UnitSource};

    pub(super) fn video(config: &ReplayConfig) -> Result<Box<dyn UnitSource>> {
        let framerate = config.framerate as i32;
        let video = &config.video;

        match config.backend {
            CaptureBackendKind::Service => {
                let mut device =
                    ServiceCapture::new(&config.capture_socket, &config.device, framerate);
                let params = device.connect()?;
                info!(
                    "Capturing {} ({}x{}) through {:?}",
                    params.device,
                    params.width,
                    params.height,
                    config.capture_socket
                );
                let encoder = VideoEncoder::new(
                    &video.encoder,
                    params.width,
                    params.height,
                    params.framerate as u32,
                    video.bitrate,
                    video.preset.as_deref(),
                )?;
                Ok(Box::new(EncodePipeline::new(device, encoder)))
            }
            CaptureBackendKind::Kms => {
                let device = KmsCapture::open(&config.device, framerate)?;
                let params = device.params();
                let encoder = VideoEncoder::new(
                    &video.encoder,
                    params.width,
                    params.height,
                    params.framerate as u32,
                    video.bitrate,
                    video.preset.as_deref(),
                )?;
                Ok(Box::new(EncodePipeline::new(device, encoder)))
            }
        }
    }

    pub(super) fn audio(audio: &AudioConfig) -> Result<Box<dyn UnitSource>> {
        let encoder =
            AudioEncoder::new(&audio.encoder, audio.sample_rate, audio.channels, audio.bitrate)?;
        Ok(Box::new(AudioCapture::open(&audio.source, encoder)?))
    }
}
