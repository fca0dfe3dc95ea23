//! Configuration types for Rewind
//!
//! [`ReplayConfig`] is the validated runtime configuration of a recorder.
//! [`ConfigFile`] is its on-disk TOML form.

mod file;

pub use file::{sample_config, ConfigFile};

use std::path::PathBuf;

use crate::capture::CaptureBackendKind;
use crate::error::{Result, RewindError};
use crate::ipc::{capture_socket_path, AUTO_DEVICE};
use crate::output::OutputTemplate;
use crate::trigger::TriggerOptions;

/// Default retention window in seconds
pub const DEFAULT_RETENTION_SECS: u32 = 30;

/// Longest accepted retention window
pub const MAX_RETENTION_SECS: u32 = 600;

/// Default capture framerate
pub const DEFAULT_FRAMERATE: u32 = 60;

/// Video encoding settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConfig {
    /// FFmpeg encoder name ("libx264", "h264_vaapi", ...)
    pub encoder: String,
    /// Target bitrate in kbps
    pub bitrate: u32,
    /// Encoder speed preset, if the encoder takes one
    pub preset: Option<String>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            encoder: "libx264".to_string(),
            bitrate: 12_000,
            preset: Some("veryfast".to_string()),
        }
    }
}

/// Audio capture and encoding settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    /// PulseAudio source ("default", or a monitor source for desktop audio)
    pub source: String,
    /// FFmpeg encoder name ("aac", "libopus")
    pub encoder: String,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u32,
    /// Target bitrate in kbps
    pub bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            source: "default".to_string(),
            encoder: "aac".to_string(),
            sample_rate: 48_000,
            channels: 2,
            bitrate: 160,
        }
    }
}

/// Runtime configuration of a replay recorder
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Seconds of history kept per stream
    pub retention_secs: u32,
    /// Where frames come from
    pub backend: CaptureBackendKind,
    /// Device to capture ("auto", "card0", "card0:31")
    pub device: String,
    /// Capture framerate
    pub framerate: u32,
    /// Capture service socket (service backend)
    pub capture_socket: PathBuf,
    /// Video encoding
    pub video: VideoConfig,
    /// Audio stream, if recorded
    pub audio: Option<AudioConfig>,
    /// Output file name template
    pub output: OutputTemplate,
    /// Shell command run after each save
    pub post_save: Option<String>,
    /// Start saved video on a keyframe
    pub start_on_keyframe: bool,
    /// What requests a save
    pub trigger: TriggerOptions,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            retention_secs: DEFAULT_RETENTION_SECS,
            backend: CaptureBackendKind::default(),
            device: AUTO_DEVICE.to_string(),
            framerate: DEFAULT_FRAMERATE,
            capture_socket: capture_socket_path(),
            video: VideoConfig::default(),
            audio: None,
            output: OutputTemplate::default(),
            post_save: None,
            start_on_keyframe: true,
            trigger: TriggerOptions::default(),
        }
    }
}

impl ReplayConfig {
    /// Set the retention window
    pub fn with_retention(mut self, secs: u32) -> Self {
        self.retention_secs = secs;
        self
    }

    /// Set the capture backend
    pub fn with_backend(mut self, backend: CaptureBackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the capture device
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    /// Set the capture framerate
    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    /// Set the output template
    pub fn with_output(mut self, output: OutputTemplate) -> Self {
        self.output = output;
        self
    }

    /// Enable audio capture
    pub fn with_audio(mut self, audio: AudioConfig) -> Self {
        self.audio = Some(audio);
        self
    }

    /// Set the post-save command
    pub fn with_post_save(mut self, command: impl Into<String>) -> Self {
        self.post_save = Some(command.into());
        self
    }

    /// Whether an audio stream is recorded
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Validate configuration, returning soft warnings
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.retention_secs > 120 && self.video.bitrate > 20_000 {
            let mb = self.retention_secs as u64 * self.video.bitrate as u64 / 8 / 1000;
            warnings.push(format!(
                "{}s at {} kbps keeps about {} MB of video in memory",
                self.retention_secs, self.video.bitrate, mb
            ));
        }

        if self.framerate > 144 {
            warnings.push(format!(
                "{} fps is very high; the encoder may not keep up",
                self.framerate
            ));
        }

        // SAFETY: geteuid has no preconditions and cannot fail.
        let is_root = unsafe { libc::geteuid() } == 0;
        if self.backend == CaptureBackendKind::Kms && !is_root {
            warnings.push(
                "In-process KMS capture usually needs root or CAP_SYS_ADMIN; consider the capture service"
                    .to_string(),
            );
        }

        warnings
    }

    /// Validate configuration, returning hard errors
    pub fn validate_strict(&self) -> Result<()> {
        if self.retention_secs == 0 || self.retention_secs > MAX_RETENTION_SECS {
            return Err(RewindError::config(format!(
                "Retention must be between 1 and {} seconds, got {}",
                MAX_RETENTION_SECS, self.retention_secs
            )));
        }

        if self.framerate == 0 || self.framerate > 240 {
            return Err(RewindError::config(format!(
                "Framerate must be between 1 and 240, got {}",
                self.framerate
            )));
        }

        if self.video.encoder.trim().is_empty() {
            return Err(RewindError::config("Video encoder name is empty"));
        }

        if self.video.bitrate == 0 {
            return Err(RewindError::config("Video bitrate must be positive"));
        }

        if let Some(audio) = &self.audio {
            if !matches!(audio.channels, 1 | 2) {
                return Err(RewindError::config(format!(
                    "Audio must be mono or stereo, got {} channels",
                    audio.channels
                )));
            }
            if audio.sample_rate < 8_000 || audio.sample_rate > 192_000 {
                return Err(RewindError::config(format!(
                    "Unsupported audio sample rate {}",
                    audio.sample_rate
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ReplayConfig::default();
        assert!(config.validate_strict().is_ok());
        assert_eq!(config.retention_secs, 30);
        assert_eq!(config.device, "auto");
        assert!(!config.has_audio());
    }

    #[test]
    fn test_validate_strict_rejects_bad_values() {
        assert!(ReplayConfig::default().with_retention(0).validate_strict().is_err());
        assert!(ReplayConfig::default().with_retention(601).validate_strict().is_err());
        assert!(ReplayConfig::default().with_framerate(0).validate_strict().is_err());

        let audio = AudioConfig {
            channels: 6,
            ..AudioConfig::default()
        };
        assert!(ReplayConfig::default().with_audio(audio).validate_strict().is_err());
    }

    #[test]
    fn test_memory_warning() {
        let mut config = ReplayConfig::default().with_retention(300);
        config.video.bitrate = 50_000;
        assert!(config.validate().iter().any(|w| w.contains("MB")));
    }
}
