//! Configuration file loading
//!
//! Loads user configuration from `~/.config/rewind/config.toml`. Every field
//! has a default, so a partial (or missing) file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{AudioConfig, ReplayConfig, VideoConfig, DEFAULT_FRAMERATE, DEFAULT_RETENTION_SECS};
use crate::capture::CaptureBackendKind;
use crate::error::{Result, RewindError};
use crate::ipc::{trigger_socket_path, AUTO_DEVICE, DEFAULT_CAPTURE_SOCKET};
use crate::output::{OutputTemplate, DEFAULT_TEMPLATE};
use crate::trigger::{TriggerKind, TriggerOptions, DEFAULT_HOTKEY};

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Retention settings
    #[serde(default)]
    pub replay: ReplaySettings,

    /// Capture source settings
    #[serde(default)]
    pub capture: CaptureSettings,

    /// Video encoder settings
    #[serde(default)]
    pub video: VideoSettings,

    /// Audio settings
    #[serde(default)]
    pub audio: AudioSettings,

    /// Output file settings
    #[serde(default)]
    pub output: OutputSettings,

    /// Save trigger settings
    #[serde(default)]
    pub trigger: TriggerSettings,
}

/// Retention settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySettings {
    /// Seconds of history to keep
    #[serde(default = "default_retention")]
    pub seconds: u32,

    /// Start saved video on a keyframe
    #[serde(default = "default_true")]
    pub start_on_keyframe: bool,
}

/// Capture source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Backend: service or kms
    #[serde(default)]
    pub backend: CaptureBackendKind,

    /// Device: auto, cardN, or cardN:plane
    #[serde(default = "default_device")]
    pub device: String,

    /// Frames per second
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Capture service socket
    #[serde(default = "default_capture_socket")]
    pub socket: PathBuf,
}

/// Video encoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    /// FFmpeg encoder name
    #[serde(default = "default_video_encoder")]
    pub encoder: String,

    /// Bitrate in kbps
    #[serde(default = "default_video_bitrate")]
    pub bitrate: u32,

    /// Encoder preset (empty = encoder default)
    #[serde(default = "default_video_preset")]
    pub preset: String,
}

/// Audio capture and encoding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Record an audio stream
    #[serde(default)]
    pub enabled: bool,

    /// PulseAudio source name
    #[serde(default = "default_audio_source")]
    pub source: String,

    /// FFmpeg encoder name
    #[serde(default = "default_audio_encoder")]
    pub encoder: String,

    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Channel count
    #[serde(default = "default_channels")]
    pub channels: u32,

    /// Bitrate in kbps
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: u32,
}

/// Output file settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// strftime template of the output path
    #[serde(default = "default_template")]
    pub template: String,

    /// Command run after each save (`{file}` is replaced by the path)
    #[serde(default)]
    pub post_save: String,
}

/// Save trigger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    /// Trigger: socket, hotkey, signal, or debug
    #[serde(default)]
    pub kind: TriggerKind,

    /// Hotkey binding
    #[serde(default = "default_hotkey")]
    pub hotkey: String,

    /// Trigger socket path (unset = per-user default)
    #[serde(default)]
    pub socket: Option<PathBuf>,
}

fn default_retention() -> u32 {
    DEFAULT_RETENTION_SECS
}

fn default_true() -> bool {
    true
}

fn default_device() -> String {
    AUTO_DEVICE.to_string()
}

fn default_framerate() -> u32 {
    DEFAULT_FRAMERATE
}

fn default_capture_socket() -> PathBuf {
    PathBuf::from(DEFAULT_CAPTURE_SOCKET)
}

fn default_video_encoder() -> String {
    VideoConfig::default().encoder
}

fn default_video_bitrate() -> u32 {
    VideoConfig::default().bitrate
}

fn default_video_preset() -> String {
    VideoConfig::default().preset.unwrap_or_default()
}

fn default_audio_source() -> String {
    AudioConfig::default().source
}

fn default_audio_encoder() -> String {
    AudioConfig::default().encoder
}

fn default_sample_rate() -> u32 {
    AudioConfig::default().sample_rate
}

fn default_channels() -> u32 {
    AudioConfig::default().channels
}

fn default_audio_bitrate() -> u32 {
    AudioConfig::default().bitrate
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

fn default_hotkey() -> String {
    DEFAULT_HOTKEY.to_string()
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            seconds: default_retention(),
            start_on_keyframe: true,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            backend: CaptureBackendKind::default(),
            device: default_device(),
            framerate: default_framerate(),
            socket: default_capture_socket(),
        }
    }
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            encoder: default_video_encoder(),
            bitrate: default_video_bitrate(),
            preset: default_video_preset(),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            source: default_audio_source(),
            encoder: default_audio_encoder(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            bitrate: default_audio_bitrate(),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            template: default_template(),
            post_save: String::new(),
        }
    }
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            kind: TriggerKind::default(),
            hotkey: default_hotkey(),
            socket: None,
        }
    }
}

impl ConfigFile {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("rewind").join("config.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("rewind")
                .join("config.toml")
        } else {
            PathBuf::from("/etc/rewind/config.toml")
        }
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from a specific path
    ///
    /// A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| RewindError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ConfigFile = toml::from_str(&content)
            .map_err(|e| RewindError::Config(format!("Failed to parse config file: {}", e)))?;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration, logging warnings but returning defaults on error
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RewindError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RewindError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = self.to_toml()?;
        std::fs::write(path, content)
            .map_err(|e| RewindError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Write the sample config to the default path if no file exists
    pub fn create_default_if_missing() -> Result<bool> {
        let path = Self::default_path();
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RewindError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }
        std::fs::write(&path, sample_config())
            .map_err(|e| RewindError::Config(format!("Failed to write config file: {}", e)))?;
        info!("Wrote sample configuration to {:?}", path);
        Ok(true)
    }

    /// Convert into a validated runtime configuration
    pub fn to_replay_config(&self) -> Result<ReplayConfig> {
        let preset = self.video.preset.trim();
        let post_save = self.output.post_save.trim();

        let config = ReplayConfig {
            retention_secs: self.replay.seconds,
            backend: self.capture.backend,
            device: self.capture.device.clone(),
            framerate: self.capture.framerate,
            capture_socket: self.capture.socket.clone(),
            video: VideoConfig {
                encoder: self.video.encoder.clone(),
                bitrate: self.video.bitrate,
                preset: (!preset.is_empty()).then(|| preset.to_string()),
            },
            audio: self.audio.enabled.then(|| AudioConfig {
                source: self.audio.source.clone(),
                encoder: self.audio.encoder.clone(),
                sample_rate: self.audio.sample_rate,
                channels: self.audio.channels,
                bitrate: self.audio.bitrate,
            }),
            output: OutputTemplate::new(self.output.template.clone())?,
            post_save: (!post_save.is_empty()).then(|| post_save.to_string()),
            start_on_keyframe: self.replay.start_on_keyframe,
            trigger: TriggerOptions {
                kind: self.trigger.kind,
                socket_path: self
                    .trigger
                    .socket
                    .clone()
                    .unwrap_or_else(trigger_socket_path),
                hotkey: self.trigger.hotkey.clone(),
            },
        };

        config.validate_strict()?;
        Ok(config)
    }
}

/// Generate a sample configuration file
pub fn sample_config() -> String {
    r#"# Rewind Configuration
# https://github.com/ghostkellz/rewind

[replay]
# Seconds of history kept in memory (1-600)
seconds = 30

# Start saved clips on a keyframe so they play from the first frame
start_on_keyframe = true

[capture]
# Backend: "service" (privileged capture service, recommended) or "kms" (in-process, needs root)
backend = "service"

# Device: "auto", "card0", or "card0:<plane id>"
device = "auto"

# Frames per second
framerate = 60

# Capture service socket
socket = "/run/rewind/capture.sock"

[video]
# Any FFmpeg video encoder: libx264, libx265, h264_vaapi, ...
encoder = "libx264"

# Bitrate in kbps
bitrate = 12000

# Encoder preset (empty = encoder default)
preset = "veryfast"

[audio]
# Record audio alongside video
enabled = false

# PulseAudio source; use "<sink>.monitor" for desktop audio
source = "default"

# Audio encoder: aac, libopus
encoder = "aac"

sample_rate = 48000
channels = 2

# Bitrate in kbps
bitrate = 160

[output]
# Output path, strftime format; ~ is your home directory
template = "~/Videos/Replay_%Y-%m-%d_%H-%M-%S.mp4"

# Command run after each save; {file} is replaced by the saved path
# and $REWIND_FILE is set
post_save = ""

[trigger]
# What saves a replay: socket, hotkey, signal (SIGUSR1), debug (Enter on stdin)
kind = "socket"

# Hotkey for kind = "hotkey"
hotkey = "alt+f10"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConfigFile::default();
        assert_eq!(config.replay.seconds, 30);
        assert_eq!(config.capture.device, "auto");
        assert_eq!(config.capture.backend, CaptureBackendKind::Service);
        assert!(!config.audio.enabled);
    }

    #[test]
    fn test_sample_config_parses() {
        let config: ConfigFile = toml::from_str(&sample_config()).unwrap();
        assert_eq!(config, ConfigFile::default());
        assert!(config.to_replay_config().is_ok());
    }

    #[test]
    fn test_partial_config() {
        let config: ConfigFile = toml::from_str(
            r#"
            [replay]
            seconds = 10

            [capture]
            backend = "kms"
            device = "card1:42"

            [audio]
            enabled = true
            channels = 1
            "#,
        )
        .unwrap();

        let replay = config.to_replay_config().unwrap();
        assert_eq!(replay.retention_secs, 10);
        assert_eq!(replay.backend, CaptureBackendKind::Kms);
        assert_eq!(replay.device, "card1:42");
        assert_eq!(replay.audio.as_ref().map(|a| a.channels), Some(1));
        assert_eq!(replay.framerate, 60);
    }

    #[test]
    fn test_bad_template_rejected() {
        let mut config = ConfigFile::default();
        config.output.template = "clip_%Q.mp4".to_string();
        assert!(config.to_replay_config().is_err());
    }
}
