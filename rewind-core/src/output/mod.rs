//! Replay file output
//!
//! - [`Muxer`]: container writer interface used by the save path
//! - [`OutputTemplate`]: time-formatted output file names
//! - `FfmpegMuxer` (with the `ffmpeg` feature): MP4/MKV writer via FFmpeg

#[cfg(feature = "ffmpeg")]
mod file;

#[cfg(feature = "ffmpeg")]
pub use file::FfmpegMuxer;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, RewindError};
use crate::types::{EncodedUnit, StreamParams};

/// Default output file name template
pub const DEFAULT_TEMPLATE: &str = "~/Videos/Replay_%Y-%m-%d_%H-%M-%S.mp4";

/// Container writer
///
/// One muxer instance is reused for every save: `open` starts a new file and
/// either `close` or `abort` ends it.
pub trait Muxer: Send {
    /// Start a new output file at `path`
    fn open(&mut self, path: &Path) -> Result<()>;

    /// Declare a track; returns its index
    fn add_track(&mut self, params: &StreamParams) -> Result<usize>;

    /// Write the container header (after all tracks are declared)
    fn write_header(&mut self) -> Result<()>;

    /// Write one unit; `unit.stream_index` is the track index
    fn write(&mut self, unit: &EncodedUnit) -> Result<()>;

    /// Write the trailer and close the file
    fn close(&mut self) -> Result<()>;

    /// Drop the current file, removing anything written so far
    fn abort(&mut self);
}

impl<M: Muxer + ?Sized> Muxer for Box<M> {
    fn open(&mut self, path: &Path) -> Result<()> {
        (**self).open(path)
    }

    fn add_track(&mut self, params: &StreamParams) -> Result<usize> {
        (**self).add_track(params)
    }

    fn write_header(&mut self) -> Result<()> {
        (**self).write_header()
    }

    fn write(&mut self, unit: &EncodedUnit) -> Result<()> {
        (**self).write(unit)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn abort(&mut self) {
        (**self).abort()
    }
}

/// strftime-style output path template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTemplate {
    template: String,
}

impl OutputTemplate {
    /// Validate a template such as `~/Videos/Replay_%Y-%m-%d.mp4`
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(RewindError::config("Output template is empty"));
        }
        if StrftimeItems::new(&template).any(|item| matches!(item, Item::Error)) {
            return Err(RewindError::config(format!(
                "Invalid time format in output template '{}'",
                template
            )));
        }
        Ok(Self { template })
    }

    /// The raw template string
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Render the path for `time`, with `~` expanded
    pub fn render(&self, time: &DateTime<Local>) -> Result<PathBuf> {
        let mut rendered = String::new();
        write!(
            rendered,
            "{}",
            time.format_with_items(StrftimeItems::new(&self.template))
        )
        .map_err(|_| RewindError::config(format!("Cannot format '{}'", self.template)))?;
        Ok(expand_home(&rendered))
    }

    /// Render the path for the current time and create its parent directories
    pub fn prepare(&self) -> Result<PathBuf> {
        let path = self.render(&Local::now())?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating output directory {:?}", parent);
                std::fs::create_dir_all(parent).map_err(|e| {
                    RewindError::Io(e).with_context(format!("Failed to create {:?}", parent))
                })?;
            }
        }
        Ok(path)
    }
}

impl Default for OutputTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl std::fmt::Display for OutputTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.template)
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_render_template() {
        let template = OutputTemplate::new("/tmp/replays/Replay_%Y-%m-%d_%H-%M-%S.mp4").unwrap();
        let time = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            template.render(&time).unwrap(),
            PathBuf::from("/tmp/replays/Replay_2024-03-09_14-05-07.mp4")
        );
    }

    #[test]
    fn test_invalid_template() {
        assert!(OutputTemplate::new("").is_err());
        assert!(OutputTemplate::new("replay_%Q.mp4").is_err());
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/Videos/a.mp4"), home.join("Videos/a.mp4"));
        }
        assert_eq!(expand_home("/abs/a.mp4"), PathBuf::from("/abs/a.mp4"));
        assert_eq!(expand_home("~user/a.mp4"), PathBuf::from("~user/a.mp4"));
    }

    #[test]
    fn test_prepare_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let template =
            OutputTemplate::new(format!("{}/nested/deeper/out_%Y.mp4", dir.path().display()))
                .unwrap();
        let path = template.prepare().unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert!(!path.exists());
    }
}
