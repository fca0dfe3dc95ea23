//! Rewind Core Library
//!
//! Instant replay recording for Linux: the last N seconds of the screen (and
//! optionally audio) are kept encoded in memory, and written to a file when a
//! save is triggered.
//!
//! This library provides:
//! - KMS scanout capture, either in-process or through a privileged capture
//!   service that passes DMA-BUF fds over a Unix socket
//! - Bounded per-stream retention buffers
//! - Multi-stream saving with timestamp rebasing
//! - FFmpeg encoding and muxing (with the `ffmpeg` feature)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────┐    ┌─────────────────┐
//! │ Capture Device  │───▶│ Encoder  │───▶│ RetentionBuffer │  (one per stream)
//! │ (KMS / service) │    │ (FFmpeg) │    └────────┬────────┘
//! └─────────────────┘    └──────────┘             │ snapshot
//!                                                  ▼
//!            ┌─────────┐    ┌────────────────┐    ┌───────┐
//!            │ Trigger │───▶│ SaveCoordinator│───▶│ Muxer │───▶ replay.mp4
//!            └─────────┘    └────────────────┘    └───────┘
//! ```

pub mod capture;
pub mod config;
pub mod crash;
pub mod encode;
pub mod error;
pub mod formats;
pub mod ipc;
pub mod output;
pub mod pipeline;
pub mod recorder;
pub mod retention;
pub mod save;
pub mod trigger;
pub mod types;

pub use config::{ConfigFile, ReplayConfig};
pub use error::{Result, ResultExt, RewindError};
pub use recorder::Recorder;
pub use retention::RetentionBuffer;
pub use save::{SaveCoordinator, SaveReport};
pub use trigger::{Trigger, TriggerKind};
pub use types::{EncodedUnit, StreamKind, StreamParams, TimeBase};
