//! Screen capture devices
//!
//! This module handles:
//! - Direct KMS plane capture via DRM ioctls ([`KmsCapture`], [`KmsBackend`])
//! - Capture through the privileged service ([`ServiceCapture`])
//! - PulseAudio capture with the `ffmpeg` feature (`AudioCapture`)
//!
//! The video devices produce DMA-BUF frames; the service variant only needs
//! access to the service socket instead of CAP_SYS_ADMIN.

#[cfg(feature = "ffmpeg")]
pub mod audio;
pub mod drm;
pub mod kms;
pub mod service;

#[cfg(feature = "ffmpeg")]
pub use audio::AudioCapture;
pub use kms::{KmsBackend, KmsCapture, KmsSession};
pub use service::ServiceCapture;

use std::time::{Duration, Instant};

use crate::error::Result;
use crate::types::Frame;

/// A source of raw video frames
pub trait Device: Send {
    /// Wait for the next frame
    ///
    /// `Ok(None)` means no frame was available this attempt; the caller
    /// should simply try again. Errors are transient from the device's point
    /// of view and the caller decides whether to retry.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Human readable device name
    fn name(&self) -> &str;
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Which capture path to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackendKind {
    /// Frames from the privileged capture service
    #[default]
    Service,
    /// Direct KMS access (needs CAP_SYS_ADMIN)
    Kms,
}

impl std::fmt::Display for CaptureBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureBackendKind::Service => write!(f, "service"),
            CaptureBackendKind::Kms => write!(f, "kms"),
        }
    }
}

impl std::str::FromStr for CaptureBackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "service" => Ok(CaptureBackendKind::Service),
            "kms" | "drm" => Ok(CaptureBackendKind::Kms),
            _ => Err(format!("Unknown capture backend: {}. Use: service, kms", s)),
        }
    }
}

/// Fixed-rate tick source for capture loops
///
/// Falls back to "now" instead of bursting when a tick is missed.
#[derive(Debug)]
pub(crate) struct Pacer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(framerate: i32) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / framerate.max(1) as f64),
            deadline: None,
        }
    }

    /// Sleep until the next tick
    pub(crate) fn wait(&mut self) {
        let now = Instant::now();
        let deadline = match self.deadline {
            Some(deadline) => deadline,
            None => now,
        };
        if deadline > now {
            std::thread::sleep(deadline - now);
            self.deadline = Some(deadline + self.interval);
        } else {
            self.deadline = Some(now + self.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("kms".parse::<CaptureBackendKind>().unwrap(), CaptureBackendKind::Kms);
        assert_eq!("Service".parse::<CaptureBackendKind>().unwrap(), CaptureBackendKind::Service);
        assert!("x11".parse::<CaptureBackendKind>().is_err());
    }

    #[test]
    fn test_pacer_spaces_ticks() {
        let mut pacer = Pacer::new(100);
        let start = Instant::now();
        for _ in 0..4 {
            pacer.wait();
        }
        // first tick is immediate, the next three wait 10ms each
        assert!(start.elapsed() >= Duration::from_millis(29));
    }
}
