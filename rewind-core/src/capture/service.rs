//! Capture through the privileged capture service

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::Device;
use crate::error::Result;
use crate::ipc::{CaptureChannel, DeviceParams};
use crate::types::Frame;

/// How long a frame read may block before the session is considered dead
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Device reading frames from a [`CaptureChannel`]
///
/// A failed session is dropped and the next call reconnects from scratch.
#[derive(Debug)]
pub struct ServiceCapture {
    socket_path: PathBuf,
    device: String,
    framerate: i32,
    channel: Option<CaptureChannel>,
    sessions: u64,
}

impl ServiceCapture {
    /// Create a device; no connection is made until the first frame
    pub fn new(socket_path: impl Into<PathBuf>, device: impl Into<String>, framerate: i32) -> Self {
        Self {
            socket_path: socket_path.into(),
            device: device.into(),
            framerate,
            channel: None,
            sessions: 0,
        }
    }

    /// Connect eagerly, so a missing service is reported at startup
    pub fn connect(&mut self) -> Result<&DeviceParams> {
        let channel = self.ensure_channel()?;
        Ok(channel.params())
    }

    /// Socket path of the service
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of sessions opened so far
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// Parameters of the current session, if connected
    pub fn params(&self) -> Option<&DeviceParams> {
        self.channel.as_ref().map(|c| c.params())
    }

    fn ensure_channel(&mut self) -> Result<&mut CaptureChannel> {
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => {
                let channel =
                    CaptureChannel::connect(&self.socket_path, &self.device, self.framerate)?;
                channel.set_timeout(Some(FRAME_TIMEOUT))?;
                self.sessions += 1;
                if self.sessions > 1 {
                    info!("Reconnected to capture service (session {})", self.sessions);
                }
                channel
            }
        };
        Ok(self.channel.insert(channel))
    }
}

impl Device for ServiceCapture {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let channel = self.ensure_channel()?;
        match channel.next_frame() {
            Ok(frame) => Ok(frame),
            Err(e) => {
                warn!("Capture session ended: {}", e);
                self.channel = None;
                Err(e)
            }
        }
    }

    fn name(&self) -> &str {
        &self.device
    }
}
