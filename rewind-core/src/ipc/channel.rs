//! Client side of the capture channel
//!
//! Connects to the privileged capture service to receive DMA-BUF frames
//! without needing access to the DRM device itself.

use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::protocol::{recv_codec_params, recv_frame, Connect, DeviceParams};
use crate::error::{Result, RewindError};
use crate::types::Frame;

/// An open session with the capture service
#[derive(Debug)]
pub struct CaptureChannel {
    stream: UnixStream,
    path: PathBuf,
    params: DeviceParams,
    device_fd: OwnedFd,
}

impl CaptureChannel {
    /// Connect to the service at `path` and request `device` at `framerate`
    ///
    /// Fails with `ServiceUnavailable` if nothing listens at `path` or the
    /// service refuses the device.
    pub fn connect(path: impl AsRef<Path>, device: &str, framerate: i32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let request = Connect::new(device, framerate)?;

        let mut stream = UnixStream::connect(&path).map_err(|e| {
            RewindError::service_unavailable(format!(
                "Failed to connect to capture service at {:?}: {}",
                path, e
            ))
        })?;
        debug!("Connected to capture service at {:?}", path);

        stream.write_all(&request.to_bytes()).map_err(|e| {
            RewindError::service_unavailable(format!("Capture service closed the connection: {}", e))
        })?;
        let (params, device_fd) = recv_codec_params(&stream)?;

        info!(
            "Capture session open: {} {}x{} fourcc={:#010x} @ {} fps",
            params.device, params.width, params.height, params.fourcc, params.framerate
        );

        Ok(Self {
            stream,
            path,
            params,
            device_fd,
        })
    }

    /// Device parameters announced by the service
    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    /// Device fd needed to interpret the frame buffers
    pub fn device_fd(&self) -> BorrowedFd<'_> {
        self.device_fd.as_fd()
    }

    /// Socket path this channel is connected to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bound how long [`next_frame`](Self::next_frame) may block
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Receive the next frame message
    ///
    /// `Ok(None)` means the service had no frame for this attempt. Any error
    /// ends the session; reconnect with [`connect`](Self::connect).
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        recv_frame(&self.stream)
    }
}
