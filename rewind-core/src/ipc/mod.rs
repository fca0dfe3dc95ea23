//! Local IPC for Rewind
//!
//! Two Unix socket endpoints exist:
//!
//! - the capture channel, where the privileged [`CaptureService`] hands
//!   DMA-BUF frames to an unprivileged [`CaptureChannel`]
//! - the save trigger socket, where any connection means "save now"
//!   (served by [`crate::trigger`])

mod channel;
pub mod fd_passing;
pub mod protocol;
mod server;

pub use channel::CaptureChannel;
pub use protocol::{Connect, DeviceParams, FrameRecord, AUTO_DEVICE, NO_FRAME};
pub use server::{CaptureBackend, CaptureService, CaptureSession, ServiceOptions};

use std::path::PathBuf;

/// Default path of the capture service socket
pub const DEFAULT_CAPTURE_SOCKET: &str = "/run/rewind/capture.sock";

/// Default path of the capture service socket
pub fn capture_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_CAPTURE_SOCKET)
}

/// Get the save trigger socket path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp
pub fn trigger_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("rewind-trigger.sock")
    } else {
        // SAFETY: libc::getuid() has no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/rewind-{}.sock", uid))
    }
}

