//! Capture service
//!
//! Owns the capture backend and serves one capture channel client at a
//! time. Each connection runs in its own handler thread, which is joined
//! before the next connection is accepted.

use std::os::fd::BorrowedFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::fd_passing::{bind_listener, peer_uid};
use super::protocol::{send_codec_params, send_frame, Connect, DeviceParams, NO_FRAME};
use crate::capture::Pacer;
use crate::error::{Result, RewindError};
use crate::types::{monotonic_micros, Frame};

/// How long the accept loop sleeps when no client is waiting
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// One open device session inside the service
pub trait CaptureSession: Send {
    /// Parameters sent to the client in the CodecParams reply
    fn params(&self) -> &DeviceParams;

    /// Device handle transferred with the CodecParams reply
    fn device_fd(&self) -> BorrowedFd<'_>;

    /// Grab the current frame
    ///
    /// `Ok(None)` means nothing is being displayed right now.
    fn capture(&mut self) -> Result<Option<Frame>>;
}

/// Opens device sessions on behalf of clients
pub trait CaptureBackend: Send {
    /// Session type produced by this backend
    type Session: CaptureSession;

    /// Open `device` for capture at `framerate`
    ///
    /// An error makes the service close the connection without replying.
    fn open_session(&mut self, device: &str, framerate: i32) -> Result<Self::Session>;
}

/// Capture service settings
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Socket path to listen on
    pub socket_path: PathBuf,
    /// File mode of the socket
    pub socket_mode: u32,
    /// UIDs allowed to connect (empty = anyone who can open the socket)
    pub allowed_uids: Vec<u32>,
    /// Time a client has to send its Connect message
    pub handshake_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            socket_path: super::capture_socket_path(),
            socket_mode: 0o666,
            allowed_uids: Vec::new(),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Privileged frame server
pub struct CaptureService<B: CaptureBackend> {
    backend: B,
    listener: UnixListener,
    options: ServiceOptions,
    running: Arc<AtomicBool>,
    sessions: u64,
}

impl<B: CaptureBackend> CaptureService<B> {
    /// Bind the service socket
    ///
    /// The backend must already be open; failing to open it is fatal to the
    /// service and is the caller's to report.
    pub fn bind(backend: B, options: ServiceOptions) -> Result<Self> {
        let path = &options.socket_path;
        let listener = bind_listener(path, 1).map_err(|e| {
            RewindError::Io(e).with_context(format!("Failed to bind socket at {:?}", path))
        })?;

        let permissions = std::fs::Permissions::from_mode(options.socket_mode);
        std::fs::set_permissions(path, permissions).map_err(|e| {
            warn!("Failed to set socket permissions: {}", e);
            RewindError::config(format!("Failed to set socket permissions: {}", e))
        })?;

        listener.set_nonblocking(true)?;
        info!("Capture service listening on {:?}", path);

        Ok(Self {
            backend,
            listener,
            options,
            running: Arc::new(AtomicBool::new(true)),
            sessions: 0,
        })
    }

    /// Flag that stops [`run`](Self::run) when cleared
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Socket path the service listens on
    pub fn socket_path(&self) -> &Path {
        &self.options.socket_path
    }

    /// Number of sessions served so far
    pub fn sessions_served(&self) -> u64 {
        self.sessions
    }

    /// Serve clients until the shutdown flag is cleared
    pub fn run(&mut self) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            self.accept_one()?;
        }
        info!("Capture service stopped after {} sessions", self.sessions);
        Ok(())
    }

    /// Accept and serve at most one client
    ///
    /// Returns true if a client was served. Session errors are logged, never
    /// returned.
    pub fn accept_one(&mut self) -> Result<bool> {
        let stream = match self.listener.accept() {
            Ok((stream, _addr)) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
                return Ok(false);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                thread::sleep(ACCEPT_POLL);
                return Ok(false);
            }
        };
        stream.set_nonblocking(false)?;

        if !self.options.allowed_uids.is_empty() {
            match peer_uid(&stream) {
                Ok(uid) if self.options.allowed_uids.contains(&uid) => {}
                Ok(uid) => {
                    warn!("Rejecting capture client with uid {}", uid);
                    return Ok(false);
                }
                Err(e) => {
                    warn!("Failed to read peer credentials: {}", e);
                    return Ok(false);
                }
            }
        }

        self.sessions += 1;
        let session_id = self.sessions;
        let backend = &mut self.backend;
        let running = &self.running;
        let handshake_timeout = self.options.handshake_timeout;

        thread::scope(|scope| {
            let handler = thread::Builder::new()
                .name(format!("capture-session-{}", session_id))
                .spawn_scoped(scope, move || {
                    serve_session(backend, stream, running, handshake_timeout)
                })?;

            match handler.join() {
                Ok(Ok(())) => debug!("Session {} ended", session_id),
                Ok(Err(e)) if is_client_gone(&e) => info!("Session {}: client disconnected", session_id),
                Ok(Err(e)) => warn!("Session {} failed: {}", session_id, e),
                Err(_) => error!("Session {} handler panicked", session_id),
            }
            Ok::<_, RewindError>(())
        })?;

        Ok(true)
    }
}

impl<B: CaptureBackend> Drop for CaptureService<B> {
    fn drop(&mut self) {
        if self.options.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.options.socket_path) {
                warn!("Failed to remove socket file: {}", e);
            }
        }
    }
}

fn serve_session<B: CaptureBackend>(
    backend: &mut B,
    stream: UnixStream,
    running: &AtomicBool,
    handshake_timeout: Duration,
) -> Result<()> {
    stream.set_read_timeout(Some(handshake_timeout))?;
    let request = Connect::read_from(&mut &stream)?;
    info!(
        "Client requested device '{}' at {} fps",
        request.device, request.framerate
    );

    let mut session = match backend.open_session(&request.device, request.framerate) {
        Ok(session) => session,
        Err(e) => {
            // Closing without CodecParams tells the client the device is unavailable
            warn!("Cannot open device '{}': {}", request.device, e);
            return Ok(());
        }
    };

    send_codec_params(&stream, session.params(), session.device_fd())?;
    stream.set_read_timeout(None)?;

    let mut pacer = Pacer::new(session.params().framerate);

    while running.load(Ordering::SeqCst) {
        pacer.wait();
        match session.capture() {
            Ok(Some(frame)) => {
                send_frame(&stream, monotonic_micros(), Some(&frame))?;
            }
            Ok(None) => send_frame(&stream, NO_FRAME, None)?,
            Err(e) => {
                debug!("Capture attempt failed: {}", e);
                send_frame(&stream, NO_FRAME, None)?;
            }
        }
    }

    Ok(())
}

fn is_client_gone(err: &RewindError) -> bool {
    match err.root() {
        RewindError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
        ),
        _ => false,
    }
}
