//! Save trigger socket
//!
//! Any connection to the socket requests a save; nothing is read or written.
//! `rewind save` (or `socat - UNIX-CONNECT:...`) is enough to fire it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::error::{Result, RewindError};

/// First pause after a failed accept; doubles up to [`MAX_ACCEPT_BACKOFF`]
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(2);

/// Listener on the save trigger socket
pub struct SocketTrigger {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketTrigger {
    /// Bind the trigger socket at `path`
    ///
    /// A stale socket file is replaced. Fails if another recorder is still
    /// listening on it. Must be called inside a tokio runtime.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(RewindError::trigger(format!(
                    "Another recorder is listening on {:?}",
                    path
                )));
            }
            debug!("Removing stale trigger socket {:?}", path);
            std::fs::remove_file(&path)?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| {
            RewindError::trigger(format!("Failed to bind trigger socket {:?}: {}", path, e))
        })?;
        info!("Save trigger listening on {:?}", path);

        Ok(Self { listener, path })
    }

    /// Socket path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next connection
    ///
    /// Accept errors (aborted connections, fd exhaustion) are logged and
    /// retried; they never end the recording.
    pub async fn wait(&mut self) -> Result<()> {
        let listener = &self.listener;
        let (stream, _) = accept_with_retry(|| listener.accept()).await;
        debug!("Save requested over the trigger socket");
        drop(stream);
        Ok(())
    }
}

impl Drop for SocketTrigger {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove trigger socket {:?}: {}", self.path, e);
            }
        }
    }
}

/// Run `accept` until it succeeds, backing off between failures
async fn accept_with_retry<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let mut backoff = ACCEPT_BACKOFF;
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!("Trigger socket accept failed: {}; retrying in {:?}", e, backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
            }
        }
    }
}

/// Ask a running recorder to save
pub async fn request_save(path: &Path) -> Result<()> {
    tokio::net::UnixStream::connect(path).await.map_err(|e| {
        RewindError::trigger(format!(
            "No recorder is listening on {:?}: {}",
            path, e
        ))
    })?;
    Ok(())
}
