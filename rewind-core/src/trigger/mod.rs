//! Save triggers
//!
//! A [`Trigger`] is awaited by the recorder's main loop; each completed
//! `wait()` requests one save.

mod hotkey;
mod socket;

pub use hotkey::{Hotkey, HotkeyTrigger, DEFAULT_HOTKEY};
pub use socket::{request_save, SocketTrigger};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, warn};

use crate::error::{Result, RewindError};

/// Which trigger source to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Connection to the trigger socket
    #[default]
    Socket,
    /// Global evdev hotkey
    Hotkey,
    /// SIGUSR1
    Signal,
    /// A line on stdin
    Debug,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Socket => write!(f, "socket"),
            TriggerKind::Hotkey => write!(f, "hotkey"),
            TriggerKind::Signal => write!(f, "signal"),
            TriggerKind::Debug => write!(f, "debug"),
        }
    }
}

impl FromStr for TriggerKind {
    type Err = RewindError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "socket" => Ok(TriggerKind::Socket),
            "hotkey" | "key" => Ok(TriggerKind::Hotkey),
            "signal" | "sigusr1" => Ok(TriggerKind::Signal),
            "debug" | "stdin" => Ok(TriggerKind::Debug),
            _ => Err(RewindError::config(format!(
                "Unknown trigger: {}. Use socket, hotkey, signal, or debug.",
                s
            ))),
        }
    }
}

/// Settings needed to open any trigger
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerOptions {
    /// Trigger source
    pub kind: TriggerKind,
    /// Path of the trigger socket
    pub socket_path: PathBuf,
    /// Hotkey binding, e.g. "alt+f10"
    pub hotkey: String,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            kind: TriggerKind::default(),
            socket_path: crate::ipc::trigger_socket_path(),
            hotkey: DEFAULT_HOTKEY.to_string(),
        }
    }
}

/// Source of save requests
pub enum Trigger {
    /// Any connection to a Unix socket
    Socket(SocketTrigger),
    /// Global hotkey
    Hotkey(HotkeyTrigger),
    /// SIGUSR1
    Signal(Signal),
    /// A line on stdin
    Debug(Option<Lines<BufReader<Stdin>>>),
}

impl Trigger {
    /// Open the trigger described by `options`
    ///
    /// Must be called inside a tokio runtime.
    pub fn open(options: &TriggerOptions) -> Result<Self> {
        let trigger = match options.kind {
            TriggerKind::Socket => Trigger::Socket(SocketTrigger::bind(&options.socket_path)?),
            TriggerKind::Hotkey => {
                let hotkey = Hotkey::parse(&options.hotkey)?;
                info!("Press {} to save a replay", options.hotkey);
                Trigger::Hotkey(HotkeyTrigger::start(hotkey)?)
            }
            TriggerKind::Signal => {
                let sig = signal(SignalKind::user_defined1()).map_err(|e| {
                    RewindError::trigger(format!("Failed to install SIGUSR1 handler: {}", e))
                })?;
                info!(
                    "Send SIGUSR1 to pid {} to save a replay",
                    std::process::id()
                );
                Trigger::Signal(sig)
            }
            TriggerKind::Debug => {
                info!("Press Enter to save a replay");
                Trigger::Debug(Some(BufReader::new(tokio::io::stdin()).lines()))
            }
        };
        Ok(trigger)
    }

    /// Kind of this trigger
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Socket(_) => TriggerKind::Socket,
            Trigger::Hotkey(_) => TriggerKind::Hotkey,
            Trigger::Signal(_) => TriggerKind::Signal,
            Trigger::Debug(_) => TriggerKind::Debug,
        }
    }

    /// Wait for the next save request
    ///
    /// Cancel-safe, so it can be raced against shutdown signals.
    pub async fn wait(&mut self) -> Result<()> {
        match self {
            Trigger::Socket(socket) => socket.wait().await,
            Trigger::Hotkey(hotkey) => hotkey.wait().await,
            Trigger::Signal(sig) => sig
                .recv()
                .await
                .ok_or_else(|| RewindError::trigger("SIGUSR1 stream closed")),
            Trigger::Debug(stdin) => {
                let Some(lines) = stdin.as_mut() else {
                    return std::future::pending().await;
                };
                match lines.next_line().await? {
                    Some(line) => {
                        debug!("Save requested on stdin ({:?})", line.trim());
                        Ok(())
                    }
                    None => {
                        // EOF; keep recording without this trigger
                        warn!("stdin closed, debug trigger disabled");
                        *stdin = None;
                        std::future::pending().await
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_kind_parse() {
        assert_eq!("socket".parse::<TriggerKind>().unwrap(), TriggerKind::Socket);
        assert_eq!("SIGUSR1".parse::<TriggerKind>().unwrap(), TriggerKind::Signal);
        assert_eq!("stdin".parse::<TriggerKind>().unwrap(), TriggerKind::Debug);
        assert!("mouse".parse::<TriggerKind>().is_err());
    }

    #[tokio::test]
    async fn test_socket_trigger_fires_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        let options = TriggerOptions {
            kind: TriggerKind::Socket,
            socket_path: dir.path().join("trigger.sock"),
            ..TriggerOptions::default()
        };
        let mut trigger = Trigger::open(&options).unwrap();
        assert_eq!(trigger.kind(), TriggerKind::Socket);

        let path = options.socket_path.clone();
        let client = tokio::spawn(async move { request_save(&path).await });
        tokio::time::timeout(std::time::Duration::from_secs(5), trigger.wait())
            .await
            .unwrap()
            .unwrap();
        client.await.unwrap().unwrap();

        // A second listener on the same path is refused while the first lives
        assert!(SocketTrigger::bind(&options.socket_path).is_err());
        drop(trigger);
        assert!(!options.socket_path.exists());
    }

    #[tokio::test]
    async fn test_signal_trigger() {
        let options = TriggerOptions {
            kind: TriggerKind::Signal,
            ..TriggerOptions::default()
        };
        let mut trigger = Trigger::open(&options).unwrap();
        // SAFETY: raising a signal at our own process; tokio has a handler installed.
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        tokio::time::timeout(std::time::Duration::from_secs(5), trigger.wait())
            .await
            .unwrap()
            .unwrap();
    }
}
