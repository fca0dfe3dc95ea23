//! Error types for Rewind

use thiserror::Error;

/// Result type alias using RewindError
pub type Result<T> = std::result::Result<T, RewindError>;

/// Main error type for Rewind operations
#[derive(Debug, Error)]
pub enum RewindError {
    /// Capture device error (transient, retried by the caller)
    #[error("Capture error: {0}")]
    Capture(String),

    /// Malformed message or unexpected disconnect on the capture channel
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The capture service refused or could not open the requested device
    #[error("Capture service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Encoder error
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// Container writer error
    #[error("Muxer error: {0}")]
    Muxer(String),

    /// Save pipeline error
    #[error("Save error: {0}")]
    Save(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Trigger source error
    #[error("Trigger error: {0}")]
    Trigger(String),

    /// Unsupported operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<RewindError>,
    },
}

impl RewindError {
    /// Create a capture error
    pub fn capture(msg: impl Into<String>) -> Self {
        Self::Capture(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a service-unavailable error
    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// Create an encoder error
    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder(msg.into())
    }

    /// Create a muxer error
    pub fn muxer(msg: impl Into<String>) -> Self {
        Self::Muxer(msg.into())
    }

    /// Create a save error
    pub fn save(msg: impl Into<String>) -> Self {
        Self::Save(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a trigger error
    pub fn trigger(msg: impl Into<String>) -> Self {
        Self::Trigger(msg.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any context wrappers
    pub fn root(&self) -> &RewindError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error ends a capture channel session
    ///
    /// Protocol errors, I/O errors and a refused connection all require the
    /// client to reconnect from scratch.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self.root(),
            Self::Protocol(_) | Self::ServiceUnavailable(_) | Self::Io(_)
        )
    }

    /// A short hint for the user on how to resolve the error
    pub fn user_hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::Capture(_) => {
                Some("Check that the display device exists and that you have access to /dev/dri")
            }
            Self::ServiceUnavailable(_) => Some(
                "Start the capture service as root (rewind capture-service) and check the device name",
            ),
            Self::Protocol(_) => {
                Some("The capture service and client may be from different builds; restart both")
            }
            Self::Muxer(_) | Self::Save(_) => {
                Some("Check that the output directory is writable and has free space")
            }
            Self::Config(_) => Some("Check ~/.config/rewind/config.toml for invalid values"),
            Self::Trigger(_) => {
                Some("Hotkeys need read access to /dev/input/event* (add your user to 'input')")
            }
            _ => None,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

impl From<serde_json::Error> for RewindError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("Invalid JSON payload: {}", err))
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for RewindError {
    fn from(err: ffmpeg_next::Error) -> Self {
        Self::Encoder(err.to_string())
    }
}
