//! Video and audio encoding
//!
//! The recorder only depends on the [`Encoder`] trait. FFmpeg-backed
//! implementations are available with the `ffmpeg` feature:
//! - [`VideoEncoder`]: mapped DMA-BUF frames through swscale into any
//!   FFmpeg video encoder (libx264 by default)
//! - [`AudioEncoder`]: interleaved f32 samples into AAC or Opus

#[cfg(feature = "ffmpeg")]
mod audio;
#[cfg(feature = "ffmpeg")]
mod video;

#[cfg(feature = "ffmpeg")]
pub use audio::AudioEncoder;
#[cfg(feature = "ffmpeg")]
pub use video::VideoEncoder;

use crate::error::Result;
use crate::types::{EncodedUnit, Frame, StreamParams};

/// Turns raw frames into encoded units
///
/// Encoders may buffer: one `send_frame` can yield zero or several units,
/// drained with `produce` until it returns `Ok(None)`.
pub trait Encoder: Send {
    /// Negotiated stream parameters, including the global header
    fn params(&self) -> &StreamParams;

    /// Submit one raw frame
    fn send_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Take the next finished unit, if any
    fn produce(&mut self) -> Result<Option<EncodedUnit>>;
}

impl<E: Encoder + ?Sized> Encoder for Box<E> {
    fn params(&self) -> &StreamParams {
        (**self).params()
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        (**self).send_frame(frame)
    }

    fn produce(&mut self) -> Result<Option<EncodedUnit>> {
        (**self).produce()
    }
}

/// Check if an FFmpeg encoder with this name is available
#[cfg(feature = "ffmpeg")]
pub fn encoder_available(name: &str) -> bool {
    ffmpeg_next::init().ok();
    ffmpeg_next::codec::encoder::find_by_name(name).is_some()
}

/// Check if an FFmpeg encoder with this name is available
#[cfg(not(feature = "ffmpeg"))]
pub fn encoder_available(_name: &str) -> bool {
    false
}
