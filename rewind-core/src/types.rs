//! Core types for Rewind
//!
//! These types represent the data that flows through the capture, retention
//! and save pipeline.

use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::os::fd::{AsRawFd, OwnedFd};

/// Maximum number of planes in a hardware frame
pub const MAX_PLANES: usize = 4;

/// Current CLOCK_MONOTONIC time in microseconds
///
/// This is the shared clock of every capture path, so timestamps taken in the
/// capture service and in the recorder are directly comparable.
pub fn monotonic_micros() -> i64 {
    // SAFETY: timespec is plain data and clock_gettime only writes into it.
    let ts = unsafe {
        let mut ts: libc::timespec = std::mem::zeroed();
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        ts
    };
    ts.tv_sec as i64 * 1_000_000 + ts.tv_nsec as i64 / 1_000
}

/// Kind of media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Video stream (always ordered first)
    Video,
    /// Audio stream
    Audio,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

/// Rational time base of a stream's timestamps (seconds per tick)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBase {
    /// Numerator
    pub num: i32,
    /// Denominator
    pub den: i32,
}

impl TimeBase {
    /// Microsecond ticks, the unit used on the capture wire
    pub const MICROSECONDS: TimeBase = TimeBase::new(1, 1_000_000);

    /// Create a new time base
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Rescale `value` from this time base into `to`, rounding to nearest
    pub fn rescale(&self, value: i64, to: TimeBase) -> i64 {
        if *self == to {
            return value;
        }
        let numerator = value as i128 * self.num as i128 * to.den as i128;
        let denominator = self.den as i128 * to.num as i128;
        if denominator == 0 {
            return 0;
        }
        let quotient = numerator / denominator;
        let remainder = numerator % denominator;
        let rounded = if 2 * remainder.abs() >= denominator.abs() {
            quotient + numerator.signum() * denominator.signum()
        } else {
            quotient
        };
        rounded as i64
    }

    /// Convert a value in this time base to microseconds
    pub fn to_micros(&self, value: i64) -> i64 {
        self.rescale(value, Self::MICROSECONDS)
    }

    /// Convert microseconds into this time base
    pub fn from_micros(&self, micros: i64) -> i64 {
        Self::MICROSECONDS.rescale(micros, *self)
    }

    /// Number of ticks in `seconds`
    pub fn ticks_per_seconds(&self, seconds: u32) -> i64 {
        (seconds as i64 * self.den as i64) / self.num.max(1) as i64
    }
}

impl std::fmt::Display for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Negotiated parameters of one encoded stream
///
/// Produced by the encoder and consumed by the container writer when a track
/// is declared.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    /// Stream kind
    pub kind: StreamKind,
    /// Codec name as understood by the container writer (e.g. "h264", "aac")
    pub codec: String,
    /// Time base of unit timestamps
    pub time_base: TimeBase,
    /// Nominal units per second (frame rate for video, packets/s for audio)
    pub rate: u32,
    /// Width in pixels (video)
    pub width: u32,
    /// Height in pixels (video)
    pub height: u32,
    /// Sample rate in Hz (audio)
    pub sample_rate: u32,
    /// Channel count (audio)
    pub channels: u32,
    /// Global stream header (codec extradata)
    pub extradata: Bytes,
}

impl StreamParams {
    /// Parameters for a video stream
    pub fn video(codec: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            kind: StreamKind::Video,
            codec: codec.into(),
            time_base: TimeBase::new(1, fps.max(1) as i32),
            rate: fps,
            width,
            height,
            sample_rate: 0,
            channels: 0,
            extradata: Bytes::new(),
        }
    }

    /// Parameters for an audio stream
    ///
    /// `frame_size` is the number of samples per encoded unit.
    pub fn audio(codec: impl Into<String>, sample_rate: u32, channels: u32, frame_size: u32) -> Self {
        let rate = sample_rate.div_ceil(frame_size.max(1));
        Self {
            kind: StreamKind::Audio,
            codec: codec.into(),
            time_base: TimeBase::new(1, sample_rate.max(1) as i32),
            rate,
            width: 0,
            height: 0,
            sample_rate,
            channels,
            extradata: Bytes::new(),
        }
    }

    /// Override the time base
    pub fn with_time_base(mut self, time_base: TimeBase) -> Self {
        self.time_base = time_base;
        self
    }

    /// Attach the global stream header
    pub fn with_extradata(mut self, extradata: impl Into<Bytes>) -> Self {
        self.extradata = extradata.into();
        self
    }
}

/// One compressed chunk of stream data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    /// Encoded payload
    pub data: Bytes,
    /// Presentation timestamp (stream time base)
    pub pts: i64,
    /// Decode timestamp (stream time base)
    pub dts: i64,
    /// Is this a keyframe?
    pub keyframe: bool,
    /// Index of the stream this unit belongs to
    pub stream_index: usize,
}

impl EncodedUnit {
    /// Create a new encoded unit
    pub fn new(data: impl Into<Bytes>, pts: i64, dts: i64, keyframe: bool) -> Self {
        Self {
            data: data.into(),
            pts,
            dts,
            keyframe,
            stream_index: 0,
        }
    }

    /// Set the stream index
    pub fn with_stream(mut self, stream_index: usize) -> Self {
        self.stream_index = stream_index;
        self
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Layout of one plane of a hardware frame
///
/// This is also the on-wire record used by the capture protocol.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct PlaneInfo {
    /// Index into the frame's list of memory objects (transferred fds)
    pub object: u32,
    /// Bytes per row
    pub stride: u32,
    /// Byte offset of the plane inside its memory object
    pub offset: u32,
    /// DRM fourcc of the plane
    pub format: u32,
}

/// Frame format information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format (DRM fourcc)
    pub fourcc: u32,
    /// DRM format modifier (0 = linear)
    pub modifier: u64,
}

/// Raw video frame as delivered by a capture device
#[derive(Debug)]
pub struct Frame {
    /// Frame format
    pub format: FrameFormat,
    /// Frame data (DMA-BUF fds or CPU buffer)
    pub data: FrameData,
    /// Capture timestamp in microseconds (CLOCK_MONOTONIC)
    pub pts: i64,
}

/// Frame data storage
#[derive(Debug)]
pub enum FrameData {
    /// DMA-BUF backed planes for zero-copy GPU access
    DmaBuf {
        /// Plane layouts
        planes: Vec<PlaneInfo>,
        /// One owned fd per backing memory object
        objects: Vec<OwnedFd>,
    },
    /// CPU-accessible memory
    Memory(Vec<u8>),
}

impl FrameData {
    /// Try to map the first plane of a DMA-BUF into CPU memory
    ///
    /// Only meaningful for linear buffers. For the Memory variant this just
    /// clones the existing data.
    pub fn try_map_dmabuf(&self, size: usize) -> std::result::Result<Vec<u8>, String> {
        match self {
            FrameData::Memory(data) => Ok(data.clone()),
            FrameData::DmaBuf { planes, objects } => {
                use std::ptr;

                let plane = planes.first().ok_or("frame has no planes")?;
                let fd = objects
                    .get(plane.object as usize)
                    .ok_or("plane references a missing memory object")?;
                let map_size = size + plane.offset as usize;

                // SAFETY: the fd is a dma-buf owned by this frame and stays open
                // for the duration of the mapping. MAP_PRIVATE + PROT_READ never
                // writes back to the buffer.
                let ptr = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        map_size,
                        libc::PROT_READ,
                        libc::MAP_PRIVATE,
                        fd.as_raw_fd(),
                        0,
                    )
                };

                if ptr == libc::MAP_FAILED {
                    let err = std::io::Error::last_os_error();
                    return Err(format!("mmap failed: {}", err));
                }

                let mut buffer = vec![0u8; size];
                // SAFETY: the mapping covers offset + size bytes.
                unsafe {
                    let data_ptr = (ptr as *const u8).add(plane.offset as usize);
                    ptr::copy_nonoverlapping(data_ptr, buffer.as_mut_ptr(), size);
                }

                // SAFETY: ptr/map_size are exactly what mmap returned above.
                let unmap_result = unsafe { libc::munmap(ptr, map_size) };
                if unmap_result != 0 {
                    let err = std::io::Error::last_os_error();
                    tracing::warn!("munmap failed: {}", err);
                }

                Ok(buffer)
            }
        }
    }

    /// Check if this is a DMA-BUF frame
    pub fn is_dmabuf(&self) -> bool {
        matches!(self, FrameData::DmaBuf { .. })
    }

    /// Number of backing memory objects (fds)
    pub fn object_count(&self) -> usize {
        match self {
            FrameData::DmaBuf { objects, .. } => objects.len(),
            FrameData::Memory(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_between_time_bases() {
        let tb = TimeBase::new(1, 30);
        assert_eq!(tb.to_micros(30), 1_000_000);
        assert_eq!(tb.from_micros(1_000_000), 30);
        // 1/48000 -> 1/1000000, rounds to nearest
        assert_eq!(TimeBase::new(1, 48000).to_micros(1), 21);
        assert_eq!(TimeBase::new(1, 48000).to_micros(-1), -21);
    }

    #[test]
    fn test_ticks_per_seconds() {
        assert_eq!(TimeBase::new(1, 30).ticks_per_seconds(3), 90);
        assert_eq!(TimeBase::MICROSECONDS.ticks_per_seconds(2), 2_000_000);
    }

    #[test]
    fn test_audio_params_rate() {
        let params = StreamParams::audio("aac", 48000, 2, 1024);
        assert_eq!(params.rate, 47);
        assert_eq!(params.time_base, TimeBase::new(1, 48000));
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_micros();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_micros();
        assert!(b - a >= 2_000);
    }

    #[test]
    fn test_stream_kind_ordering() {
        assert!(StreamKind::Video < StreamKind::Audio);
    }

    #[test]
    fn test_map_memfd_dmabuf() {
        use std::io::Write;
        use std::os::fd::FromRawFd;

        // SAFETY: memfd_create with a valid C string; the returned fd is owned below.
        let raw = unsafe { libc::memfd_create(c"rewind-test".as_ptr(), 0) };
        assert!(raw >= 0);
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let mut file = std::fs::File::from(fd.try_clone().unwrap());
        file.write_all(&[0xAA; 16]).unwrap();
        file.write_all(&[1, 2, 3, 4]).unwrap();

        let data = FrameData::DmaBuf {
            planes: vec![PlaneInfo {
                object: 0,
                stride: 4,
                offset: 16,
                format: 0,
            }],
            objects: vec![fd],
        };
        assert!(data.is_dmabuf());
        assert_eq!(data.object_count(), 1);
        assert_eq!(data.try_map_dmabuf(4).unwrap(), vec![1, 2, 3, 4]);
    }
}
