//! Capture channel wire protocol
//!
//! Fixed-schema messages exchanged between the capture service and its
//! client, in host byte order (the socket is local only):
//!
//! ```text
//! client -> service   Connect      i32 framerate | u8 name_len | name bytes
//! service -> client   CodecParams  u32 blob_len | JSON DeviceParams      + 1 fd
//! service -> client   Frame        i64 pts (microseconds, < 0 = no frame)
//!                                  FrameRecord (only when pts >= 0)     + 0..4 fds
//! ```
//!
//! There is no version negotiation.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;

use super::fd_passing::{recv_exact_with_fds, send_with_fds};
use crate::error::{Result, RewindError};
use crate::types::{Frame, FrameData, FrameFormat, PlaneInfo, MAX_PLANES};

/// Longest device name that fits the u8 length prefix
pub const MAX_DEVICE_NAME: usize = u8::MAX as usize;

/// Maximum CodecParams blob size (64 KB)
pub const MAX_PARAMS_SIZE: usize = 64 * 1024;

/// pts value meaning "no frame this attempt"
pub const NO_FRAME: i64 = -1;

/// Device name selecting the first active plane
pub const AUTO_DEVICE: &str = "auto";

/// First message of a session, sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Requested capture rate in frames per second
    pub framerate: i32,
    /// Device name (e.g. "auto" or "card0:31")
    pub device: String,
}

impl Connect {
    /// Create a validated connect message
    pub fn new(device: impl Into<String>, framerate: i32) -> Result<Self> {
        let device = device.into();
        if device.is_empty() || device.len() > MAX_DEVICE_NAME {
            return Err(RewindError::protocol(format!(
                "device name must be 1-{} bytes, got {}",
                MAX_DEVICE_NAME,
                device.len()
            )));
        }
        if framerate <= 0 {
            return Err(RewindError::protocol(format!(
                "framerate must be positive, got {}",
                framerate
            )));
        }
        Ok(Self { framerate, device })
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 + self.device.len());
        bytes.extend_from_slice(&self.framerate.to_ne_bytes());
        bytes.push(self.device.len() as u8);
        bytes.extend_from_slice(self.device.as_bytes());
        bytes
    }

    /// Read one connect message
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).map_err(map_read_error)?;
        let framerate = i32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let len = header[4] as usize;

        let mut name = vec![0u8; len];
        reader.read_exact(&mut name).map_err(map_read_error)?;
        let device = String::from_utf8(name)
            .map_err(|_| RewindError::protocol("device name is not valid UTF-8"))?;

        Self::new(device, framerate)
    }
}

/// Device description carried in the CodecParams blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Resolved device name (e.g. "card0:31")
    pub device: String,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// DRM fourcc of the scanout buffer
    pub fourcc: u32,
    /// DRM format modifier
    pub modifier: u64,
    /// Frame rate the service will deliver
    pub framerate: i32,
}

impl DeviceParams {
    /// Serialize to wire bytes (length-prefixed JSON)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let blob = serde_json::to_vec(self)?;
        if blob.len() > MAX_PARAMS_SIZE {
            return Err(RewindError::protocol(format!(
                "codec params too large: {} bytes (max {})",
                blob.len(),
                MAX_PARAMS_SIZE
            )));
        }
        let mut bytes = Vec::with_capacity(4 + blob.len());
        bytes.extend_from_slice(&(blob.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(&blob);
        Ok(bytes)
    }

    /// Deserialize the JSON blob
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }
}

/// Fixed-size frame descriptor record sent after a non-negative pts
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameRecord {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// DRM fourcc
    pub fourcc: u32,
    /// Number of valid entries in `planes`
    pub plane_count: u32,
    /// Number of fds attached to this record
    pub object_count: u32,
    /// Always zero
    pub reserved: u32,
    /// DRM format modifier
    pub modifier: u64,
    /// Plane layouts, only the first `plane_count` are meaningful
    pub planes: [PlaneInfo; MAX_PLANES],
}

impl FrameRecord {
    /// Size of the record on the wire
    pub const SIZE: usize = std::mem::size_of::<FrameRecord>();

    /// Build a record for a DMA-BUF frame
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let FrameData::DmaBuf { planes, objects } = &frame.data else {
            return Err(RewindError::protocol(
                "only DMA-BUF frames can be sent over the capture channel",
            ));
        };
        if planes.is_empty() || planes.len() > MAX_PLANES {
            return Err(RewindError::protocol(format!(
                "invalid plane count {}",
                planes.len()
            )));
        }

        let mut record = FrameRecord {
            width: frame.format.width,
            height: frame.format.height,
            fourcc: frame.format.fourcc,
            plane_count: planes.len() as u32,
            object_count: objects.len() as u32,
            reserved: 0,
            modifier: frame.format.modifier,
            planes: [PlaneInfo::default(); MAX_PLANES],
        };
        record.planes[..planes.len()].copy_from_slice(planes);
        record.validate(objects.len())?;
        Ok(record)
    }

    /// Check the record against the number of fds that came with it
    pub fn validate(&self, fds_received: usize) -> Result<()> {
        let plane_count = self.plane_count as usize;
        if plane_count == 0 || plane_count > MAX_PLANES {
            return Err(RewindError::protocol(format!(
                "invalid plane count {}",
                self.plane_count
            )));
        }
        if self.object_count as usize != fds_received {
            return Err(RewindError::protocol(format!(
                "frame announces {} memory objects but {} fds arrived",
                self.object_count, fds_received
            )));
        }
        if let Some(plane) = self.planes[..plane_count]
            .iter()
            .find(|p| p.object >= self.object_count)
        {
            return Err(RewindError::protocol(format!(
                "plane references object {} of {}",
                plane.object, self.object_count
            )));
        }
        Ok(())
    }

    /// Frame format described by this record
    pub fn format(&self) -> FrameFormat {
        FrameFormat {
            width: self.width,
            height: self.height,
            fourcc: self.fourcc,
            modifier: self.modifier,
        }
    }

    /// Valid plane layouts
    pub fn planes(&self) -> &[PlaneInfo] {
        &self.planes[..(self.plane_count as usize).min(MAX_PLANES)]
    }
}

/// Send the CodecParams reply with the device fd attached
pub fn send_codec_params(stream: &UnixStream, params: &DeviceParams, device_fd: impl AsFd) -> Result<()> {
    let bytes = params.to_bytes()?;
    send_with_fds(stream, &bytes, &[device_fd.as_fd()])?;
    Ok(())
}

/// Receive the CodecParams reply
///
/// A service that closes the connection without replying refused the
/// requested device; that is reported as `ServiceUnavailable`, not as a
/// protocol error.
pub fn recv_codec_params(stream: &UnixStream) -> Result<(DeviceParams, OwnedFd)> {
    let mut len_bytes = [0u8; 4];
    let mut fds = match recv_exact_with_fds(stream, &mut len_bytes) {
        Ok(fds) => fds,
        Err(e) if is_disconnect(&e) => {
            return Err(RewindError::service_unavailable(
                "service closed the connection without sending codec parameters",
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let len = u32::from_ne_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_PARAMS_SIZE {
        return Err(RewindError::protocol(format!("invalid codec params size {}", len)));
    }

    let mut blob = vec![0u8; len];
    let mut reader = stream;
    reader.read_exact(&mut blob).map_err(map_read_error)?;

    if fds.len() != 1 {
        return Err(RewindError::protocol(format!(
            "expected exactly one device fd, got {}",
            fds.len()
        )));
    }
    let device_fd = fds.remove(0);

    Ok((DeviceParams::from_blob(&blob)?, device_fd))
}

/// Send one frame message; `None` sends the "no frame" marker
pub fn send_frame(stream: &UnixStream, pts: i64, frame: Option<&Frame>) -> Result<()> {
    let mut writer = stream;
    match frame {
        Some(frame) if pts >= 0 => {
            let record = FrameRecord::from_frame(frame)?;
            let fds: Vec<_> = match &frame.data {
                FrameData::DmaBuf { objects, .. } => objects.iter().map(|fd| fd.as_fd()).collect(),
                FrameData::Memory(_) => Vec::new(),
            };
            writer.write_all(&pts.to_ne_bytes())?;
            send_with_fds(stream, bytemuck::bytes_of(&record), &fds)?;
        }
        _ => {
            let marker = if pts < 0 { pts } else { NO_FRAME };
            writer.write_all(&marker.to_ne_bytes())?;
        }
    }
    Ok(())
}

/// Receive one frame message
///
/// Returns `Ok(None)` for a negative pts (the client should try again).
pub fn recv_frame(stream: &UnixStream) -> Result<Option<Frame>> {
    let mut pts_bytes = [0u8; 8];
    let mut reader = stream;
    reader.read_exact(&mut pts_bytes).map_err(map_read_error)?;
    let pts = i64::from_ne_bytes(pts_bytes);
    if pts < 0 {
        return Ok(None);
    }

    let mut record = FrameRecord::zeroed();
    let objects = recv_exact_with_fds(stream, bytemuck::bytes_of_mut(&mut record))
        .map_err(map_read_error)?;
    record.validate(objects.len())?;

    Ok(Some(Frame {
        format: record.format(),
        data: FrameData::DmaBuf {
            planes: record.planes().to_vec(),
            objects,
        },
        pts,
    }))
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

fn map_read_error(err: io::Error) -> RewindError {
    if is_disconnect(&err) {
        RewindError::protocol("connection closed unexpectedly")
    } else {
        RewindError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_wire_layout() {
        let msg = Connect::new("auto", 30).unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 4 + 1 + 4);
        assert_eq!(&bytes[..4], &30i32.to_ne_bytes());
        assert_eq!(bytes[4], 4);
        assert_eq!(&bytes[5..], b"auto");

        let parsed = Connect::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_connect_rejects_bad_values() {
        assert!(Connect::new("", 30).is_err());
        assert!(Connect::new("auto", 0).is_err());
        assert!(Connect::new("x".repeat(256), 30).is_err());
    }

    #[test]
    fn test_truncated_connect_is_protocol_error() {
        let bytes = Connect::new("card0:31", 60).unwrap().to_bytes();
        let err = Connect::read_from(&mut &bytes[..7]).unwrap_err();
        assert!(matches!(err, RewindError::Protocol(_)));
    }

    #[test]
    fn test_frame_record_size_is_fixed() {
        assert_eq!(FrameRecord::SIZE, 96);
    }

    #[test]
    fn test_frame_record_validation() {
        let mut record = FrameRecord::zeroed();
        record.plane_count = 1;
        record.object_count = 1;
        assert!(record.validate(1).is_ok());
        assert!(record.validate(0).is_err());

        record.planes[0].object = 1;
        assert!(record.validate(1).is_err());

        record.plane_count = 5;
        assert!(record.validate(1).is_err());
    }

    #[test]
    fn test_no_frame_marker() {
        let (a, b) = UnixStream::pair().unwrap();
        send_frame(&a, NO_FRAME, None).unwrap();
        assert!(recv_frame(&b).unwrap().is_none());
    }
}
