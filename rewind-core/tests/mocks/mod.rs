//! Mock infrastructure for testing
//!
//! Provides an in-memory muxer, a capture backend backed by memfds and a
//! scripted unit source.

#![allow(dead_code)]

use parking_lot::Mutex;
use rewind_core::error::{Result, RewindError};
use rewind_core::ipc::{CaptureBackend, CaptureSession, DeviceParams, AUTO_DEVICE};
use rewind_core::output::Muxer;
use rewind_core::pipeline::UnitSource;
use rewind_core::types::{
    EncodedUnit, Frame, FrameData, FrameFormat, PlaneInfo, StreamParams,
};
use std::collections::VecDeque;
use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// XRGB8888
pub const FOURCC_XRGB: u32 = 0x34325258;

/// Pattern written into every mock frame buffer
pub const FRAME_PATTERN: [u8; 4] = [0x10, 0x20, 0x30, 0xFF];

/// Video unit with pts == dts
pub fn video_unit(pts: i64, keyframe: bool) -> EncodedUnit {
    EncodedUnit::new(vec![0u8; 32], pts, pts, keyframe)
}

/// Audio unit with pts == dts
pub fn audio_unit(pts: i64) -> EncodedUnit {
    EncodedUnit::new(vec![1u8; 8], pts, pts, true)
}

/// Anonymous memory file holding `contents`
pub fn memfd_with(contents: &[u8]) -> OwnedFd {
    // SAFETY: memfd_create with a valid C string; the fd is owned right below.
    let raw = unsafe { libc::memfd_create(c"rewind-mock".as_ptr(), 0) };
    assert!(raw >= 0, "memfd_create failed");
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    let mut file = std::fs::File::from(fd.try_clone().expect("dup memfd"));
    file.write_all(contents).expect("fill memfd");
    fd
}

/// Everything a [`MemoryMuxer`] was asked to write
#[derive(Debug, Default, Clone)]
pub struct Recorded {
    pub path: Option<PathBuf>,
    pub tracks: Vec<StreamParams>,
    pub header_written: bool,
    pub units: Vec<EncodedUnit>,
    pub closed: bool,
    pub aborted: bool,
}

/// Muxer that keeps its output in memory
#[derive(Default)]
pub struct MemoryMuxer {
    recorded: Arc<Mutex<Recorded>>,
    fail_open: bool,
    fail_write_after: Option<usize>,
    open_delay: Option<Duration>,
}

impl MemoryMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `open` fail
    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    /// Make `write` fail once `count` units were written
    pub fn failing_write_after(count: usize) -> Self {
        Self {
            fail_write_after: Some(count),
            ..Self::default()
        }
    }

    /// Make `open` block for `delay`, keeping a save in flight
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Shared view of what was written
    pub fn recorded(&self) -> Arc<Mutex<Recorded>> {
        Arc::clone(&self.recorded)
    }
}

impl Muxer for MemoryMuxer {
    fn open(&mut self, path: &Path) -> Result<()> {
        if self.fail_open {
            return Err(RewindError::muxer("open refused"));
        }
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        // Each save starts a fresh file
        let mut recorded = self.recorded.lock();
        *recorded = Recorded {
            path: Some(path.to_path_buf()),
            ..Recorded::default()
        };
        Ok(())
    }

    fn add_track(&mut self, params: &StreamParams) -> Result<usize> {
        let mut recorded = self.recorded.lock();
        recorded.tracks.push(params.clone());
        Ok(recorded.tracks.len() - 1)
    }

    fn write_header(&mut self) -> Result<()> {
        self.recorded.lock().header_written = true;
        Ok(())
    }

    fn write(&mut self, unit: &EncodedUnit) -> Result<()> {
        let mut recorded = self.recorded.lock();
        if self
            .fail_write_after
            .is_some_and(|limit| recorded.units.len() >= limit)
        {
            return Err(RewindError::muxer("disk full"));
        }
        recorded.units.push(unit.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.recorded.lock().closed = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.recorded.lock().aborted = true;
    }
}

/// Backend that knows a single fake card
pub struct MockBackend {
    pub width: u32,
    pub height: u32,
    pub opened: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl CaptureBackend for MockBackend {
    type Session = MockSession;

    fn open_session(&mut self, device: &str, framerate: i32) -> Result<MockSession> {
        if device != AUTO_DEVICE && device != "card0" {
            return Err(RewindError::capture(format!("no such device: {}", device)));
        }
        self.opened.lock().push(device.to_string());
        Ok(MockSession {
            params: DeviceParams {
                device: "card0".to_string(),
                width: self.width,
                height: self.height,
                fourcc: FOURCC_XRGB,
                modifier: 0,
                framerate,
            },
            device_fd: memfd_with(b"card0"),
            captures: 0,
        })
    }
}

/// Session that alternates between a frame and "nothing displayed"
pub struct MockSession {
    params: DeviceParams,
    device_fd: OwnedFd,
    captures: u64,
}

impl CaptureSession for MockSession {
    fn params(&self) -> &DeviceParams {
        &self.params
    }

    fn device_fd(&self) -> BorrowedFd<'_> {
        self.device_fd.as_fd()
    }

    fn capture(&mut self) -> Result<Option<Frame>> {
        self.captures += 1;
        if self.captures % 3 == 0 {
            return Ok(None);
        }
        let stride = self.params.width * 4;
        let contents: Vec<u8> = FRAME_PATTERN
            .iter()
            .copied()
            .cycle()
            .take((stride * self.params.height) as usize)
            .collect();
        Ok(Some(Frame {
            format: FrameFormat {
                width: self.params.width,
                height: self.params.height,
                fourcc: self.params.fourcc,
                modifier: self.params.modifier,
            },
            data: FrameData::DmaBuf {
                planes: vec![PlaneInfo {
                    object: 0,
                    stride,
                    offset: 0,
                    format: self.params.fourcc,
                }],
                objects: vec![memfd_with(&contents)],
            },
            pts: 0,
        }))
    }
}

/// Unit source that replays a fixed script, then idles
pub struct ScriptedSource {
    params: StreamParams,
    script: VecDeque<Result<Option<EncodedUnit>>>,
}

impl ScriptedSource {
    pub fn new(params: StreamParams, units: impl IntoIterator<Item = EncodedUnit>) -> Self {
        Self {
            params,
            script: units.into_iter().map(|u| Ok(Some(u))).collect(),
        }
    }

    /// Insert a failed attempt before the remaining script
    pub fn fail_first(mut self, message: &str) -> Self {
        self.script.push_front(Err(RewindError::capture(message.to_string())));
        self
    }
}

impl UnitSource for ScriptedSource {
    fn params(&self) -> &StreamParams {
        &self.params
    }

    fn next_unit(&mut self) -> Result<Option<EncodedUnit>> {
        match self.script.pop_front() {
            Some(step) => step,
            None => {
                std::thread::sleep(Duration::from_millis(1));
                Ok(None)
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Poll `condition` until it holds or five seconds pass
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
