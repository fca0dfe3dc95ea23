//! KMS plane capture
//!
//! Captures whatever a display plane is scanning out by exporting its
//! framebuffer as DMA-BUFs. Used inside the capture service, and directly by
//! the recorder when it already runs with CAP_SYS_ADMIN.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::drm::{DeviceSpec, DrmCard, Framebuffer};
use super::{Device, Pacer};
use crate::error::{Result, RewindError};
use crate::ipc::{CaptureBackend, CaptureSession, DeviceParams};
use crate::types::{monotonic_micros, Frame, FrameData, FrameFormat, PlaneInfo};

/// Highest frame rate a session will deliver
pub const MAX_FRAMERATE: i32 = 240;

/// Backend opening KMS planes on behalf of capture clients
#[derive(Debug)]
pub struct KmsBackend {
    default_card: Arc<DrmCard>,
    default_name: String,
}

impl KmsBackend {
    /// Open the card named by `device` (e.g. "auto" or "card1")
    ///
    /// Failure here means the service cannot capture anything at all.
    pub fn open(device: &str) -> Result<Self> {
        let spec = DeviceSpec::parse(device)?;
        let card = DrmCard::open(spec.card_path())?;
        info!("KMS backend ready on {:?}", card.path());
        Ok(Self {
            default_card: Arc::new(card),
            default_name: spec.card,
        })
    }

    fn card_for(&self, spec: &DeviceSpec) -> Result<Arc<DrmCard>> {
        if spec.card == self.default_name {
            return Ok(Arc::clone(&self.default_card));
        }
        Ok(Arc::new(DrmCard::open(spec.card_path())?))
    }
}

impl CaptureBackend for KmsBackend {
    type Session = KmsSession;

    fn open_session(&mut self, device: &str, framerate: i32) -> Result<KmsSession> {
        let spec = DeviceSpec::parse(device)?;
        let card = self.card_for(&spec)?;
        KmsSession::open(card, &spec, framerate)
    }
}

/// Capture session bound to one plane
#[derive(Debug)]
pub struct KmsSession {
    card: Arc<DrmCard>,
    plane_id: u32,
    params: DeviceParams,
}

impl KmsSession {
    /// Resolve the plane named by `spec` and describe what it shows
    pub fn open(card: Arc<DrmCard>, spec: &DeviceSpec, framerate: i32) -> Result<Self> {
        let planes = card.plane_ids()?;
        let plane_id = match spec.plane {
            Some(id) if planes.contains(&id) => id,
            Some(id) => {
                return Err(RewindError::capture(format!(
                    "No plane {} on {}",
                    id, spec.card
                )));
            }
            None => pick_active_plane(&card, &planes)?,
        };

        let state = card.plane(plane_id)?;
        if state.fb_id == 0 {
            return Err(RewindError::capture(format!(
                "Plane {} on {} is not scanning out",
                plane_id, spec.card
            )));
        }
        let fb = card.framebuffer(state.fb_id)?;
        card.close_handles(&fb);

        let params = DeviceParams {
            device: format!("{}:{}", spec.card, plane_id),
            width: fb.width,
            height: fb.height,
            fourcc: fb.fourcc,
            modifier: fb.modifier,
            framerate: framerate.clamp(1, MAX_FRAMERATE),
        };
        info!(
            "KMS session on {}: {}x{} {} modifier={:#x}",
            params.device,
            params.width,
            params.height,
            crate::formats::fourcc_name(params.fourcc),
            params.modifier
        );

        Ok(Self {
            card,
            plane_id,
            params,
        })
    }

    /// Plane being captured
    pub fn plane_id(&self) -> u32 {
        self.plane_id
    }
}

impl CaptureSession for KmsSession {
    fn params(&self) -> &DeviceParams {
        &self.params
    }

    fn device_fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }

    fn capture(&mut self) -> Result<Option<Frame>> {
        let state = self.card.plane(self.plane_id)?;
        if state.fb_id == 0 {
            return Ok(None);
        }

        let fb = self.card.framebuffer(state.fb_id)?;
        let frame = export_framebuffer(&self.card, &fb);
        self.card.close_handles(&fb);
        frame.map(Some)
    }
}

/// In-process KMS capture device
#[derive(Debug)]
pub struct KmsCapture {
    session: KmsSession,
    pacer: Pacer,
}

impl KmsCapture {
    /// Open `device` directly
    pub fn open(device: &str, framerate: i32) -> Result<Self> {
        let mut backend = KmsBackend::open(device)?;
        let session = backend.open_session(device, framerate)?;
        let pacer = Pacer::new(session.params().framerate);
        Ok(Self {
            session,
            pacer,
        })
    }

    /// Device parameters of the open session
    pub fn params(&self) -> &DeviceParams {
        self.session.params()
    }
}

impl Device for KmsCapture {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.pacer.wait();
        let frame = self.session.capture()?;
        Ok(frame.map(|mut frame| {
            frame.pts = monotonic_micros();
            frame
        }))
    }

    fn name(&self) -> &str {
        &self.session.params().device
    }
}

/// First plane with the largest attached framebuffer
fn pick_active_plane(card: &DrmCard, planes: &[u32]) -> Result<u32> {
    let mut best: Option<(u32, u64)> = None;
    for &id in planes {
        let state = match card.plane(id) {
            Ok(state) => state,
            Err(e) => {
                debug!("Skipping plane {}: {}", id, e);
                continue;
            }
        };
        if state.fb_id == 0 || state.crtc_id == 0 {
            continue;
        }
        let fb = match card.framebuffer(state.fb_id) {
            Ok(fb) => fb,
            Err(e) => {
                warn!("Cannot inspect framebuffer of plane {}: {}", id, e);
                continue;
            }
        };
        card.close_handles(&fb);

        let area = fb.width as u64 * fb.height as u64;
        if best.is_none_or(|(_, best_area)| area > best_area) {
            best = Some((id, area));
        }
    }

    best.map(|(id, _)| id)
        .ok_or_else(|| RewindError::capture("No active plane found"))
}

/// Export every buffer object of `fb` and describe its planes
fn export_framebuffer(card: &DrmCard, fb: &Framebuffer) -> Result<Frame> {
    let plane_count = fb.plane_count();
    let mut handles: Vec<u32> = Vec::with_capacity(plane_count);
    let mut objects: Vec<OwnedFd> = Vec::with_capacity(plane_count);
    let mut planes = Vec::with_capacity(plane_count);

    for i in 0..plane_count {
        let handle = fb.handles[i];
        let object = match handles.iter().position(|&h| h == handle) {
            Some(index) => index,
            None => {
                objects.push(card.prime_fd(handle)?);
                handles.push(handle);
                handles.len() - 1
            }
        };
        planes.push(PlaneInfo {
            object: object as u32,
            stride: fb.pitches[i],
            offset: fb.offsets[i],
            format: fb.fourcc,
        });
    }

    Ok(Frame {
        format: FrameFormat {
            width: fb.width,
            height: fb.height,
            fourcc: fb.fourcc,
            modifier: fb.modifier,
        },
        data: FrameData::DmaBuf { planes, objects },
        pts: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_open_fails_without_card() {
        let err = KmsBackend::open("card99").unwrap_err();
        assert!(matches!(err, RewindError::Capture(_)));
    }

    #[test]
    fn test_invalid_device_name() {
        assert!(KmsCapture::open("card0:notaplane", 30).is_err());
    }
}
