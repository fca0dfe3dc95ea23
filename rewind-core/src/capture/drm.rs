//! Direct Rendering Manager (DRM) plane access
//!
//! Minimal KMS bindings needed to read what a plane is scanning out and
//! export its framebuffer as DMA-BUFs:
//!
//! - enumerate planes (`GETPLANERESOURCES`, `GETPLANE`)
//! - describe the attached framebuffer (`GETFB2`)
//! - export GEM handles as dma-buf fds (`PRIME_HANDLE_TO_FD`)
//!
//! `GETFB2` only returns buffer handles to a DRM master or a process with
//! `CAP_SYS_ADMIN`, which is why this normally runs inside the privileged
//! capture service.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{Result, RewindError};

/// Directory holding DRM device nodes
pub const DRI_DIR: &str = "/dev/dri";

/// Card used when the device name does not name one
pub const DEFAULT_CARD: &str = "card0";

/// Modifier value meaning "no explicit modifier"
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

const DRM_IOCTL_BASE: u32 = b'd' as u32;
const DRM_CLIENT_CAP_UNIVERSAL_PLANES: u64 = 2;
const DRM_MODE_FB_MODIFIERS: u32 = 1 << 1;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (DRM_IOCTL_BASE << 8) | nr
}

const fn iow(nr: u32, size: usize) -> u32 {
    ioc(1, nr, size)
}

const fn iowr(nr: u32, size: usize) -> u32 {
    ioc(3, nr, size)
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmSetClientCap {
    capability: u64,
    value: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmGemClose {
    handle: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmPrimeHandle {
    handle: u32,
    flags: u32,
    fd: i32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmModeGetPlaneRes {
    plane_id_ptr: u64,
    count_planes: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmModeGetPlane {
    plane_id: u32,
    crtc_id: u32,
    fb_id: u32,
    possible_crtcs: u32,
    gamma_size: u32,
    count_format_types: u32,
    format_type_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmModeFbCmd2 {
    fb_id: u32,
    width: u32,
    height: u32,
    pixel_format: u32,
    flags: u32,
    handles: [u32; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
    pad: u32,
    modifier: [u64; 4],
}

pub(crate) const DRM_IOCTL_SET_CLIENT_CAP: u32 = iow(0x0d, std::mem::size_of::<DrmSetClientCap>());
pub(crate) const DRM_IOCTL_GEM_CLOSE: u32 = iow(0x09, std::mem::size_of::<DrmGemClose>());
pub(crate) const DRM_IOCTL_PRIME_HANDLE_TO_FD: u32 =
    iowr(0x2d, std::mem::size_of::<DrmPrimeHandle>());
pub(crate) const DRM_IOCTL_MODE_GETPLANERESOURCES: u32 =
    iowr(0xb5, std::mem::size_of::<DrmModeGetPlaneRes>());
pub(crate) const DRM_IOCTL_MODE_GETPLANE: u32 = iowr(0xb6, std::mem::size_of::<DrmModeGetPlane>());
pub(crate) const DRM_IOCTL_MODE_GETFB2: u32 = iowr(0xce, std::mem::size_of::<DrmModeFbCmd2>());

/// Parsed capture device name
///
/// Accepted forms are `auto`, `<card>` and `<card>:<plane-id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Card node name under /dev/dri
    pub card: String,
    /// Plane to capture, or None to pick automatically
    pub plane: Option<u32>,
}

impl DeviceSpec {
    /// Parse a device name
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() || name.eq_ignore_ascii_case("auto") {
            return Ok(Self {
                card: DEFAULT_CARD.to_string(),
                plane: None,
            });
        }

        let (card, plane) = match name.split_once(':') {
            Some((card, plane)) => {
                let plane = plane.parse::<u32>().map_err(|_| {
                    RewindError::capture(format!("Invalid plane id in device name '{}'", name))
                })?;
                (card, Some(plane))
            }
            None => (name, None),
        };

        if card.is_empty() || card.contains('/') {
            return Err(RewindError::capture(format!(
                "Invalid card name in device name '{}'",
                name
            )));
        }

        Ok(Self {
            card: card.to_string(),
            plane,
        })
    }

    /// Device node path for the card
    pub fn card_path(&self) -> PathBuf {
        Path::new(DRI_DIR).join(&self.card)
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.plane {
            Some(plane) => write!(f, "{}:{}", self.card, plane),
            None => write!(f, "{}", self.card),
        }
    }
}

/// Plane state as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneState {
    /// Plane object id
    pub id: u32,
    /// CRTC the plane is bound to (0 = none)
    pub crtc_id: u32,
    /// Framebuffer currently scanned out (0 = none)
    pub fb_id: u32,
}

/// Framebuffer description with GEM handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// DRM fourcc
    pub fourcc: u32,
    /// Format modifier, or `DRM_FORMAT_MOD_INVALID`
    pub modifier: u64,
    /// GEM handles, 0 for unused planes
    pub handles: [u32; 4],
    /// Row pitch per plane
    pub pitches: [u32; 4],
    /// Byte offset per plane
    pub offsets: [u32; 4],
}

impl Framebuffer {
    /// Number of planes with a buffer handle
    pub fn plane_count(&self) -> usize {
        self.handles.iter().take_while(|&&h| h != 0).count()
    }
}

/// An open DRM card node
#[derive(Debug)]
pub struct DrmCard {
    file: File,
    path: PathBuf,
}

impl DrmCard {
    /// Open a card node read-write and enable universal planes
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| RewindError::capture(format!("Failed to open {:?}: {}", path, e)))?;

        let card = Self { file, path };
        let mut cap = DrmSetClientCap {
            capability: DRM_CLIENT_CAP_UNIVERSAL_PLANES,
            value: 1,
        };
        card.ioctl(DRM_IOCTL_SET_CLIENT_CAP, &mut cap)
            .map_err(|e| RewindError::capture(format!("Universal planes unsupported: {}", e)))?;

        debug!("Opened DRM card {:?}", card.path);
        Ok(card)
    }

    /// Device node path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Duplicate the card fd, e.g. to hand it to a client
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        Ok(self.file.as_fd().try_clone_to_owned()?)
    }

    /// All plane ids exposed by the card
    pub fn plane_ids(&self) -> Result<Vec<u32>> {
        let mut res = DrmModeGetPlaneRes::default();
        self.ioctl(DRM_IOCTL_MODE_GETPLANERESOURCES, &mut res)?;

        let mut ids = vec![0u32; res.count_planes as usize];
        if ids.is_empty() {
            return Ok(ids);
        }
        res.plane_id_ptr = ids.as_mut_ptr() as u64;
        self.ioctl(DRM_IOCTL_MODE_GETPLANERESOURCES, &mut res)?;
        ids.truncate(res.count_planes as usize);
        Ok(ids)
    }

    /// Current state of one plane
    pub fn plane(&self, id: u32) -> Result<PlaneState> {
        let mut plane = DrmModeGetPlane {
            plane_id: id,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_GETPLANE, &mut plane)?;
        Ok(PlaneState {
            id,
            crtc_id: plane.crtc_id,
            fb_id: plane.fb_id,
        })
    }

    /// Describe a framebuffer
    ///
    /// The returned GEM handles must be released with [`close_handles`](Self::close_handles).
    pub fn framebuffer(&self, fb_id: u32) -> Result<Framebuffer> {
        let mut fb = DrmModeFbCmd2 {
            fb_id,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_GETFB2, &mut fb)?;

        if fb.handles[0] == 0 {
            return Err(RewindError::capture(
                "Framebuffer handles unavailable (requires CAP_SYS_ADMIN)",
            ));
        }

        let modifier = if fb.flags & DRM_MODE_FB_MODIFIERS != 0 {
            fb.modifier[0]
        } else {
            DRM_FORMAT_MOD_INVALID
        };

        Ok(Framebuffer {
            width: fb.width,
            height: fb.height,
            fourcc: fb.pixel_format,
            modifier,
            handles: fb.handles,
            pitches: fb.pitches,
            offsets: fb.offsets,
        })
    }

    /// Export a GEM handle as a dma-buf fd
    pub fn prime_fd(&self, handle: u32) -> Result<OwnedFd> {
        let mut prime = DrmPrimeHandle {
            handle,
            flags: (libc::O_CLOEXEC | libc::O_RDONLY) as u32,
            fd: -1,
        };
        self.ioctl(DRM_IOCTL_PRIME_HANDLE_TO_FD, &mut prime)?;
        if prime.fd < 0 {
            return Err(RewindError::capture("PRIME export returned no fd"));
        }
        // SAFETY: the kernel just created this fd for us.
        Ok(unsafe { OwnedFd::from_raw_fd(prime.fd) })
    }

    /// Release GEM handles returned by [`framebuffer`](Self::framebuffer)
    pub fn close_handles(&self, fb: &Framebuffer) {
        let mut closed: Vec<u32> = Vec::with_capacity(4);
        for &handle in fb.handles.iter().filter(|&&h| h != 0) {
            if closed.contains(&handle) {
                continue;
            }
            let mut close = DrmGemClose { handle, pad: 0 };
            if let Err(e) = self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut close) {
                trace!("GEM_CLOSE({}) failed: {}", handle, e);
            }
            closed.push(handle);
        }
    }

    fn ioctl<T>(&self, request: u32, arg: &mut T) -> std::io::Result<()> {
        loop {
            // SAFETY: `request` encodes sizeof(T) and `arg` is a valid, exclusively
            // borrowed repr(C) struct of that layout.
            let ret = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    request as _,
                    arg as *mut T as *mut libc::c_void,
                )
            };
            if ret == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if !matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::EAGAIN)) {
                return Err(err);
            }
        }
    }
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Card nodes present under /dev/dri
pub fn list_cards() -> Vec<String> {
    let mut cards: Vec<String> = std::fs::read_dir(DRI_DIR)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("card"))
        .collect();
    cards.sort();
    cards
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers() {
        assert_eq!(DRM_IOCTL_SET_CLIENT_CAP, 0x4010_640d);
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
        assert_eq!(DRM_IOCTL_PRIME_HANDLE_TO_FD, 0xc00c_642d);
        assert_eq!(DRM_IOCTL_MODE_GETPLANERESOURCES, 0xc010_64b5);
        assert_eq!(DRM_IOCTL_MODE_GETPLANE, 0xc020_64b6);
        assert_eq!(DRM_IOCTL_MODE_GETFB2, 0xc068_64ce);
    }

    #[test]
    fn test_parse_device_spec() {
        assert_eq!(
            DeviceSpec::parse("auto").unwrap(),
            DeviceSpec {
                card: "card0".into(),
                plane: None
            }
        );
        assert_eq!(
            DeviceSpec::parse("card0:31").unwrap(),
            DeviceSpec {
                card: "card0".into(),
                plane: Some(31)
            }
        );
        assert_eq!(DeviceSpec::parse("card1").unwrap().plane, None);
        assert!(DeviceSpec::parse("card0:abc").is_err());
        assert!(DeviceSpec::parse("../card0:1").is_err());
        assert!(DeviceSpec::parse(":5").is_err());
    }

    #[test]
    fn test_card_path() {
        let spec = DeviceSpec::parse("card1:40").unwrap();
        assert_eq!(spec.card_path(), PathBuf::from("/dev/dri/card1"));
        assert_eq!(spec.to_string(), "card1:40");
    }

    #[test]
    fn test_framebuffer_plane_count() {
        let fb = Framebuffer {
            width: 1920,
            height: 1080,
            fourcc: 0x3231_564e,
            modifier: 0,
            handles: [5, 5, 0, 0],
            pitches: [1920, 1920, 0, 0],
            offsets: [0, 1920 * 1080, 0, 0],
        };
        assert_eq!(fb.plane_count(), 2);
    }

    #[test]
    fn test_open_missing_card_fails() {
        assert!(DrmCard::open("/nonexistent/card9").is_err());
    }
}
