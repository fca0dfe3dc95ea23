//! DRM pixel format helpers
//!
//! Scanout buffers are described by DRM fourcc codes and format modifiers.
//! See: <https://github.com/torvalds/linux/blob/master/include/uapi/drm/drm_fourcc.h>

/// DRM format fourcc constants
pub mod fourcc {
    /// XRGB8888, the usual desktop scanout format
    pub const XRGB8888: u32 = 0x34325258; // XR24
    /// XBGR8888
    pub const XBGR8888: u32 = 0x34324258; // XB24
    /// ARGB8888
    pub const ARGB8888: u32 = 0x34325241; // AR24
    /// ABGR8888
    pub const ABGR8888: u32 = 0x34324241; // AB24
    /// XRGB2101010 (10-bit desktops)
    pub const XRGB2101010: u32 = 0x30335258; // XR30
    /// RGB565
    pub const RGB565: u32 = 0x36314752; // RG16
    /// NV12, YUV 4:2:0 semi-planar
    pub const NV12: u32 = 0x3231564E; // NV12
}

/// Linear (untiled) layout
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// Whether a buffer with `modifier` can be read row by row after mmap
///
/// An invalid modifier means "driver default", which is linear on every
/// driver that supports CPU mapping at all.
pub fn is_linear(modifier: u64) -> bool {
    modifier == DRM_FORMAT_MOD_LINEAR || modifier == crate::capture::drm::DRM_FORMAT_MOD_INVALID
}

/// Bytes per pixel of the first plane
pub fn bytes_per_pixel(fourcc: u32) -> u32 {
    use fourcc::*;
    match fourcc {
        XRGB8888 | XBGR8888 | ARGB8888 | ABGR8888 | XRGB2101010 => 4,
        RGB565 => 2,
        NV12 => 1,
        _ => 4,
    }
}

/// Printable form of a fourcc, e.g. "XR24"
pub fn fourcc_name(fourcc: u32) -> String {
    let bytes = fourcc.to_le_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        bytes.iter().map(|&b| b as char).collect::<String>().trim_end().to_string()
    } else {
        format!("{:#010x}", fourcc)
    }
}
