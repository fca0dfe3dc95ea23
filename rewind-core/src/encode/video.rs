//! Video encoder via FFmpeg
//!
//! Frames are mapped to CPU memory, converted with swscale and encoded with
//! any FFmpeg video encoder. Only linear scanout buffers can be mapped.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::{self, encoder};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{self, Flags};
use ffmpeg_next::util::frame::video::Video;
use ffmpeg_next::{Dictionary, Rational};
use std::collections::VecDeque;
use tracing::{debug, info, trace, warn};

use super::Encoder;
use crate::error::{Result, RewindError};
use crate::formats::{self, fourcc};
use crate::types::{EncodedUnit, Frame, FrameData, FrameFormat, StreamParams, TimeBase};

/// FFmpeg video encoder
pub struct VideoEncoder {
    /// FFmpeg encoder context
    encoder: encoder::Video,
    /// Converter from the capture format, created on the first frame
    scaler: Option<scaling::Context>,
    /// Format the scaler was built for
    source_format: Option<FrameFormat>,
    /// Encoder input frame
    frame: Video,
    /// Output packet buffer
    packet: ffmpeg::Packet,
    /// Finished units waiting for `produce`
    pending: VecDeque<EncodedUnit>,
    /// Negotiated parameters
    params: StreamParams,
    /// Last pts handed to the encoder
    last_pts: Option<i64>,
}

// SAFETY: the FFmpeg contexts are owned exclusively by this struct and are
// only ever touched through &mut self, so moving them to the capture worker
// thread is sound.
unsafe impl Send for VideoEncoder {}

impl VideoEncoder {
    /// Open `encoder_name` (e.g. "libx264") for `width`x`height` at `fps`
    pub fn new(
        encoder_name: &str,
        width: u32,
        height: u32,
        fps: u32,
        bitrate_kbps: u32,
        preset: Option<&str>,
    ) -> Result<Self> {
        ffmpeg::init().map_err(|e| RewindError::encoder(format!("FFmpeg init failed: {}", e)))?;

        info!("Initializing video encoder: {}", encoder_name);
        let ffcodec = encoder::find_by_name(encoder_name)
            .ok_or_else(|| RewindError::encoder(format!("Encoder {} not found", encoder_name)))?;

        let mut encoder = codec::context::Context::new_with_codec(ffcodec)
            .encoder()
            .video()
            .map_err(|e| RewindError::encoder(format!("Failed to create encoder context: {}", e)))?;

        let fps = fps.max(1);
        let time_base = TimeBase::new(1, fps as i32);
        let bitrate = bitrate_kbps as usize * 1000;

        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(Rational::new(1, fps as i32));
        encoder.set_frame_rate(Some(Rational::new(fps as i32, 1)));
        encoder.set_bit_rate(bitrate);
        encoder.set_max_bit_rate(bitrate * 2);
        // One keyframe per second keeps the trimmed start of a replay close to the window
        encoder.set_gop(fps);
        encoder.set_max_b_frames(0);
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        if let Some(preset) = preset {
            opts.set("preset", preset);
        }
        if encoder_name.starts_with("libx26") {
            opts.set("tune", "zerolatency");
        }

        let encoder = encoder
            .open_with(opts)
            .map_err(|e| RewindError::encoder(format!("Failed to open encoder: {}", e)))?;

        let codec_name = encoder
            .codec()
            .map(|c| c.id().name().to_string())
            .unwrap_or_else(|| encoder_name.to_string());

        // SAFETY: the context is open; extradata is owned by it and valid for
        // extradata_size bytes (or null).
        let extradata = unsafe {
            let ctx = encoder.as_ptr();
            if (*ctx).extradata.is_null() || (*ctx).extradata_size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts((*ctx).extradata, (*ctx).extradata_size as usize)
                    .to_vec()
            }
        };

        let params = StreamParams::video(codec_name, width, height, fps)
            .with_time_base(time_base)
            .with_extradata(extradata);

        info!(
            "Video encoder opened: {} {}x{} @ {}fps, {}kbps",
            params.codec, width, height, fps, bitrate_kbps
        );

        Ok(Self {
            encoder,
            scaler: None,
            source_format: None,
            frame: Video::new(Pixel::YUV420P, width, height),
            packet: ffmpeg::Packet::empty(),
            pending: VecDeque::new(),
            params,
            last_pts: None,
        })
    }

    /// Ensure the scaler is configured for the input format
    fn ensure_scaler(&mut self, format: &FrameFormat) -> Result<()> {
        if self.scaler.is_some() && self.source_format.as_ref() == Some(format) {
            return Ok(());
        }

        let src_format = pixel_format_from_fourcc(format.fourcc)?;
        debug!(
            "Creating scaler: {:?} {}x{} -> {:?} {}x{}",
            src_format,
            format.width,
            format.height,
            Pixel::YUV420P,
            self.params.width,
            self.params.height
        );

        let scaler = scaling::Context::get(
            src_format,
            format.width,
            format.height,
            Pixel::YUV420P,
            self.params.width,
            self.params.height,
            Flags::BILINEAR,
        )
        .map_err(|e| RewindError::encoder(format!("Failed to create scaler: {}", e)))?;

        self.scaler = Some(scaler);
        self.source_format = Some(*format);
        Ok(())
    }

    /// Copy the first plane of `input` into an FFmpeg frame, row by row
    fn load_source(&self, input: &Frame) -> Result<Video> {
        let format = &input.format;
        let stride = match &input.data {
            FrameData::DmaBuf { planes, .. } => {
                if !formats::is_linear(format.modifier) {
                    return Err(RewindError::Unsupported(format!(
                        "cannot map tiled framebuffer (modifier {:#x})",
                        format.modifier
                    )));
                }
                planes.first().map(|p| p.stride).unwrap_or(0) as usize
            }
            FrameData::Memory(_) => (format.width * formats::bytes_per_pixel(format.fourcc)) as usize,
        };
        let row_bytes = (format.width * formats::bytes_per_pixel(format.fourcc)) as usize;
        let stride = stride.max(row_bytes);
        let height = format.height as usize;

        let data = input
            .data
            .try_map_dmabuf(stride * height)
            .map_err(|e| RewindError::encoder(format!("Failed to map frame: {}", e)))?;
        if height == 0 || data.len() < stride * (height - 1) + row_bytes {
            return Err(RewindError::encoder(format!(
                "frame holds {} bytes, {}x{} needs {}",
                data.len(),
                format.width,
                format.height,
                stride * height
            )));
        }

        let mut source = Video::new(pixel_format_from_fourcc(format.fourcc)?, format.width, format.height);
        let dst_stride = source.stride(0);
        let plane = source.data_mut(0);
        for row in 0..height {
            let src = &data[row * stride..row * stride + row_bytes];
            plane[row * dst_stride..row * dst_stride + row_bytes].copy_from_slice(src);
        }
        Ok(source)
    }

    /// Receive encoded packets from the encoder
    fn receive_packets(&mut self) -> Result<()> {
        loop {
            match self.encoder.receive_packet(&mut self.packet) {
                Ok(()) => {
                    let data = self.packet.data().map(|d| d.to_vec()).unwrap_or_default();
                    let pts = self.packet.pts().unwrap_or(0);
                    let unit = EncodedUnit::new(
                        data,
                        pts,
                        self.packet.dts().unwrap_or(pts),
                        self.packet.is_key(),
                    );
                    trace!(
                        "Encoded packet: pts={}, size={}, keyframe={}",
                        unit.pts,
                        unit.len(),
                        unit.keyframe
                    );
                    self.pending.push_back(unit);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    return Err(RewindError::encoder(format!("Failed to receive packet: {}", e)));
                }
            }
        }
        Ok(())
    }
}

impl Encoder for VideoEncoder {
    fn params(&self) -> &StreamParams {
        &self.params
    }

    fn send_frame(&mut self, input: &Frame) -> Result<()> {
        self.ensure_scaler(&input.format)?;
        let source = self.load_source(input)?;

        if let Some(scaler) = self.scaler.as_mut() {
            scaler
                .run(&source, &mut self.frame)
                .map_err(|e| RewindError::encoder(format!("Scaling failed: {}", e)))?;
        }

        let mut pts = TimeBase::MICROSECONDS.rescale(input.pts, self.params.time_base);
        if let Some(last) = self.last_pts {
            if pts <= last {
                pts = last + 1;
            }
        }
        self.last_pts = Some(pts);
        self.frame.set_pts(Some(pts));

        self.encoder
            .send_frame(&self.frame)
            .map_err(|e| RewindError::encoder(format!("Failed to send frame: {}", e)))?;
        self.receive_packets()
    }

    fn produce(&mut self) -> Result<Option<EncodedUnit>> {
        Ok(self.pending.pop_front())
    }
}

/// Convert DRM fourcc to FFmpeg pixel format (packed formats only)
fn pixel_format_from_fourcc(code: u32) -> Result<Pixel> {
    match code {
        fourcc::XRGB8888 | fourcc::ARGB8888 => Ok(Pixel::BGRA),
        fourcc::XBGR8888 | fourcc::ABGR8888 => Ok(Pixel::RGBA),
        fourcc::RGB565 => Ok(Pixel::RGB565LE),
        _ => {
            warn!("Unsupported capture format {}", formats::fourcc_name(code));
            Err(RewindError::Unsupported(format!(
                "pixel format {}",
                formats::fourcc_name(code)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_conversion() {
        assert_eq!(pixel_format_from_fourcc(fourcc::XRGB8888).unwrap(), Pixel::BGRA);
        assert_eq!(pixel_format_from_fourcc(fourcc::XBGR8888).unwrap(), Pixel::RGBA);
        assert!(pixel_format_from_fourcc(fourcc::NV12).is_err());
    }
}
