//! Audio encoding via FFmpeg
//!
//! Provides AAC and Opus encoding of interleaved f32 samples.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::{self, encoder};
use ffmpeg_next::format::sample::Type as SampleType;
use ffmpeg_next::format::Sample;
use ffmpeg_next::util::frame::audio::Audio;
use ffmpeg_next::{ChannelLayout, Dictionary, Rational};
use std::collections::VecDeque;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, RewindError};
use crate::types::{EncodedUnit, StreamParams, TimeBase};

/// Audio encoder
pub struct AudioEncoder {
    /// FFmpeg encoder context
    encoder: encoder::Audio,
    /// Planar input frame
    input_frame: Audio,
    /// Output packet buffer
    packet: ffmpeg::Packet,
    /// Finished units waiting for `produce`
    pending: VecDeque<EncodedUnit>,
    /// Interleaved samples not yet filling a codec frame
    sample_buffer: Vec<f32>,
    /// pts (in samples) of the first buffered sample
    next_pts: Option<i64>,
    /// Channel count
    channels: usize,
    /// Samples per channel per codec frame
    frame_size: usize,
    /// Negotiated parameters
    params: StreamParams,
}

// SAFETY: see VideoEncoder; the contexts are only used through &mut self.
unsafe impl Send for AudioEncoder {}

impl AudioEncoder {
    /// Create a new audio encoder
    ///
    /// # Arguments
    /// * `encoder_name` - FFmpeg encoder ("aac", "libopus")
    /// * `sample_rate` - Input sample rate (Hz)
    /// * `channels` - Number of audio channels
    /// * `bitrate` - Target bitrate in kbps
    pub fn new(encoder_name: &str, sample_rate: u32, channels: u32, bitrate: u32) -> Result<Self> {
        ffmpeg::init().map_err(|e| RewindError::encoder(format!("FFmpeg init failed: {}", e)))?;

        info!(
            "Initializing audio encoder: {} ({}ch @ {}Hz, {}kbps)",
            encoder_name, channels, sample_rate, bitrate
        );

        let ffcodec = encoder::find_by_name(encoder_name).ok_or_else(|| {
            RewindError::encoder(format!("Audio encoder {} not found", encoder_name))
        })?;

        let mut encoder = codec::context::Context::new_with_codec(ffcodec)
            .encoder()
            .audio()
            .map_err(|e| RewindError::encoder(format!("Failed to create audio encoder: {}", e)))?;

        let (channel_layout, channels) = match channels {
            1 => (ChannelLayout::MONO, 1usize),
            2 => (ChannelLayout::STEREO, 2),
            _ => {
                warn!("Unusual channel count {}, defaulting to stereo", channels);
                (ChannelLayout::STEREO, 2)
            }
        };
        let format = Sample::F32(SampleType::Planar);

        encoder.set_rate(sample_rate as i32);
        encoder.set_bit_rate(bitrate as usize * 1000);
        encoder.set_format(format);
        encoder.set_time_base(Rational::new(1, sample_rate as i32));
        encoder.set_channel_layout(channel_layout);
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        if encoder_name == "libopus" {
            opts.set("application", "audio");
        }

        let encoder = encoder
            .open_with(opts)
            .map_err(|e| RewindError::encoder(format!("Failed to open audio encoder: {}", e)))?;

        let frame_size = match encoder.frame_size() as usize {
            0 => 1024,
            n => n,
        };

        let codec_name = encoder
            .codec()
            .map(|c| c.id().name().to_string())
            .unwrap_or_else(|| encoder_name.to_string());

        // SAFETY: same as the video encoder; extradata belongs to the open context.
        let extradata = unsafe {
            let ctx = encoder.as_ptr();
            if (*ctx).extradata.is_null() || (*ctx).extradata_size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts((*ctx).extradata, (*ctx).extradata_size as usize)
                    .to_vec()
            }
        };

        let params = StreamParams::audio(codec_name, sample_rate, channels as u32, frame_size as u32)
            .with_time_base(TimeBase::new(1, sample_rate as i32))
            .with_extradata(extradata);

        info!(
            "Audio encoder opened: {} frame_size={} samples",
            params.codec, frame_size
        );

        let mut input_frame = Audio::new(format, frame_size, channel_layout);
        input_frame.set_rate(sample_rate);

        Ok(Self {
            encoder,
            input_frame,
            packet: ffmpeg::Packet::empty(),
            pending: VecDeque::new(),
            sample_buffer: Vec::with_capacity(frame_size * channels * 2),
            next_pts: None,
            channels,
            frame_size,
            params,
        })
    }

    /// Negotiated stream parameters
    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    /// Buffer interleaved samples captured at `pts` (sample ticks)
    ///
    /// Complete codec frames are encoded immediately.
    pub fn push_samples(&mut self, samples: &[f32], pts: i64) -> Result<()> {
        if self.next_pts.is_none() {
            self.next_pts = Some(pts);
        }
        self.sample_buffer.extend_from_slice(samples);

        let samples_per_frame = self.frame_size * self.channels;
        while self.sample_buffer.len() >= samples_per_frame {
            let chunk: Vec<f32> = self.sample_buffer.drain(..samples_per_frame).collect();
            self.encode_frame(&chunk)?;
        }
        Ok(())
    }

    /// Take the next finished unit, if any
    pub fn produce(&mut self) -> Result<Option<EncodedUnit>> {
        Ok(self.pending.pop_front())
    }

    /// Encode a single frame of audio
    fn encode_frame(&mut self, samples: &[f32]) -> Result<()> {
        for ch in 0..self.channels {
            let plane = self.input_frame.plane_mut::<f32>(ch);
            for (i, sample) in plane.iter_mut().enumerate().take(self.frame_size) {
                *sample = samples[i * self.channels + ch];
            }
        }

        let pts = self.next_pts.unwrap_or(0);
        self.input_frame.set_pts(Some(pts));
        self.next_pts = Some(pts + self.frame_size as i64);

        self.encoder
            .send_frame(&self.input_frame)
            .map_err(|e| RewindError::encoder(format!("Failed to send audio frame: {}", e)))?;

        self.receive_packets()
    }

    /// Receive encoded packets from the encoder
    fn receive_packets(&mut self) -> Result<()> {
        loop {
            match self.encoder.receive_packet(&mut self.packet) {
                Ok(()) => {
                    let data = self.packet.data().map(|d| d.to_vec()).unwrap_or_default();
                    let pts = self.packet.pts().unwrap_or(0);
                    let unit = EncodedUnit::new(data, pts, self.packet.dts().unwrap_or(pts), true);
                    trace!("Encoded audio packet: pts={}, size={}", unit.pts, unit.len());
                    self.pending.push_back(unit);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    return Err(RewindError::encoder(format!(
                        "Failed to receive audio packet: {}",
                        e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drop buffered samples after a capture gap
    pub fn reset_clock(&mut self) {
        if !self.sample_buffer.is_empty() {
            debug!("Dropping {} buffered samples", self.sample_buffer.len());
        }
        self.sample_buffer.clear();
        self.next_pts = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aac_encoder_params() {
        let Ok(encoder) = AudioEncoder::new("aac", 48000, 2, 128) else {
            return; // FFmpeg built without the native AAC encoder
        };
        assert_eq!(encoder.params().time_base, TimeBase::new(1, 48000));
        assert_eq!(encoder.params().channels, 2);
        assert_eq!(encoder.params().codec, "aac");
    }
}
