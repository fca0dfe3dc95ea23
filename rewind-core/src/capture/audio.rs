//! Audio capture via FFmpeg's PulseAudio input device
//!
//! Captures the given PulseAudio source (a monitor for desktop audio, or a
//! microphone) as s16le and encodes it on the spot.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::{self, Format};
use ffmpeg_next::Dictionary;
use tracing::{debug, info};

use crate::encode::AudioEncoder;
use crate::error::{Result, RewindError};
use crate::pipeline::UnitSource;
use crate::types::{monotonic_micros, EncodedUnit, StreamParams, TimeBase};

/// PulseAudio capture feeding an audio encoder
pub struct AudioCapture {
    input: format::context::Input,
    packet: ffmpeg::Packet,
    encoder: AudioEncoder,
    name: String,
    sample_rate: u32,
    channels: u32,
    samples_captured: u64,
}

// SAFETY: the demuxer context is only used through &mut self from the worker thread.
unsafe impl Send for AudioCapture {}

impl AudioCapture {
    /// Open `source` ("default" or a PulseAudio source name)
    pub fn open(source: &str, encoder: AudioEncoder) -> Result<Self> {
        ffmpeg::init().map_err(|e| RewindError::capture(format!("FFmpeg init failed: {}", e)))?;
        ffmpeg::device::register_all();

        let pulse = ffmpeg::device::input::audio()
            .find(|f| f.name() == "pulse")
            .ok_or_else(|| RewindError::capture("FFmpeg was built without PulseAudio input"))?;

        let params = encoder.params();
        let sample_rate = params.sample_rate;
        let channels = params.channels;

        let mut opts = Dictionary::new();
        opts.set("sample_rate", &sample_rate.to_string());
        opts.set("channels", &channels.to_string());
        opts.set("fragment_size", "4096");

        let input = format::open_with(source, &Format::Input(pulse), opts)
            .map_err(|e| RewindError::capture(format!("Failed to open audio source '{}': {}", source, e)))?
            .input();

        info!(
            "Audio capture on '{}': {}ch @ {}Hz",
            source, channels, sample_rate
        );

        Ok(Self {
            input,
            packet: ffmpeg::Packet::empty(),
            encoder,
            name: format!("pulse:{}", source),
            sample_rate,
            channels,
            samples_captured: 0,
        })
    }

    /// Samples per channel captured so far
    pub fn samples_captured(&self) -> u64 {
        self.samples_captured
    }
}

impl UnitSource for AudioCapture {
    fn params(&self) -> &StreamParams {
        self.encoder.params()
    }

    fn next_unit(&mut self) -> Result<Option<EncodedUnit>> {
        if let Some(unit) = self.encoder.produce()? {
            return Ok(Some(unit));
        }

        if let Err(e) = self.packet.read(&mut self.input) {
            self.encoder.reset_clock();
            return Err(RewindError::capture(format!("Audio read failed: {}", e)));
        }

        let Some(data) = self.packet.data() else {
            return Ok(None);
        };
        let samples = s16le_to_f32(data);
        let frames = samples.len() as u64 / self.channels.max(1) as u64;

        // The packet ends now; its first sample was captured `frames` samples ago
        let tb = TimeBase::new(1, self.sample_rate as i32);
        let pts = tb.from_micros(monotonic_micros()) - frames as i64;

        self.samples_captured += frames;
        debug!("Captured {} audio frames", frames);
        self.encoder.push_samples(&samples, pts)?;
        self.encoder.produce()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Convert interleaved s16le PCM to f32 in [-1, 1)
fn s16le_to_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}
