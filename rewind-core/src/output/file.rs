//! Container output via FFmpeg
//!
//! Writes saved replays to MP4, MKV, or any container FFmpeg picks from the
//! file extension.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use ffmpeg::codec::Id;
use ffmpeg::format::context::Output;
use ffmpeg::Rational;
use ffmpeg_next as ffmpeg;

use super::Muxer;
use crate::error::{Result, RewindError};
use crate::types::{EncodedUnit, StreamKind, StreamParams};

/// Padding FFmpeg expects after extradata
const EXTRADATA_PADDING: usize = 64;

/// One file being written
struct OpenFile {
    path: PathBuf,
    output: Output,
    /// Time base units arrive in, per track
    source_time_bases: Vec<Rational>,
    header_written: bool,
    units_written: u64,
}

/// FFmpeg-backed [`Muxer`]
#[derive(Default)]
pub struct FfmpegMuxer {
    file: Option<OpenFile>,
}

// SAFETY: the output context is owned exclusively and only touched through
// &mut self; saves run on one thread at a time.
unsafe impl Send for FfmpegMuxer {}

impl FfmpegMuxer {
    /// Create an idle muxer
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the file currently being written
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    fn file_mut(&mut self) -> Result<&mut OpenFile> {
        self.file
            .as_mut()
            .ok_or_else(|| RewindError::muxer("No output file is open"))
    }
}

impl Muxer for FfmpegMuxer {
    fn open(&mut self, path: &Path) -> Result<()> {
        if self.file.is_some() {
            warn!("Discarding unfinished output before opening {:?}", path);
            self.abort();
        }

        ffmpeg::init().map_err(|e| RewindError::muxer(format!("FFmpeg init failed: {}", e)))?;

        let output = ffmpeg::format::output(&path).map_err(|e| {
            RewindError::muxer(format!("Failed to create output file {:?}: {}", path, e))
        })?;

        debug!("Opened {:?} as {}", path, output.format().name());
        self.file = Some(OpenFile {
            path: path.to_path_buf(),
            output,
            source_time_bases: Vec::new(),
            header_written: false,
            units_written: 0,
        });
        Ok(())
    }

    fn add_track(&mut self, params: &StreamParams) -> Result<usize> {
        let file = self.file_mut()?;
        if file.header_written {
            return Err(RewindError::muxer("Cannot add a track after the header"));
        }

        let codec_id = codec_id(&params.codec)?;
        let time_base = Rational::new(params.time_base.num, params.time_base.den);

        {
            let mut stream = file.output.add_stream(codec_id).map_err(|e| {
                RewindError::muxer(format!("Failed to add {} track: {}", params.kind, e))
            })?;

            let codec_par = stream.parameters();
            // SAFETY: rust-ffmpeg has no setters for stream codec parameters.
            // The pointer comes from the stream just created and stays valid
            // while the output context lives. Extradata is allocated with
            // av_malloc so FFmpeg can free it with the context.
            unsafe {
                let ptr = codec_par.as_ptr() as *mut ffmpeg::ffi::AVCodecParameters;
                (*ptr).codec_id = codec_id.into();
                match params.kind {
                    StreamKind::Video => {
                        (*ptr).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
                        (*ptr).width = params.width as i32;
                        (*ptr).height = params.height as i32;
                        (*ptr).format = ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
                    }
                    StreamKind::Audio => {
                        (*ptr).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
                        (*ptr).sample_rate = params.sample_rate as i32;
                        (*ptr).ch_layout.nb_channels = params.channels as i32;
                        (*ptr).format = ffmpeg::ffi::AVSampleFormat::AV_SAMPLE_FMT_FLTP as i32;
                    }
                }

                if !params.extradata.is_empty() {
                    let size = params.extradata.len();
                    let buf = ffmpeg::ffi::av_mallocz(size + EXTRADATA_PADDING) as *mut u8;
                    if buf.is_null() {
                        return Err(RewindError::muxer("Out of memory for codec extradata"));
                    }
                    std::ptr::copy_nonoverlapping(params.extradata.as_ptr(), buf, size);
                    (*ptr).extradata = buf;
                    (*ptr).extradata_size = size as i32;
                }
            }

            stream.set_time_base(time_base);
        }

        file.source_time_bases.push(time_base);
        let index = file.output.nb_streams() as usize - 1;
        info!(
            "Track {}: {} {} ({})",
            index, params.kind, params.codec, params.time_base
        );
        Ok(index)
    }

    fn write_header(&mut self) -> Result<()> {
        let file = self.file_mut()?;
        if file.header_written {
            return Ok(());
        }
        if file.source_time_bases.is_empty() {
            return Err(RewindError::muxer("No tracks declared"));
        }
        file.output
            .write_header()
            .map_err(|e| RewindError::muxer(format!("Failed to write header: {}", e)))?;
        file.header_written = true;
        debug!("Header written to {:?}", file.path);
        Ok(())
    }

    fn write(&mut self, unit: &EncodedUnit) -> Result<()> {
        let file = self.file_mut()?;
        if !file.header_written {
            return Err(RewindError::muxer("Header not written"));
        }
        let source_tb = *file.source_time_bases.get(unit.stream_index).ok_or_else(|| {
            RewindError::muxer(format!("Unit for unknown track {}", unit.stream_index))
        })?;
        // The container may have picked its own time base in write_header
        let output_tb = file
            .output
            .stream(unit.stream_index)
            .map(|s| s.time_base())
            .unwrap_or(source_tb);

        let mut pkt = ffmpeg::Packet::copy(&unit.data);
        pkt.set_stream(unit.stream_index);
        pkt.set_pts(Some(unit.pts));
        pkt.set_dts(Some(unit.dts));
        if unit.keyframe {
            pkt.set_flags(ffmpeg::packet::Flags::KEY);
        }
        pkt.rescale_ts(source_tb, output_tb);

        pkt.write_interleaved(&mut file.output)
            .map_err(|e| RewindError::muxer(format!("Failed to write packet: {}", e)))?;
        file.units_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| RewindError::muxer("No output file is open"))?;
        if !file.header_written {
            let path = file.path.clone();
            drop(file);
            remove_partial(&path);
            return Err(RewindError::muxer("Closing a file without a header"));
        }

        if let Err(e) = file.output.write_trailer() {
            let path = file.path.clone();
            drop(file);
            remove_partial(&path);
            return Err(RewindError::muxer(format!("Failed to write trailer: {}", e)));
        }

        info!(
            "Wrote {:?} ({} units, {} tracks)",
            file.path,
            file.units_written,
            file.source_time_bases.len()
        );
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(file) = self.file.take() {
            let path = file.path.clone();
            // Dropping the context closes the file handle before removal
            drop(file);
            remove_partial(&path);
        }
    }
}

impl Drop for FfmpegMuxer {
    fn drop(&mut self) {
        self.abort();
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed partial output {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {:?}: {}", path, e),
    }
}

/// Map a codec name ("h264", "aac", ...) to its FFmpeg id
fn codec_id(name: &str) -> Result<Id> {
    ffmpeg::codec::decoder::find_by_name(name)
        .or_else(|| ffmpeg::codec::encoder::find_by_name(name))
        .map(|c| c.id())
        .ok_or_else(|| RewindError::muxer(format!("Unknown codec '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_id_lookup() {
        ffmpeg::init().unwrap();
        assert_eq!(codec_id("h264").unwrap(), Id::H264);
        assert!(codec_id("not-a-codec").is_err());
    }

    #[test]
    fn test_write_without_open_fails() {
        let mut muxer = FfmpegMuxer::new();
        let unit = EncodedUnit::new(vec![0], 0, 0, true);
        assert!(muxer.write(&unit).is_err());
        assert!(muxer.close().is_err());
        muxer.abort();
    }

    #[test]
    fn test_abort_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.mkv");
        let mut muxer = FfmpegMuxer::new();
        muxer.open(&path).unwrap();
        assert_eq!(muxer.path(), Some(path.as_path()));
        muxer.abort();
        assert!(!path.exists());
        assert!(muxer.path().is_none());
    }
}
