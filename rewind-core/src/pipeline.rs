//! Continuous capture-encode-retain pipeline
//!
//! Each tracked stream runs on its own [`StreamWorker`] thread, which pulls
//! encoded units from a [`UnitSource`] and pushes them into the stream's
//! [`RetentionBuffer`]. The worker is the buffer's only writer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::capture::Device;
use crate::encode::Encoder;
use crate::error::{Result, RewindError};
use crate::retention::RetentionBuffer;
use crate::types::{EncodedUnit, StreamParams};

/// First retry delay after a failed attempt
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Longest retry delay
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Granularity of shutdown checks while backing off
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Anything that yields encoded units for one stream
pub trait UnitSource: Send {
    /// Parameters of the produced stream
    fn params(&self) -> &StreamParams;

    /// Produce the next unit
    ///
    /// `Ok(None)` means nothing was ready this attempt. Errors are treated as
    /// transient by the worker.
    fn next_unit(&mut self) -> Result<Option<EncodedUnit>>;

    /// Name used in logs and thread names
    fn name(&self) -> &str;
}

/// A [`Device`] feeding an [`Encoder`]
pub struct EncodePipeline<D, E> {
    device: D,
    encoder: E,
    frames: u64,
}

impl<D: Device, E: Encoder> EncodePipeline<D, E> {
    /// Connect a device to an encoder
    pub fn new(device: D, encoder: E) -> Self {
        Self {
            device,
            encoder,
            frames: 0,
        }
    }

    /// Frames handed to the encoder so far
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl<D: Device, E: Encoder> UnitSource for EncodePipeline<D, E> {
    fn params(&self) -> &StreamParams {
        self.encoder.params()
    }

    fn next_unit(&mut self) -> Result<Option<EncodedUnit>> {
        if let Some(unit) = self.encoder.produce()? {
            return Ok(Some(unit));
        }

        match self.device.next_frame()? {
            Some(frame) => {
                self.frames += 1;
                self.encoder.send_frame(&frame)?;
                self.encoder.produce()
            }
            None => Ok(None),
        }
    }

    fn name(&self) -> &str {
        self.device.name()
    }
}

/// Counters shared between a worker thread and its owner
#[derive(Debug, Default)]
pub struct WorkerStats {
    units: AtomicU64,
    errors: AtomicU64,
}

impl WorkerStats {
    /// Units pushed into the buffer
    pub fn units(&self) -> u64 {
        self.units.load(Ordering::Relaxed)
    }

    /// Failed attempts
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Capture thread for one stream
pub struct StreamWorker {
    name: String,
    handle: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl StreamWorker {
    /// Start pulling from `source` into `buffer` until `shutdown` is set
    ///
    /// Units are tagged with `stream_index` before they are retained.
    pub fn spawn(
        stream_index: usize,
        source: Box<dyn UnitSource>,
        buffer: Arc<RetentionBuffer>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let name = format!("{}-{}", buffer.kind(), stream_index);
        let stats = Arc::new(WorkerStats::default());
        let thread_stats = Arc::clone(&stats);

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                run_worker(stream_index, source, &buffer, &shutdown, &thread_stats);
            })
            .map_err(|e| RewindError::capture(format!("Failed to spawn {} thread: {}", name, e)))?;

        debug!("Started worker {}", name);
        Ok(Self {
            name,
            handle: Some(handle),
            stats,
        })
    }

    /// Worker name (also the thread name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared counters
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Whether the thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Wait for the thread to exit; the shutdown flag must already be set
    pub fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Worker {} panicked", self.name);
            }
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.join_inner();
    }
}

fn run_worker(
    stream_index: usize,
    mut source: Box<dyn UnitSource>,
    buffer: &RetentionBuffer,
    shutdown: &AtomicBool,
    stats: &WorkerStats,
) {
    info!(
        "Capturing {} stream {} from {}",
        buffer.kind(),
        stream_index,
        source.name()
    );

    let mut backoff = INITIAL_BACKOFF;
    let mut failing = false;

    while !shutdown.load(Ordering::SeqCst) {
        match source.next_unit() {
            Ok(Some(unit)) => {
                if failing {
                    info!("{} recovered", source.name());
                    failing = false;
                    backoff = INITIAL_BACKOFF;
                }
                trace!("stream {}: pts={} size={}", stream_index, unit.pts, unit.len());
                buffer.push(unit.with_stream(stream_index));
                stats.units.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                if failing {
                    debug!("{}: {}", source.name(), e);
                } else {
                    warn!("{} failed, retrying: {}", source.name(), e);
                    failing = true;
                }
                sleep_unless_shutdown(backoff, shutdown);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    debug!(
        "Worker for stream {} stopping after {} units",
        stream_index,
        stats.units()
    );
}

fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) {
    let mut remaining = duration;
    while !remaining.is_zero() && !shutdown.load(Ordering::SeqCst) {
        let step = remaining.min(SHUTDOWN_POLL);
        std::thread::sleep(step);
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StreamKind, TimeBase};
    use std::collections::VecDeque;

    struct ScriptedSource {
        params: StreamParams,
        script: VecDeque<Result<Option<EncodedUnit>>>,
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

    #[test]
    fn test_worker_retries_after_errors() {
        let script = VecDeque::from(vec![
            Ok(Some(EncodedUnit::new(vec![1], 0, 0, true))),
            Err(RewindError::capture("hiccup")),
            Ok(None),
            Ok(Some(EncodedUnit::new(vec![2], 1, 1, false))),
        ]);
        let source = ScriptedSource {
            params: StreamParams::video("h264", 64, 64, 30),
            script,
        };
        let buffer = Arc::new(RetentionBuffer::with_capacity(
            StreamKind::Video,
            8,
            TimeBase::new(1, 30),
            i64::MAX,
        ));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker =
            StreamWorker::spawn(3, Box::new(source), Arc::clone(&buffer), Arc::clone(&shutdown))
                .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while buffer.len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        shutdown.store(true, Ordering::SeqCst);
        assert_eq!(worker.stats().errors(), 1);
        worker.join();

        let snap = buffer.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.units.iter().all(|u| u.stream_index == 3));
    }
}
