//! Turning retained history into a replay file
//!
//! On a trigger the [`SaveCoordinator`] snapshots every tracked buffer, rebases
//! the timestamps so the file starts at zero, interleaves the streams and
//! hands the result to a [`Muxer`]. Buffers are only touched after the file
//! has been written; a failed save leaves them as they were.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RewindError};
use crate::output::{Muxer, OutputTemplate};
use crate::retention::{RetentionBuffer, Snapshot};
use crate::types::{EncodedUnit, StreamKind, StreamParams, TimeBase};

/// Placeholder replaced by the saved file's path in the post-save command
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Environment variable holding the saved file's path for the post-save command
pub const FILE_ENV: &str = "REWIND_FILE";

/// A stream whose history is saved on trigger
#[derive(Debug, Clone)]
pub struct TrackedStream {
    /// Parameters used to declare the track
    pub params: StreamParams,
    /// The stream's history
    pub buffer: Arc<RetentionBuffer>,
}

/// Outcome of a successful save
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    /// File written
    pub path: PathBuf,
    /// Units written per tracked stream (0 for skipped streams)
    pub units_per_stream: Vec<usize>,
    /// Span of the saved window in microseconds
    pub duration_micros: i64,
}

impl SaveReport {
    /// Total units written
    pub fn units(&self) -> usize {
        self.units_per_stream.iter().sum()
    }
}

/// Writes the retained window of every tracked stream to one file
pub struct SaveCoordinator {
    streams: Vec<TrackedStream>,
    muxer: Box<dyn Muxer>,
    template: OutputTemplate,
    start_on_keyframe: bool,
    post_save: Option<String>,
    saves: u64,
}

impl SaveCoordinator {
    /// Create a coordinator writing through `muxer` to paths from `template`
    pub fn new(muxer: Box<dyn Muxer>, template: OutputTemplate) -> Self {
        Self {
            streams: Vec::new(),
            muxer,
            template,
            start_on_keyframe: true,
            post_save: None,
            saves: 0,
        }
    }

    /// Drop leading video units before the first keyframe (default on)
    pub fn with_start_on_keyframe(mut self, enabled: bool) -> Self {
        self.start_on_keyframe = enabled;
        self
    }

    /// Shell command run after each successful save
    pub fn with_post_save(mut self, command: Option<String>) -> Self {
        self.post_save = command.filter(|c| !c.trim().is_empty());
        self
    }

    /// Start tracking a stream; returns its index
    ///
    /// Streams are locked and written in the order they are tracked, so video
    /// streams should be tracked first.
    pub fn track(&mut self, params: StreamParams, buffer: Arc<RetentionBuffer>) -> usize {
        self.streams.push(TrackedStream { params, buffer });
        self.streams.len() - 1
    }

    /// Tracked streams in index order
    pub fn streams(&self) -> &[TrackedStream] {
        &self.streams
    }

    /// Successful saves so far
    pub fn saves(&self) -> u64 {
        self.saves
    }

    /// Save to a path rendered from the output template
    pub fn save(&mut self) -> Result<SaveReport> {
        let path = self.template.prepare()?;
        self.save_to(&path)
    }

    /// Save the retained window to `path`
    pub fn save_to(&mut self, path: &Path) -> Result<SaveReport> {
        if self.streams.is_empty() {
            return Err(RewindError::save("No streams are being recorded"));
        }
        let started = Instant::now();

        let mut snapshots = self.snapshot_all();
        let last_seqs: Vec<Option<u64>> = snapshots.iter().map(|s| s.last_seq).collect();
        debug!(
            "Snapshot of {} streams taken in {:?}",
            snapshots.len(),
            started.elapsed()
        );

        if self.start_on_keyframe {
            for snapshot in snapshots.iter_mut().filter(|s| s.kind == StreamKind::Video) {
                let dropped = trim_to_keyframe(snapshot);
                if dropped > 0 {
                    debug!("Dropped {} units before the first keyframe", dropped);
                }
            }
        }

        if snapshots.iter().all(Snapshot::is_empty) {
            return Err(RewindError::save("Nothing has been captured yet"));
        }

        let time_bases: Vec<TimeBase> = self.streams.iter().map(|s| s.params.time_base).collect();
        let duration_micros = window_span(&snapshots, &time_bases);
        rebase(&mut snapshots, &time_bases);
        let units_per_stream: Vec<usize> = snapshots.iter().map(Snapshot::len).collect();

        // Empty streams get no track; remap the rest to consecutive track indices
        let mut track_of = vec![None; snapshots.len()];
        let mut next_track = 0;
        for (index, snapshot) in snapshots.iter().enumerate() {
            if snapshot.is_empty() {
                warn!(
                    "Stream {} ({}) has no data, leaving it out",
                    index, self.streams[index].params.kind
                );
            } else {
                track_of[index] = Some(next_track);
                next_track += 1;
            }
        }

        let units = interleave(snapshots, &time_bases);

        if let Err(e) = self.write_file(path, &track_of, &units) {
            self.muxer.abort();
            error!("Save to {:?} failed: {}", path, e);
            return Err(e.with_context(format!("Failed to save {:?}", path)));
        }

        self.saves += 1;
        info!(
            "Saved {:.1}s replay to {:?} ({} units) in {:?}",
            duration_micros as f64 / 1_000_000.0,
            path,
            units.len(),
            started.elapsed()
        );

        if let Some(command) = &self.post_save {
            run_post_save(command, path);
        }

        for (stream, last_seq) in self.streams.iter().zip(last_seqs) {
            if let Some(seq) = last_seq {
                let dropped = stream.buffer.discard_through(seq);
                debug!("Released {} saved {} units", dropped, stream.params.kind);
            }
        }

        Ok(SaveReport {
            path: path.to_path_buf(),
            units_per_stream,
            duration_micros,
        })
    }

    /// Lock every buffer in index order, copy, then release them all
    fn snapshot_all(&self) -> Vec<Snapshot> {
        let guards: Vec<_> = self.streams.iter().map(|s| s.buffer.lock()).collect();
        let snapshots = guards.iter().map(|g| g.snapshot()).collect();
        drop(guards);
        snapshots
    }

    fn write_file(
        &mut self,
        path: &Path,
        track_of: &[Option<usize>],
        units: &[EncodedUnit],
    ) -> Result<()> {
        self.muxer.open(path)?;
        for (stream, track) in self.streams.iter().zip(track_of) {
            if let Some(track) = track {
                let declared = self.muxer.add_track(&stream.params)?;
                if declared != *track {
                    return Err(RewindError::muxer(format!(
                        "Muxer assigned track {} where {} was expected",
                        declared, track
                    )));
                }
            }
        }
        self.muxer.write_header()?;

        for unit in units {
            let track = track_of
                .get(unit.stream_index)
                .copied()
                .flatten()
                .ok_or_else(|| RewindError::save(format!("No track for stream {}", unit.stream_index)))?;
            let mut unit = unit.clone();
            unit.stream_index = track;
            self.muxer.write(&unit)?;
        }

        self.muxer.close()
    }
}

/// Drop units before the first keyframe; returns how many were dropped
///
/// A snapshot without any keyframe is left as is.
pub fn trim_to_keyframe(snapshot: &mut Snapshot) -> usize {
    match snapshot.units.iter().position(|u| u.keyframe) {
        Some(first) if first > 0 => {
            snapshot.units.drain(..first);
            first
        }
        _ => 0,
    }
}

/// Earliest pts across all snapshots, in microseconds
pub fn zero_reference(snapshots: &[Snapshot], time_bases: &[TimeBase]) -> Option<i64> {
    snapshots
        .iter()
        .zip(time_bases)
        .filter_map(|(s, tb)| s.min_pts().map(|pts| tb.to_micros(pts)))
        .min()
}

/// Shift every unit so the earliest pts across streams becomes 0
///
/// Each stream is shifted by the same wall-clock amount expressed in its own
/// time base, so spacing inside a stream is untouched.
pub fn rebase(snapshots: &mut [Snapshot], time_bases: &[TimeBase]) {
    let Some(zero) = zero_reference(snapshots, time_bases) else {
        return;
    };
    for (snapshot, tb) in snapshots.iter_mut().zip(time_bases) {
        let Some(min_pts) = snapshot.min_pts() else {
            continue;
        };
        // The stream that set the reference is shifted by its own minimum,
        // avoiding a rounding error of one tick
        let offset = if tb.to_micros(min_pts) == zero {
            min_pts
        } else {
            tb.from_micros(zero)
        };
        for unit in snapshot.units.iter_mut() {
            unit.pts -= offset;
            unit.dts -= offset;
        }
    }
}

/// Merge snapshots into one decode-ordered list
///
/// Units are tagged with their snapshot's index. Ties are broken by stream
/// index, and units of one stream keep their relative order.
pub fn interleave(snapshots: Vec<Snapshot>, time_bases: &[TimeBase]) -> Vec<EncodedUnit> {
    let mut keyed: Vec<(i64, usize, EncodedUnit)> = Vec::new();
    for (index, (snapshot, tb)) in snapshots.into_iter().zip(time_bases).enumerate() {
        keyed.extend(
            snapshot
                .units
                .into_iter()
                .map(|u| (tb.to_micros(u.dts), index, u.with_stream(index))),
        );
    }
    keyed.sort_by_key(|(dts, index, _)| (*dts, *index));
    keyed.into_iter().map(|(_, _, unit)| unit).collect()
}

fn window_span(snapshots: &[Snapshot], time_bases: &[TimeBase]) -> i64 {
    let Some(start) = zero_reference(snapshots, time_bases) else {
        return 0;
    };
    snapshots
        .iter()
        .zip(time_bases)
        .filter_map(|(s, tb)| s.units.iter().map(|u| u.pts).max().map(|p| tb.to_micros(p)))
        .max()
        .map_or(0, |end| end - start)
}

/// Quote `value` for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Expand the post-save command for `path`
pub fn post_save_command(template: &str, path: &Path) -> String {
    template.replace(FILE_PLACEHOLDER, &shell_quote(&path.to_string_lossy()))
}

/// Run the post-save command on a detached thread
fn run_post_save(template: &str, path: &Path) {
    let command = post_save_command(template, path);
    let path = path.to_path_buf();
    let spawned = std::thread::Builder::new()
        .name("post-save".into())
        .spawn(move || {
            debug!("Running post-save command: {}", command);
            match Command::new("sh")
                .arg("-c")
                .arg(&command)
                .env(FILE_ENV, &path)
                .status()
            {
                Ok(status) if status.success() => debug!("Post-save command finished"),
                Ok(status) => warn!("Post-save command exited with {}", status),
                Err(e) => warn!("Failed to run post-save command: {}", e),
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start post-save command: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(kind: StreamKind, units: &[(i64, bool)]) -> Snapshot {
        Snapshot {
            kind,
            units: units
                .iter()
                .map(|&(pts, key)| EncodedUnit::new(vec![0], pts, pts, key))
                .collect(),
            last_seq: Some(units.len() as u64),
        }
    }

    #[test]
    fn test_trim_to_keyframe() {
        let mut snap = snapshot(StreamKind::Video, &[(0, false), (1, false), (2, true), (3, false)]);
        assert_eq!(trim_to_keyframe(&mut snap), 2);
        assert_eq!(snap.units[0].pts, 2);

        let mut none = snapshot(StreamKind::Video, &[(0, false), (1, false)]);
        assert_eq!(trim_to_keyframe(&mut none), 0);
        assert_eq!(none.len(), 2);
    }

    #[test]
    fn test_rebase_across_time_bases() {
        // Video at 1/30 starting at 1s, audio at 1/48000 starting at 0.5s
        let mut snaps = vec![
            snapshot(StreamKind::Video, &[(30, true), (31, false), (33, false)]),
            snapshot(StreamKind::Audio, &[(24000, true), (25024, true)]),
        ];
        let tbs = [TimeBase::new(1, 30), TimeBase::new(1, 48000)];
        rebase(&mut snaps, &tbs);

        assert_eq!(snaps[1].units[0].pts, 0);
        assert_eq!(snaps[1].units[1].pts, 1024);
        // 0.5s later in video ticks
        let video: Vec<i64> = snaps[0].units.iter().map(|u| u.pts).collect();
        assert_eq!(video, vec![15, 16, 18]);
    }

    #[test]
    fn test_interleave_orders_by_time() {
        let snaps = vec![
            snapshot(StreamKind::Video, &[(0, true), (1, false)]),
            snapshot(StreamKind::Audio, &[(0, true), (1000, true), (2000, true)]),
        ];
        let tbs = [TimeBase::new(1, 30), TimeBase::new(1, 48000)];
        let units = interleave(snaps, &tbs);
        let order: Vec<(usize, i64)> = units.iter().map(|u| (u.stream_index, u.pts)).collect();
        // 1/30s = 33333us, 1000/48000s = 20833us, 2000/48000s = 41667us
        assert_eq!(order, vec![(0, 0), (1, 0), (1, 1000), (0, 1), (1, 2000)]);
    }

    #[test]
    fn test_post_save_command_quotes_path() {
        let cmd = post_save_command("notify-send saved {file}", Path::new("/tmp/it's.mp4"));
        assert_eq!(cmd, r"notify-send saved '/tmp/it'\''s.mp4'");
    }
}
