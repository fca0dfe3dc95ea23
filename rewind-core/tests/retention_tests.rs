//! Integration tests for retention buffers

mod mocks;

use mocks::video_unit;
use rewind_core::retention::{capacity_for, RetentionBuffer};
use rewind_core::types::{EncodedUnit, StreamKind, StreamParams, TimeBase};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn unbounded_window(capacity: usize) -> RetentionBuffer {
    RetentionBuffer::with_capacity(StreamKind::Video, capacity, TimeBase::new(1, 30), i64::MAX)
}

#[test]
fn test_keeps_newest_capacity_minus_one() {
    let buffer = unbounded_window(91);
    for pts in 0..200 {
        buffer.push(video_unit(pts, pts % 30 == 0));
    }

    let snap = buffer.snapshot();
    assert_eq!(snap.len(), 90);
    let pts: Vec<i64> = snap.units.iter().map(|u| u.pts).collect();
    assert_eq!(pts, (110..200).collect::<Vec<_>>());
    assert_eq!(buffer.evicted(), 110);
}

#[test]
fn test_snapshot_is_decode_ordered_across_wraparound() {
    let buffer = unbounded_window(8);
    // B-frame style reordering: dts increases, pts does not
    let pts_pattern = [0, 3, 1, 2];
    for dts in 0..22 {
        let pts = (dts / 4) * 4 + pts_pattern[(dts % 4) as usize];
        buffer.push(EncodedUnit::new(vec![0u8; 4], pts, dts, dts % 4 == 0));
    }

    let snap = buffer.snapshot();
    assert_eq!(snap.len(), 7);
    let dts: Vec<i64> = snap.units.iter().map(|u| u.dts).collect();
    assert_eq!(dts, (15..22).collect::<Vec<_>>());
    let pts: Vec<i64> = snap.units.iter().map(|u| u.pts).collect();
    assert_eq!(pts, vec![14, 16, 19, 17, 18, 20, 23]);
}

#[test]
fn test_capacity_from_stream_params() {
    let params = StreamParams::video("h264", 1920, 1080, 60);
    let buffer = RetentionBuffer::new(&params, 30);
    assert_eq!(buffer.capacity(), capacity_for(60, 30));
    assert_eq!(buffer.capacity(), 1801);
    assert!(buffer.is_empty());
}

#[test]
fn test_window_evicts_by_timestamp() {
    let params = StreamParams::video("h264", 640, 480, 30);
    let buffer = RetentionBuffer::new(&params, 2);

    // Jump ahead: everything more than two seconds older than the newest unit goes
    for pts in 0..10 {
        buffer.push(video_unit(pts, pts == 0));
    }
    buffer.push(video_unit(100, true));

    let snap = buffer.snapshot();
    assert_eq!(snap.len(), 1);
    assert_eq!(snap.units[0].pts, 100);
}

#[test]
fn test_concurrent_snapshots_are_consistent() {
    let buffer = Arc::new(unbounded_window(64));
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let buffer = Arc::clone(&buffer);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for pts in 0..20_000 {
                buffer.push(video_unit(pts, false));
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut snapshots = 0;
    while !done.load(Ordering::SeqCst) {
        let snap = buffer.snapshot();
        assert!(snap.len() <= 63);
        for pair in snap.units.windows(2) {
            assert_eq!(pair[1].pts, pair[0].pts + 1, "snapshot saw a torn ring");
        }
        if let (Some(first), Some(seq)) = (snap.units.first(), snap.last_seq) {
            // Sequence numbers track pts one to one in this test
            assert_eq!(seq as i64, first.pts + snap.len() as i64 - 1);
        }
        snapshots += 1;
    }
    writer.join().expect("writer thread panicked");

    assert!(snapshots > 0);
    assert_eq!(buffer.snapshot().units.last().map(|u| u.pts), Some(19_999));
}

#[test]
fn test_discard_through_keeps_units_committed_after_snapshot() {
    let buffer = unbounded_window(32);
    for pts in 0..10 {
        buffer.push(video_unit(pts, pts == 0));
    }
    let snap = buffer.snapshot();
    let last_seq = snap.last_seq.expect("snapshot has units");

    buffer.push(video_unit(10, false));
    buffer.push(video_unit(11, false));

    assert_eq!(buffer.discard_through(last_seq), 10);
    let pts: Vec<i64> = buffer.snapshot().units.iter().map(|u| u.pts).collect();
    assert_eq!(pts, vec![10, 11]);
}

#[test]
fn test_staged_unit_replaced_before_rotate() {
    let buffer = unbounded_window(4);
    buffer.append(video_unit(1, true));
    buffer.append(video_unit(2, true));
    assert!(buffer.is_empty());

    assert!(buffer.rotate());
    assert!(!buffer.rotate());
    let pts: Vec<i64> = buffer.snapshot().units.iter().map(|u| u.pts).collect();
    assert_eq!(pts, vec![2]);
}

#[test]
fn test_byte_accounting() {
    let buffer = unbounded_window(3);
    buffer.push(video_unit(0, true));
    buffer.push(video_unit(1, false));
    assert_eq!(buffer.bytes(), 64);

    // Third push evicts the oldest to keep the write slot free
    buffer.push(video_unit(2, false));
    assert_eq!(buffer.len(), 2);
    assert_eq!(buffer.bytes(), 64);

    buffer.clear();
    assert_eq!(buffer.bytes(), 0);
    assert!(buffer.snapshot().is_empty());
}
