//! Bounded in-memory history of encoded units
//!
//! A [`RetentionBuffer`] keeps the most recent window of one stream. It is a
//! fixed ring of `capacity` slots where one slot is always kept free as the
//! write slot, so at most `capacity - 1` units are ever readable.
//!
//! Units older than the retention window (by pts) are evicted as new units are
//! committed, and the slot count acts as a ceiling on top of that.
//!
//! One capture thread writes with [`push`](RetentionBuffer::push) (or the
//! two-step [`append`](RetentionBuffer::append) +
//! [`rotate`](RetentionBuffer::rotate)); any other thread may take a
//! [`snapshot`](RetentionBuffer::snapshot). Everything goes through a single
//! mutex per buffer.

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::types::{EncodedUnit, StreamKind, StreamParams, TimeBase};

/// Slot capacity for a stream: one slot per unit in the window plus the write slot
pub fn capacity_for(rate: u32, retention_secs: u32) -> usize {
    (rate as usize * retention_secs as usize).max(1) + 1
}

#[derive(Debug)]
struct Slot {
    unit: EncodedUnit,
    seq: u64,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<Slot>>,
    head: usize,
    tail: usize,
    next_seq: u64,
    bytes: usize,
    evicted: u64,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            tail: 0,
            next_seq: 0,
            bytes: 0,
            evicted: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        (self.tail + self.capacity() - self.head) % self.capacity()
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.capacity()
    }

    fn pop_head(&mut self) {
        if let Some(slot) = self.slots[self.head].take() {
            self.bytes -= slot.unit.len();
        }
        self.head = self.next(self.head);
    }

    fn evict_head(&mut self) {
        self.pop_head();
        self.evicted += 1;
    }

    fn newest(&self) -> Option<&Slot> {
        if self.head == self.tail {
            return None;
        }
        let index = (self.tail + self.capacity() - 1) % self.capacity();
        self.slots[index].as_ref()
    }

    fn oldest(&self) -> Option<&Slot> {
        if self.head == self.tail {
            return None;
        }
        self.slots[self.head].as_ref()
    }
}

/// Linearized copy of a buffer's committed units, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Kind of the stream the units came from
    pub kind: StreamKind,
    /// Units in commit order, index 0 is the oldest
    pub units: Vec<EncodedUnit>,
    /// Sequence number of the newest unit, if any
    pub last_seq: Option<u64>,
}

impl Snapshot {
    /// Number of units in the snapshot
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the snapshot holds no units
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Smallest pts in the snapshot
    pub fn min_pts(&self) -> Option<i64> {
        self.units.iter().map(|u| u.pts).min()
    }
}

/// Bounded per-stream history of encoded units
#[derive(Debug)]
pub struct RetentionBuffer {
    kind: StreamKind,
    time_base: TimeBase,
    /// Retention window in time-base ticks
    window: i64,
    ring: Mutex<Ring>,
}

impl RetentionBuffer {
    /// Create a buffer holding `retention_secs` of the stream described by `params`
    pub fn new(params: &StreamParams, retention_secs: u32) -> Self {
        Self::with_capacity(
            params.kind,
            capacity_for(params.rate, retention_secs),
            params.time_base,
            params.time_base.ticks_per_seconds(retention_secs),
        )
    }

    /// Create a buffer with an explicit slot capacity and window
    ///
    /// `capacity` includes the write slot and must be at least 2.
    pub fn with_capacity(kind: StreamKind, capacity: usize, time_base: TimeBase, window: i64) -> Self {
        Self {
            kind,
            time_base,
            window,
            ring: Mutex::new(Ring::new(capacity.max(2))),
        }
    }

    /// Kind of the stream held
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Time base of the held units
    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    /// Retention window in time-base ticks
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Total slot count, including the write slot
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    /// Number of committed units
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Whether no units are committed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes held by committed units
    pub fn bytes(&self) -> usize {
        self.ring.lock().bytes
    }

    /// Number of units evicted since creation
    pub fn evicted(&self) -> u64 {
        self.ring.lock().evicted
    }

    /// Stage `unit` in the write slot
    ///
    /// The unit is not visible to readers until [`rotate`](Self::rotate).
    /// Staging again before rotating replaces the staged unit.
    pub fn append(&self, unit: EncodedUnit) {
        let mut ring = self.ring.lock();
        Self::stage(&mut ring, unit);
    }

    /// Commit the staged unit and advance the write cursor
    ///
    /// When the ring is full the oldest unit is dropped to keep the write slot
    /// free; units that fell out of the retention window are dropped too.
    /// Returns false if nothing was staged.
    pub fn rotate(&self) -> bool {
        let mut ring = self.ring.lock();
        self.commit(&mut ring)
    }

    /// Append and commit a unit under one lock acquisition
    pub fn push(&self, unit: EncodedUnit) {
        let mut ring = self.ring.lock();
        Self::stage(&mut ring, unit);
        self.commit(&mut ring);
    }

    /// Copy every committed unit, oldest to newest
    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    /// Drop all held units and reset the cursors
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        for slot in ring.slots.iter_mut() {
            *slot = None;
        }
        ring.head = 0;
        ring.tail = 0;
        ring.bytes = 0;
    }

    /// Drop committed units with a sequence number up to and including `seq`
    ///
    /// Returns the number of units dropped. Units committed after `seq` are
    /// kept.
    pub fn discard_through(&self, seq: u64) -> usize {
        let mut ring = self.ring.lock();
        let mut dropped = 0;
        while ring.oldest().is_some_and(|slot| slot.seq <= seq) {
            ring.pop_head();
            dropped += 1;
        }
        dropped
    }

    /// Lock the buffer for a multi-step read
    pub fn lock(&self) -> RetentionGuard<'_> {
        RetentionGuard {
            kind: self.kind,
            ring: self.ring.lock(),
        }
    }

    fn stage(ring: &mut Ring, unit: EncodedUnit) {
        let tail = ring.tail;
        if let Some(previous) = ring.slots[tail].replace(Slot { unit, seq: 0 }) {
            trace!("Replacing staged unit pts={}", previous.unit.pts);
        }
    }

    fn commit(&self, ring: &mut Ring) -> bool {
        let tail = ring.tail;
        let seq = ring.next_seq;
        let Some(slot) = ring.slots[tail].as_mut() else {
            return false;
        };
        slot.seq = seq;
        let size = slot.unit.len();
        ring.next_seq += 1;
        ring.bytes += size;
        ring.tail = ring.next(tail);

        if ring.tail == ring.head {
            ring.evict_head();
        }

        if let Some(newest) = ring.newest().map(|s| s.unit.pts) {
            while ring.len() > 1
                && ring
                    .oldest()
                    .is_some_and(|slot| newest - slot.unit.pts > self.window)
            {
                ring.evict_head();
            }
        }

        true
    }
}

/// Locked view of a [`RetentionBuffer`]
///
/// The capture thread is blocked for as long as the guard is held.
pub struct RetentionGuard<'a> {
    kind: StreamKind,
    ring: MutexGuard<'a, Ring>,
}

impl RetentionGuard<'_> {
    /// Copy every committed unit, oldest to newest
    pub fn snapshot(&self) -> Snapshot {
        let ring = &self.ring;
        let mut units = Vec::with_capacity(ring.len());
        let mut last_seq = None;
        let mut index = ring.head;
        while index != ring.tail {
            if let Some(slot) = &ring.slots[index] {
                units.push(slot.unit.clone());
                last_seq = Some(slot.seq);
            }
            index = ring.next(index);
        }
        Snapshot {
            kind: self.kind,
            units,
            last_seq,
        }
    }

    /// Number of committed units
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether no units are committed
    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(pts: i64) -> EncodedUnit {
        EncodedUnit::new(vec![pts as u8; 4], pts, pts, pts % 30 == 0)
    }

    fn buffer(capacity: usize) -> RetentionBuffer {
        RetentionBuffer::with_capacity(
            StreamKind::Video,
            capacity,
            TimeBase::new(1, 30),
            i64::MAX,
        )
    }

    #[test]
    fn test_capacity_for() {
        assert_eq!(capacity_for(30, 3), 91);
        assert_eq!(capacity_for(60, 30), 1801);
    }

    #[test]
    fn test_staged_unit_is_invisible() {
        let buf = buffer(4);
        buf.append(unit(0));
        assert!(buf.snapshot().is_empty());
        assert!(buf.rotate());
        assert_eq!(buf.snapshot().len(), 1);
        assert!(!buf.rotate());
    }

    #[test]
    fn test_wraparound_keeps_capacity_minus_one() {
        let buf = buffer(4);
        for pts in 0..10 {
            buf.push(unit(pts));
        }
        let snap = buf.snapshot();
        let pts: Vec<i64> = snap.units.iter().map(|u| u.pts).collect();
        assert_eq!(pts, vec![7, 8, 9]);
        assert_eq!(buf.evicted(), 7);
        assert_eq!(buf.bytes(), 12);
    }

    #[test]
    fn test_time_window_eviction() {
        let buf = RetentionBuffer::with_capacity(StreamKind::Audio, 100, TimeBase::new(1, 10), 5);
        for pts in 0..20 {
            buf.push(unit(pts));
        }
        let snap = buf.snapshot();
        assert_eq!(snap.units.first().map(|u| u.pts), Some(14));
        assert_eq!(snap.units.last().map(|u| u.pts), Some(19));
    }

    #[test]
    fn test_discard_through_keeps_newer_units() {
        let buf = buffer(8);
        for pts in 0..5 {
            buf.push(unit(pts));
        }
        let snap = buf.snapshot();
        buf.push(unit(5));
        let dropped = buf.discard_through(snap.last_seq.unwrap());
        assert_eq!(dropped, 5);
        let remaining: Vec<i64> = buf.snapshot().units.iter().map(|u| u.pts).collect();
        assert_eq!(remaining, vec![5]);
    }

    #[test]
    fn test_clear_resets() {
        let buf = buffer(4);
        for pts in 0..6 {
            buf.push(unit(pts));
        }
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.bytes(), 0);
        buf.push(unit(42));
        assert_eq!(buf.snapshot().units[0].pts, 42);
    }
}
