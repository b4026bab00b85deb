//! Rollback snapshot storage.

use crate::frame_info::IndexedFrame;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};

/// Ring of host snapshots for the last `rollback + 2` frames of one match instance.
///
/// Slots are addressed by `frame % capacity` and remember which frame they hold, so a
/// stale slot is never mistaken for the frame asked for.
#[derive(Debug)]
pub struct SnapshotRing<S> {
    slots: Vec<Option<(IndexedFrame, S)>>,
}

impl<S> SnapshotRing<S> {
    /// Creates an empty ring able to roll back `rollback` frames.
    #[must_use]
    pub fn new(rollback: usize) -> Self {
        let capacity = rollback + 2;
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, at: IndexedFrame) -> usize {
        at.frame as usize % self.slots.len()
    }

    /// Stores the snapshot taken at the start of `at`, replacing whatever used the slot.
    pub fn save(&mut self, at: IndexedFrame, snapshot: S) {
        let slot = self.slot(at);
        self.slots[slot] = Some((at, snapshot));
    }

    /// Snapshot taken at the start of `at`, if still held.
    #[must_use]
    pub fn get(&self, at: IndexedFrame) -> Option<&S> {
        match &self.slots[self.slot(at)] {
            Some((saved, snapshot)) if *saved == at => Some(snapshot),
            Some((saved, _)) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InputSync,
                    "snapshot for {} was overwritten by {}",
                    at,
                    saved
                );
                None
            },
            None => None,
        }
    }

    /// Drops every snapshot.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    /// Snapshots currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// `true` if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

impl<S> InvariantChecker for SnapshotRing<S> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let len = self.slots.len();
        if len < 2 {
            return Err(InvariantViolation::new("SnapshotRing", "fewer than two slots"));
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some((at, _)) = slot {
                if at.frame as usize % len != i {
                    return Err(InvariantViolation::new(
                        "SnapshotRing",
                        "snapshot stored in the wrong slot",
                    )
                    .with_details(format!("frame={at} slot={i}")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn holds_rollback_window() {
        let mut ring = SnapshotRing::new(3);
        assert_eq!(ring.capacity(), 5);
        for f in 0..10 {
            ring.save(IndexedFrame::new(f, 2), f);
        }
        for f in 5..10 {
            assert_eq!(ring.get(IndexedFrame::new(f, 2)), Some(&f));
        }
        assert_eq!(ring.get(IndexedFrame::new(4, 2)), None);
        assert!(ring.check_invariants().is_ok());
    }

    #[test]
    fn other_index_is_not_returned() {
        let mut ring = SnapshotRing::new(0);
        ring.save(IndexedFrame::new(1, 3), "a");
        assert_eq!(ring.get(IndexedFrame::new(1, 4)), None);
    }

    #[test]
    fn clear_empties() {
        let mut ring = SnapshotRing::new(1);
        ring.save(IndexedFrame::new(0, 1), ());
        assert_eq!(ring.len(), 1);
        ring.clear();
        assert!(ring.is_empty());
    }
}
