//! Periodic state digest exchange.
//!
//! Every `interval` frames of a stable phase, each peer digests its shared generator state
//! together with the current [`IndexedFrame`], queues the digest locally and sends it to
//! the other peer. Whenever both queues have entries their heads are compared: equal heads
//! are dropped, a differing digest on the same frame is a desync.
//!
//! The two peers checkpoint the same frames as long as they agree on phase boundaries.
//! With rollback enabled a peer skips checkpoints it was still predicting, so heads on
//! different frames drop the older head. Without rollback every checkpoint is taken on
//! both sides and heads on different frames are a desync too.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::frame_info::IndexedFrame;
use crate::hash::state_digest;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{DesyncDetection, NetplayState};

/// Unmatched digests kept per queue before the oldest are dropped.
pub const MAX_PENDING_HASHES: usize = 64;

/// Digest of the shared state at one checkpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncHash {
    /// Checkpoint frame.
    pub indexed_frame: IndexedFrame,
    /// FNV-1a digest, see [`state_digest`].
    pub digest: u64,
}

impl SyncHash {
    /// Creates a checkpoint digest.
    #[must_use]
    pub const fn new(indexed_frame: IndexedFrame, digest: u64) -> Self {
        Self {
            indexed_frame,
            digest,
        }
    }

    /// Digests `rng_state` at `at`.
    #[must_use]
    pub fn compute(at: IndexedFrame, rng_state: &[u8]) -> Self {
        Self::new(at, state_digest(at, rng_state))
    }
}

/// Local and remote digest queues.
#[derive(Debug, Clone)]
pub struct DesyncDetector {
    detection: DesyncDetection,
    local: VecDeque<SyncHash>,
    remote: VecDeque<SyncHash>,
    matched: u64,
    prediction: bool,
}

impl DesyncDetector {
    /// Creates a detector.
    #[must_use]
    pub fn new(detection: DesyncDetection) -> Self {
        Self {
            detection,
            local: VecDeque::new(),
            remote: VecDeque::new(),
            matched: 0,
            prediction: false,
        }
    }

    /// Detection setting.
    #[must_use]
    pub fn detection(&self) -> DesyncDetection {
        self.detection
    }

    /// Tells the detector whether the session rolls back mispredicted frames, which lets
    /// either side skip a checkpoint.
    pub fn set_prediction(&mut self, prediction: bool) {
        self.prediction = prediction;
    }

    /// `true` if a checkpoint is due at `at`.
    ///
    /// Checkpoints fall on multiples of the interval, from character select on, outside
    /// loading, skippable sections and the retry menu, and only with a connected peer.
    #[must_use]
    pub fn should_check(&self, at: IndexedFrame, state: NetplayState, connected: bool) -> bool {
        let DesyncDetection::On { interval } = self.detection else {
            return false;
        };
        interval > 0
            && connected
            && at.frame % interval == 0
            && state >= NetplayState::CharaSelect
            && !matches!(
                state,
                NetplayState::Loading | NetplayState::Skippable | NetplayState::RetryMenu
            )
    }

    /// Queues a local digest. Returns the mismatching pair if this reveals a desync.
    pub fn push_local(&mut self, hash: SyncHash) -> Option<(SyncHash, SyncHash)> {
        Self::push_bounded(&mut self.local, hash, "local");
        self.compare()
    }

    /// Queues a remote digest. Returns the mismatching pair if this reveals a desync.
    pub fn push_remote(&mut self, hash: SyncHash) -> Option<(SyncHash, SyncHash)> {
        Self::push_bounded(&mut self.remote, hash, "remote");
        self.compare()
    }

    fn push_bounded(queue: &mut VecDeque<SyncHash>, hash: SyncHash, side: &str) {
        if queue.back().is_some_and(|last| last.indexed_frame >= hash.indexed_frame) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::DesyncCheck,
                "{} digest for {} is not newer than the last one",
                side,
                hash.indexed_frame
            );
            return;
        }
        queue.push_back(hash);
        if queue.len() > MAX_PENDING_HASHES {
            if let Some(dropped) = queue.pop_front() {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::DesyncCheck,
                    "{} digest queue full, dropped {}",
                    side,
                    dropped.indexed_frame
                );
            }
        }
    }

    fn compare(&mut self) -> Option<(SyncHash, SyncHash)> {
        while let (Some(&local), Some(&remote)) = (self.local.front(), self.remote.front()) {
            if local == remote {
                self.local.pop_front();
                self.remote.pop_front();
                self.matched += 1;
                continue;
            }
            if local.indexed_frame == remote.indexed_frame || !self.prediction {
                tracing::warn!(
                    local_frame = %local.indexed_frame,
                    remote_frame = %remote.indexed_frame,
                    local = local.digest,
                    remote = remote.digest,
                    "state digests differ"
                );
                return Some((local, remote));
            }
            let (queue, side, dropped) = if local.indexed_frame < remote.indexed_frame {
                (&mut self.local, "local", local)
            } else {
                (&mut self.remote, "remote", remote)
            };
            queue.pop_front();
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::DesyncCheck,
                "{} digest for {} has no counterpart",
                side,
                dropped.indexed_frame
            );
        }
        None
    }

    /// Checkpoints confirmed equal so far.
    #[must_use]
    pub fn matched(&self) -> u64 {
        self.matched
    }

    /// Unmatched local and remote digests.
    #[must_use]
    pub fn pending(&self) -> (usize, usize) {
        (self.local.len(), self.remote.len())
    }
}

impl InvariantChecker for DesyncDetector {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for (name, queue) in [("local", &self.local), ("remote", &self.remote)] {
            if queue.len() > MAX_PENDING_HASHES {
                return Err(InvariantViolation::new(
                    "DesyncDetector",
                    "digest queue exceeds bound",
                )
                .with_details(format!("{name}={}", queue.len())));
            }
            let sorted = queue
                .iter()
                .zip(queue.iter().skip(1))
                .all(|(a, b)| a.indexed_frame < b.indexed_frame);
            if !sorted {
                return Err(InvariantViolation::new(
                    "DesyncDetector",
                    "digest queue out of order",
                )
                .with_details(name));
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

    fn hash(frame: u32, index: u32, digest: u64) -> SyncHash {
        SyncHash::new(IndexedFrame::new(frame, index), digest)
    }

    // ==========================================
    // Scheduling
    // ==========================================

    #[test]
    fn checkpoints_only_in_stable_phases() {
        let detector = DesyncDetector::new(DesyncDetection::On { interval: 60 });
        let at = IndexedFrame::new(120, 5);
        assert!(detector.should_check(at, NetplayState::InGame, true));
        assert!(detector.should_check(at, NetplayState::CharaSelect, true));
        assert!(!detector.should_check(at, NetplayState::Loading, true));
        assert!(!detector.should_check(at, NetplayState::Skippable, true));
        assert!(!detector.should_check(at, NetplayState::RetryMenu, true));
        assert!(!detector.should_check(at, NetplayState::Initial, true));
        assert!(!detector.should_check(at, NetplayState::InGame, false));
        assert!(!detector.should_check(IndexedFrame::new(121, 5), NetplayState::InGame, true));
    }

    #[test]
    fn off_never_checks() {
        let detector = DesyncDetector::new(DesyncDetection::Off);
        assert!(!detector.should_check(IndexedFrame::new(0, 3), NetplayState::InGame, true));
    }

    // ==========================================
    // Comparison
    // ==========================================

    #[test]
    fn equal_heads_are_popped() {
        let mut detector = DesyncDetector::new(DesyncDetection::default());
        assert!(detector.push_local(hash(0, 3, 11)).is_none());
        assert!(detector.push_local(hash(300, 3, 12)).is_none());
        assert!(detector.push_remote(hash(0, 3, 11)).is_none());
        assert_eq!(detector.pending(), (1, 0));
        assert!(detector.push_remote(hash(300, 3, 12)).is_none());
        assert_eq!(detector.pending(), (0, 0));
        assert_eq!(detector.matched(), 2);
    }

    #[test]
    fn differing_digest_is_a_desync() {
        let mut detector = DesyncDetector::new(DesyncDetection::default());
        detector.push_remote(hash(60, 4, 1));
        let (local, remote) = detector.push_local(hash(60, 4, 2)).unwrap();
        assert_eq!(local.digest, 2);
        assert_eq!(remote.digest, 1);
    }

    #[test]
    fn unmatched_older_head_is_dropped_with_rollback() {
        let mut detector = DesyncDetector::new(DesyncDetection::default());
        detector.set_prediction(true);
        detector.push_local(hash(60, 4, 1));
        detector.push_local(hash(120, 4, 2));
        assert!(detector.push_remote(hash(120, 4, 2)).is_none());
        assert_eq!(detector.pending(), (0, 0));
    }

    #[test]
    fn frame_mismatch_without_rollback_is_a_desync() {
        let mut detector = DesyncDetector::new(DesyncDetection::default());
        assert!(detector.push_local(hash(300, 4, 1)).is_none());
        let (local, remote) = detector.push_remote(hash(600, 4, 2)).unwrap();
        assert_eq!(local.indexed_frame, IndexedFrame::new(300, 4));
        assert_eq!(remote.indexed_frame, IndexedFrame::new(600, 4));
    }

    #[test]
    fn frame_mismatch_with_rollback_waits_for_the_counterpart() {
        let mut detector = DesyncDetector::new(DesyncDetection::default());
        detector.set_prediction(true);
        assert!(detector.push_local(hash(300, 4, 1)).is_none());
        assert!(detector.push_remote(hash(600, 4, 2)).is_none());
        assert_eq!(detector.pending(), (0, 1));
        assert!(detector.push_local(hash(600, 4, 2)).is_none());
        assert_eq!(detector.pending(), (0, 0));
        assert_eq!(detector.matched(), 1);
    }

    #[test]
    fn stale_digests_are_ignored() {
        let mut detector = DesyncDetector::new(DesyncDetection::default());
        detector.push_local(hash(120, 4, 2));
        detector.push_local(hash(60, 4, 1));
        assert_eq!(detector.pending(), (1, 0));
        assert!(detector.check_invariants().is_ok());
    }

    #[test]
    fn queues_are_bounded() {
        let mut detector = DesyncDetector::new(DesyncDetection::default());
        for frame in 0..(MAX_PENDING_HASHES as u32 + 10) {
            detector.push_local(hash(frame, 1, 0));
        }
        assert_eq!(detector.pending().0, MAX_PENDING_HASHES);
        assert!(detector.check_invariants().is_ok());
    }

    #[test]
    fn compute_uses_state_digest() {
        let at = IndexedFrame::new(300, 6);
        assert_eq!(SyncHash::compute(at, &[1, 2]).digest, state_digest(at, &[1, 2]));
    }
}
