//! One-shot session timers.
//!
//! Timers are plain deadlines checked on every poll. An expired timer is removed and
//! reported once, through [`SessionEvent::TimerExpired`](crate::SessionEvent::TimerExpired).

use std::collections::BTreeMap;

use smallvec::SmallVec;
use web_time::{Duration, Instant};

/// What a timer is for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind<A> {
    /// Remote input has not arrived for a while; send local input again.
    Resend,
    /// The data channel was not established in time.
    InitialConnect,
    /// Grace period before a requested stop takes effect.
    DelayedStop,
    /// A pending spectator did not finish its handshake in time.
    Pending(A),
}

/// Active deadlines, at most one per kind.
#[derive(Debug, Clone)]
pub struct Timers<A: Ord> {
    deadlines: BTreeMap<TimerKind<A>, Instant>,
}

impl<A: Clone + Ord> Default for Timers<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Clone + Ord> Timers<A> {
    /// Creates an empty timer set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            deadlines: BTreeMap::new(),
        }
    }

    /// Starts (or restarts) `kind` to expire `after` from now.
    pub fn start(&mut self, kind: TimerKind<A>, after: Duration) {
        self.start_at(kind, Instant::now() + after);
    }

    /// Starts (or restarts) `kind` to expire at `deadline`.
    pub fn start_at(&mut self, kind: TimerKind<A>, deadline: Instant) {
        self.deadlines.insert(kind, deadline);
    }

    /// Starts `kind` unless it is already running.
    pub fn ensure(&mut self, kind: TimerKind<A>, after: Duration) {
        self.deadlines
            .entry(kind)
            .or_insert_with(|| Instant::now() + after);
    }

    /// Stops `kind`. Returns `true` if it was running.
    pub fn cancel(&mut self, kind: &TimerKind<A>) -> bool {
        self.deadlines.remove(kind).is_some()
    }

    /// `true` while `kind` is running.
    #[must_use]
    pub fn is_active(&self, kind: &TimerKind<A>) -> bool {
        self.deadlines.contains_key(kind)
    }

    /// Removes and returns every timer whose deadline is at or before `now`.
    pub fn expired(&mut self, now: Instant) -> SmallVec<[TimerKind<A>; 4]> {
        let due: SmallVec<[TimerKind<A>; 4]> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(kind, _)| kind.clone())
            .collect();
        for kind in &due {
            self.deadlines.remove(kind);
        }
        due
    }

    /// Stops every timer.
    pub fn clear(&mut self) {
        self.deadlines.clear();
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
    fn zero_duration_expires_immediately() {
        let mut timers = Timers::<u32>::new();
        timers.start(TimerKind::Resend, Duration::ZERO);
        let due = timers.expired(Instant::now());
        assert_eq!(due.as_slice(), &[TimerKind::Resend]);
        assert!(!timers.is_active(&TimerKind::Resend));
    }

    #[test]
    fn future_deadline_waits() {
        let mut timers = Timers::<u32>::new();
        let now = Instant::now();
        timers.start_at(TimerKind::DelayedStop, now + Duration::from_secs(1));
        assert!(timers.expired(now).is_empty());
        assert!(timers.is_active(&TimerKind::DelayedStop));
        assert_eq!(timers.expired(now + Duration::from_secs(2)).len(), 1);
    }

    #[test]
    fn ensure_keeps_running_deadline() {
        let mut timers = Timers::<u32>::new();
        let now = Instant::now();
        timers.start_at(TimerKind::Resend, now + Duration::from_secs(1));
        timers.ensure(TimerKind::Resend, Duration::from_secs(60));
        assert_eq!(timers.expired(now + Duration::from_secs(2)).len(), 1);
    }

    #[test]
    fn pending_timers_are_per_connection() {
        let mut timers = Timers::<u32>::new();
        timers.start(TimerKind::Pending(1), Duration::ZERO);
        timers.start(TimerKind::Pending(2), Duration::from_secs(60));
        assert!(timers.cancel(&TimerKind::Pending(2)));
        assert!(!timers.cancel(&TimerKind::Pending(2)));
        let due = timers.expired(Instant::now());
        assert_eq!(due.as_slice(), &[TimerKind::Pending(1)]);
    }
}
