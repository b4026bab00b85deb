//! Match-over detection at the end of a round.
//!
//! Evaluated when a round-end skippable section begins, before the host credits the round
//! to the winner. A player on game point who wins the round ends the match. A draw with
//! both players on game point only ends the match if the previous round was such a draw
//! too.

use crate::{HostAdapter, HostFlag};

/// Host variables describing how a round ended.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct RoundResult {
    /// Player one health.
    pub p1_health: u32,
    /// Player two health.
    pub p2_health: u32,
    /// Remaining round time.
    pub round_timer: u32,
    /// Rounds won by player one before this one.
    pub p1_wins: u32,
    /// Rounds won by player two before this one.
    pub p2_wins: u32,
    /// Rounds needed to win.
    pub win_count: u32,
}

impl RoundResult {
    /// Reads the round result from the host.
    pub fn read<S>(host: &dyn HostAdapter<S>) -> Self {
        Self {
            p1_health: host.flag(HostFlag::P1Health),
            p2_health: host.flag(HostFlag::P2Health),
            round_timer: host.flag(HostFlag::RoundTimer),
            p1_wins: host.flag(HostFlag::P1Wins),
            p2_wins: host.flag(HostFlag::P2Wins),
            win_count: host.flag(HostFlag::WinCount),
        }
    }

    /// A player ran out of health.
    #[must_use]
    pub fn is_knock_out(&self) -> bool {
        self.p1_health == 0 || self.p2_health == 0
    }

    /// The round timer ran out.
    #[must_use]
    pub fn is_time_out(&self) -> bool {
        self.round_timer == 0
    }

    /// Both players ended with the same health.
    #[must_use]
    pub fn is_draw(&self) -> bool {
        self.p1_health == self.p2_health
    }

    /// Player one wins the match by winning this round.
    #[must_use]
    pub fn is_p1_game_point(&self) -> bool {
        self.p1_wins.saturating_add(1) == self.win_count
    }

    /// Player two wins the match by winning this round.
    #[must_use]
    pub fn is_p2_game_point(&self) -> bool {
        self.p2_wins.saturating_add(1) == self.win_count
    }
}

/// Tracks whether the match is over across rounds.
///
/// ```
/// use fortress_netplay::game_over::{GameOverTracker, RoundResult};
///
/// let double_game_point_draw = RoundResult {
///     p1_health: 0, p2_health: 0, round_timer: 40,
///     p1_wins: 1, p2_wins: 1, win_count: 2,
/// };
/// let mut tracker = GameOverTracker::new();
/// assert!(!tracker.update(double_game_point_draw));
/// assert!(tracker.update(double_game_point_draw));
/// ```
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GameOverTracker {
    is_game_over: bool,
    was_last_double_game_point_draw: bool,
}

impl GameOverTracker {
    /// Creates a tracker for a fresh match.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates a round end and returns whether the match is over.
    pub fn update(&mut self, round: RoundResult) -> bool {
        if !round.is_knock_out() && !round.is_time_out() {
            self.is_game_over = false;
        } else {
            let p1 = round.is_p1_game_point();
            let p2 = round.is_p2_game_point();
            let draw = round.is_draw();

            self.is_game_over = ((p1 || p2) && !draw)
                || (p1 && p2 && draw && self.was_last_double_game_point_draw);
            self.was_last_double_game_point_draw = p1 && p2 && draw;
        }
        tracing::debug!(is_game_over = self.is_game_over, ?round, "round ended");
        self.is_game_over
    }

    /// Result of the last evaluation.
    #[must_use]
    pub fn is_game_over(&self) -> bool {
        self.is_game_over
    }

    /// Forgets the previous rounds, for a new match.
    pub fn reset(&mut self) {
        *self = Self::default();
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

    fn round(p1_health: u32, p2_health: u32, p1_wins: u32, p2_wins: u32) -> RoundResult {
        RoundResult {
            p1_health,
            p2_health,
            round_timer: 50,
            p1_wins,
            p2_wins,
            win_count: 2,
        }
    }

    #[test]
    fn round_in_progress_is_not_over() {
        let mut tracker = GameOverTracker::new();
        assert!(!tracker.update(round(100, 80, 1, 1)));
    }

    #[test]
    fn knock_out_on_game_point_ends_match() {
        let mut tracker = GameOverTracker::new();
        assert!(tracker.update(round(0, 80, 0, 1)));
        assert!(tracker.is_game_over());
    }

    #[test]
    fn knock_out_without_game_point_continues() {
        let mut tracker = GameOverTracker::new();
        assert!(!tracker.update(round(0, 80, 0, 0)));
    }

    #[test]
    fn time_out_counts_as_round_end() {
        let mut tracker = GameOverTracker::new();
        let result = RoundResult {
            round_timer: 0,
            ..round(40, 90, 1, 0)
        };
        assert!(tracker.update(result));
    }

    #[test]
    fn single_game_point_draw_continues() {
        let mut tracker = GameOverTracker::new();
        assert!(!tracker.update(round(0, 0, 1, 0)));
    }

    #[test]
    fn double_game_point_draw_needs_two_in_a_row() {
        let mut tracker = GameOverTracker::new();
        assert!(!tracker.update(round(0, 0, 1, 1)));
        assert!(tracker.update(round(0, 0, 1, 1)));
    }

    #[test]
    fn unfinished_round_keeps_draw_memory() {
        let mut tracker = GameOverTracker::new();
        assert!(!tracker.update(round(0, 0, 1, 1)));
        assert!(!tracker.update(round(10, 20, 1, 1)));
        assert!(tracker.update(round(0, 0, 1, 1)));
    }

    #[test]
    fn decisive_round_clears_draw_memory() {
        let mut tracker = GameOverTracker::new();
        tracker.update(round(0, 0, 1, 1));
        tracker.update(round(0, 5, 0, 0));
        assert!(!tracker.update(round(0, 0, 1, 1)));
    }

    #[test]
    fn reset_starts_fresh() {
        let mut tracker = GameOverTracker::new();
        tracker.update(round(0, 0, 1, 1));
        tracker.reset();
        assert!(!tracker.update(round(0, 0, 1, 1)));
    }
}
