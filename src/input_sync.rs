//! Per-player input histories, input delay and remote readiness.
//!
//! Inputs are stored per match instance (`IndexedFrame::index`) as a dense vector per
//! player: the vector length is the number of frames whose input is known. Local input
//! sampled at frame `f` is stored at `f + delay`, so the remote side has `delay` ticks of
//! headroom before it needs it. Remote input arrives as contiguous runs and is confirmed
//! on arrival. Confirmed input never changes.
//!
//! With rollback enabled and the match in progress, a missing remote input may be
//! predicted by repeating the last known remote input. Predictions are remembered so that
//! the earliest wrong one can be reported through [`InputSynchronizer::take_changed`].

use std::collections::{BTreeMap, BTreeSet};

use smallvec::SmallVec;

use crate::frame_info::{IndexedFrame, InputBits};
use crate::network::messages::NetplayMessage;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{NetplayState, PlayerNumber};

/// Deepest rollback a session may be configured with.
pub const MAX_ROLLBACK: usize = 30;

/// Frames of input carried by one `PlayerInputs` message in the common case.
pub const NUM_INPUTS: usize = 30;

/// Up to two messages: the current index window plus the tail of the previous index.
pub type InputMessages = SmallVec<[NetplayMessage; 2]>;

/// Retry menu choices for one match instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MenuSelection {
    local: Option<u8>,
    remote: Option<u8>,
}

/// Inputs of the most recently finished game, kept for replay tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchivedGame {
    /// First match instance of the game.
    pub first_index: u32,
    /// Last match instance of the game.
    pub last_index: u32,
    /// Per-index inputs of player one and two.
    pub inputs: BTreeMap<u32, [Vec<InputBits>; 2]>,
}

/// Input buffering and readiness for one session.
#[derive(Debug, Clone)]
pub struct InputSynchronizer {
    delay: u32,
    rollback: u32,
    remote_player: PlayerNumber,
    spectate: bool,
    histories: BTreeMap<u32, [Vec<InputBits>; 2]>,
    /// Remote inputs handed to the host before they were known.
    predictions: BTreeMap<IndexedFrame, InputBits>,
    /// Earliest used prediction that turned out wrong.
    changed: Option<IndexedFrame>,
    menu: BTreeMap<u32, MenuSelection>,
    /// Match instances whose input was sent to the remote side.
    transmitted: BTreeSet<u32>,
    last_game: Option<ArchivedGame>,
}

impl Default for InputSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl InputSynchronizer {
    /// Creates an empty synchronizer with no delay, no rollback and player two remote.
    #[must_use]
    pub fn new() -> Self {
        Self {
            delay: 0,
            rollback: 0,
            remote_player: PlayerNumber::TWO,
            spectate: false,
            histories: BTreeMap::new(),
            predictions: BTreeMap::new(),
            changed: None,
            menu: BTreeMap::new(),
            transmitted: BTreeSet::new(),
            last_game: None,
        }
    }

    /// Sets the input delay in frames.
    pub fn set_delay(&mut self, delay: u8) {
        self.delay = u32::from(delay);
    }

    /// Sets the rollback depth, clamped to [`MAX_ROLLBACK`].
    pub fn set_rollback(&mut self, rollback: u8) {
        self.rollback = u32::from(rollback).min(MAX_ROLLBACK as u32);
    }

    /// Sets which player's input comes from the network.
    pub fn set_remote_player(&mut self, player: PlayerNumber) {
        self.remote_player = player;
    }

    /// Spectators receive both players' inputs and wait for both.
    pub fn set_spectate(&mut self, spectate: bool) {
        self.spectate = spectate;
    }

    /// Input delay in frames.
    #[must_use]
    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// Rollback depth in frames.
    #[must_use]
    pub fn rollback(&self) -> u32 {
        self.rollback
    }

    /// Player whose input comes from the network.
    #[must_use]
    pub fn remote_player(&self) -> PlayerNumber {
        self.remote_player
    }

    /// Number of frames of `player`'s input known for match instance `index`.
    #[must_use]
    pub fn known_frames(&self, player: PlayerNumber, index: u32) -> u32 {
        self.histories
            .get(&index)
            .map_or(0, |h| h[player.slot()].len() as u32)
    }

    /// Known input of `player` at `at`.
    #[must_use]
    pub fn input(&self, player: PlayerNumber, at: IndexedFrame) -> Option<InputBits> {
        self.histories
            .get(&at.index)
            .and_then(|h| h[player.slot()].get(at.frame as usize))
            .copied()
    }

    /// Stores local input sampled at `at`, to be used at `at.frame + delay`.
    ///
    /// Frames below the delayed target that have no input yet are filled with neutral
    /// input. A target frame that already has input keeps it: sent input is immutable.
    pub fn set_input(&mut self, player: PlayerNumber, at: IndexedFrame, bits: InputBits) {
        let target = (at.frame + self.delay) as usize;
        let history = &mut self.histories.entry(at.index).or_default()[player.slot()];
        if history.len() > target {
            return;
        }
        history.resize(target, 0);
        history.push(bits);
    }

    /// Stores a contiguous run of `player`'s input received from the network.
    ///
    /// Frames already known must carry the same value. A run that starts beyond the known
    /// frames leaves a gap and is dropped.
    pub fn receive_inputs(&mut self, player: PlayerNumber, start: IndexedFrame, inputs: &[InputBits]) {
        let known = self.known_frames(player, start.index);
        if start.frame > known {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InputSync,
                "inputs for {} start at {} but only {} frames are known",
                player,
                start,
                known
            );
            return;
        }
        for (offset, &bits) in inputs.iter().enumerate() {
            let at = IndexedFrame::new(start.frame + offset as u32, start.index);
            self.store_remote(player, at, bits);
        }
    }

    fn store_remote(&mut self, player: PlayerNumber, at: IndexedFrame, bits: InputBits) {
        let history = &mut self.histories.entry(at.index).or_default()[player.slot()];
        let frame = at.frame as usize;
        if let Some(&confirmed) = history.get(frame) {
            if confirmed != bits {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InputSync,
                    "confirmed input of {} at {} changed from {:#06x} to {:#06x}",
                    player,
                    at,
                    confirmed,
                    bits
                );
            }
            return;
        }
        if frame != history.len() {
            return;
        }
        history.push(bits);

        if player != self.remote_player {
            return;
        }
        if let Some(predicted) = self.predictions.remove(&at) {
            if predicted != bits {
                tracing::debug!(%at, predicted, actual = bits, "misprediction");
                self.changed = Some(self.changed.map_or(at, |c| c.min(at)));
            }
        }
    }

    /// Spectators: the stream starts at `start`, so earlier frames of that instance are
    /// never simulated and read as neutral input.
    pub fn begin_stream(&mut self, start: IndexedFrame) {
        let histories = self.histories.entry(start.index).or_default();
        for history in histories.iter_mut() {
            if history.len() < start.frame as usize {
                history.resize(start.frame as usize, 0);
            }
        }
    }

    /// Stores a contiguous run of both players' input (spectators).
    pub fn receive_both_inputs(&mut self, start: IndexedFrame, inputs: &[[InputBits; 2]]) {
        let known = self
            .known_frames(PlayerNumber::ONE, start.index)
            .min(self.known_frames(PlayerNumber::TWO, start.index));
        if start.frame > known {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InputSync,
                "both inputs start at {} but only {} frames are known",
                start,
                known
            );
            return;
        }
        for (offset, pair) in inputs.iter().enumerate() {
            let at = IndexedFrame::new(start.frame + offset as u32, start.index);
            self.store_remote(PlayerNumber::ONE, at, pair[0]);
            self.store_remote(PlayerNumber::TWO, at, pair[1]);
        }
    }

    /// `true` once the input needed to simulate `at` in `state` is available.
    ///
    /// Before character select and in the retry menu no remote input is needed. In a
    /// match with rollback enabled, the remote side may lag by up to `rollback` frames.
    #[must_use]
    pub fn is_remote_input_ready(&self, at: IndexedFrame, state: NetplayState) -> bool {
        if self.spectate {
            return self.known_frames(PlayerNumber::ONE, at.index) > at.frame
                && self.known_frames(PlayerNumber::TWO, at.index) > at.frame;
        }
        if state < NetplayState::CharaSelect || state == NetplayState::RetryMenu {
            return true;
        }
        let known = self.known_frames(self.remote_player, at.index);
        if self.may_predict(state) {
            known + self.rollback > at.frame
        } else {
            known > at.frame
        }
    }

    fn may_predict(&self, state: NetplayState) -> bool {
        self.rollback > 0 && state == NetplayState::InGame && !self.spectate
    }

    /// Inputs of player one and two for `at`.
    ///
    /// Missing remote input is predicted (and the prediction remembered) only when
    /// rollback is possible in `state`. Otherwise missing input reads as neutral.
    pub fn frame_inputs(&mut self, at: IndexedFrame, state: NetplayState) -> [InputBits; 2] {
        let mut out = [0; 2];
        for player in [PlayerNumber::ONE, PlayerNumber::TWO] {
            out[player.slot()] = match self.input(player, at) {
                Some(bits) => bits,
                None if player == self.remote_player && self.may_predict(state) => {
                    let predicted = self.last_known(player, at);
                    self.predictions.insert(at, predicted);
                    predicted
                },
                None => 0,
            };
        }
        out
    }

    fn last_known(&self, player: PlayerNumber, at: IndexedFrame) -> InputBits {
        self.histories
            .get(&at.index)
            .and_then(|h| {
                let history = &h[player.slot()];
                history
                    .get(..=at.frame as usize)
                    .unwrap_or(history.as_slice())
                    .last()
            })
            .copied()
            .unwrap_or(0)
    }

    /// `true` if no prediction at or before `at` is still unresolved.
    #[must_use]
    pub fn is_confirmed(&self, at: IndexedFrame) -> bool {
        self.predictions
            .first_key_value()
            .map_or(true, |(&first, _)| first > at)
    }

    /// Takes the earliest frame whose prediction turned out wrong.
    pub fn take_changed(&mut self) -> Option<IndexedFrame> {
        self.changed.take()
    }

    /// Forgets predictions at or after `from`; they are made again during replay.
    pub fn discard_predictions_from(&mut self, from: IndexedFrame) {
        self.predictions.retain(|&at, _| at < from);
    }

    /// `PlayerInputs` messages carrying the trailing window of `player`'s known input.
    ///
    /// Early in a match instance the tail of the previous instance is repeated too, if
    /// that instance was transmitted, in case the remote side still waits on it.
    pub fn inputs_messages(&mut self, player: PlayerNumber, at: IndexedFrame) -> InputMessages {
        self.transmitted.insert(at.index);
        let mut out = InputMessages::new();
        let window = self.window();
        if at.index > 0
            && (at.frame as usize) < window
            && self.transmitted.contains(&(at.index - 1))
        {
            if let Some(msg) = self.tail_message(player, at.index - 1, window) {
                out.push(msg);
            }
        }
        if let Some(msg) = self.tail_message(player, at.index, window) {
            out.push(msg);
        }
        out
    }

    /// Frames per message: enough to cover everything the remote side may still miss.
    fn window(&self) -> usize {
        NUM_INPUTS.max((self.delay + self.rollback + 2) as usize)
    }

    fn tail_message(&self, player: PlayerNumber, index: u32, window: usize) -> Option<NetplayMessage> {
        let history = &self.histories.get(&index)?[player.slot()];
        if history.is_empty() {
            return None;
        }
        let start = history.len().saturating_sub(window);
        Some(NetplayMessage::PlayerInputs {
            start: IndexedFrame::new(start as u32, index),
            inputs: history[start..].to_vec(),
        })
    }

    /// Up to `max` frames of both players' confirmed input starting at `pos`.
    #[must_use]
    pub fn both_inputs(&self, pos: IndexedFrame, max: usize) -> Option<Vec<[InputBits; 2]>> {
        let history = self.histories.get(&pos.index)?;
        let confirmed = history[0].len().min(history[1].len());
        let start = pos.frame as usize;
        if start >= confirmed {
            return None;
        }
        let end = confirmed.min(start + max);
        Some((start..end).map(|f| [history[0][f], history[1][f]]).collect())
    }

    /// Records the local retry menu choice for match instance `index`.
    pub fn set_local_menu(&mut self, index: u32, selection: u8) {
        self.menu.entry(index).or_default().local = Some(selection);
    }

    /// Records the remote retry menu choice for match instance `index`.
    pub fn set_remote_menu(&mut self, index: u32, selection: u8) {
        let entry = self.menu.entry(index).or_default();
        if let Some(previous) = entry.remote.filter(|&p| p != selection) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InputSync,
                "remote menu selection for index {} changed from {} to {}",
                index,
                previous,
                selection
            );
            return;
        }
        entry.remote = Some(selection);
    }

    /// Local retry menu choice for `index`, if made.
    #[must_use]
    pub fn local_menu(&self, index: u32) -> Option<u8> {
        self.menu.get(&index).and_then(|m| m.local)
    }

    /// Remote retry menu choice for `index`, if received.
    #[must_use]
    pub fn remote_menu(&self, index: u32) -> Option<u8> {
        self.menu.get(&index).and_then(|m| m.remote)
    }

    /// Final retry menu choice, known only once both sides chose.
    ///
    /// The higher entry wins, so "quit" style entries placed below "retry" take precedence.
    #[must_use]
    pub fn retry_selection(&self, index: u32) -> Option<u8> {
        let selection = self.menu.get(&index)?;
        Some(selection.local?.max(selection.remote?))
    }

    /// Stores the inputs of match instances `first..=last` as the last finished game.
    pub fn archive_game(&mut self, first: u32, last: u32) {
        let inputs: BTreeMap<_, _> = self
            .histories
            .range(first..=last)
            .map(|(&index, h)| (index, h.clone()))
            .collect();
        tracing::debug!(first, last, instances = inputs.len(), "archived game inputs");
        self.last_game = Some(ArchivedGame {
            first_index: first,
            last_index: last,
            inputs,
        });
    }

    /// The last finished game, if any.
    #[must_use]
    pub fn last_game(&self) -> Option<&ArchivedGame> {
        self.last_game.as_ref()
    }

    /// Drops inputs, predictions and menu choices of instances before `index`.
    pub fn prune_before(&mut self, index: u32) {
        self.histories = self.histories.split_off(&index);
        self.menu = self.menu.split_off(&index);
        self.transmitted = self.transmitted.split_off(&index);
        if self.changed.is_some_and(|at| at.index < index) {
            self.changed = None;
        }
        let stale = self
            .predictions
            .keys()
            .take_while(|at| at.index < index)
            .count();
        if stale > 0 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputSync,
                "{} predictions before index {} were never resolved",
                stale,
                index
            );
            self.predictions = self.predictions.split_off(&IndexedFrame::start_of(index));
        }
    }
}

impl InvariantChecker for InputSynchronizer {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.rollback as usize > MAX_ROLLBACK {
            return Err(InvariantViolation::new(
                "InputSynchronizer",
                "rollback exceeds MAX_ROLLBACK",
            )
            .with_details(format!("rollback={}", self.rollback)));
        }
        for at in self.predictions.keys() {
            if self.input(self.remote_player, *at).is_some() {
                return Err(InvariantViolation::new(
                    "InputSynchronizer",
                    "prediction kept for a confirmed frame",
                )
                .with_details(format!("frame={at}")));
            }
        }
        if let Some(changed) = self.changed {
            if self.input(self.remote_player, changed).is_none() {
                return Err(InvariantViolation::new(
                    "InputSynchronizer",
                    "changed frame has no confirmed input",
                )
                .with_details(format!("frame={changed}")));
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

    fn at(frame: u32, index: u32) -> IndexedFrame {
        IndexedFrame::new(frame, index)
    }

    // ==========================================
    // Local input and delay
    // ==========================================

    #[test]
    fn delay_shifts_local_input() {
        let mut sync = InputSynchronizer::new();
        sync.set_delay(2);
        sync.set_input(PlayerNumber::ONE, at(0, 1), 0x10);
        assert_eq!(sync.known_frames(PlayerNumber::ONE, 1), 3);
        assert_eq!(sync.input(PlayerNumber::ONE, at(0, 1)), Some(0));
        assert_eq!(sync.input(PlayerNumber::ONE, at(1, 1)), Some(0));
        assert_eq!(sync.input(PlayerNumber::ONE, at(2, 1)), Some(0x10));
    }

    #[test]
    fn stored_local_input_is_immutable() {
        let mut sync = InputSynchronizer::new();
        sync.set_input(PlayerNumber::ONE, at(0, 1), 1);
        sync.set_input(PlayerNumber::ONE, at(0, 1), 2);
        assert_eq!(sync.input(PlayerNumber::ONE, at(0, 1)), Some(1));
    }

    // ==========================================
    // Remote input and readiness
    // ==========================================

    #[test]
    fn remote_input_gates_readiness() {
        let mut sync = InputSynchronizer::new();
        assert!(!sync.is_remote_input_ready(at(0, 3), NetplayState::CharaSelect));
        sync.receive_inputs(PlayerNumber::TWO, at(0, 3), &[5, 6]);
        assert!(sync.is_remote_input_ready(at(1, 3), NetplayState::CharaSelect));
        assert!(!sync.is_remote_input_ready(at(2, 3), NetplayState::CharaSelect));
    }

    #[test]
    fn no_remote_input_needed_before_chara_select_or_in_retry() {
        let sync = InputSynchronizer::new();
        assert!(sync.is_remote_input_ready(at(50, 1), NetplayState::Initial));
        assert!(sync.is_remote_input_ready(at(50, 9), NetplayState::RetryMenu));
    }

    #[test]
    fn overlapping_runs_are_merged() {
        let mut sync = InputSynchronizer::new();
        sync.receive_inputs(PlayerNumber::TWO, at(0, 1), &[1, 2, 3]);
        sync.receive_inputs(PlayerNumber::TWO, at(1, 1), &[2, 3, 4, 5]);
        assert_eq!(sync.known_frames(PlayerNumber::TWO, 1), 5);
        assert_eq!(sync.input(PlayerNumber::TWO, at(4, 1)), Some(5));
    }

    #[test]
    fn gapped_run_is_dropped() {
        let mut sync = InputSynchronizer::new();
        sync.receive_inputs(PlayerNumber::TWO, at(5, 1), &[1, 2]);
        assert_eq!(sync.known_frames(PlayerNumber::TWO, 1), 0);
    }

    #[test]
    fn confirmed_remote_input_never_changes() {
        let mut sync = InputSynchronizer::new();
        sync.receive_inputs(PlayerNumber::TWO, at(0, 1), &[7]);
        sync.receive_inputs(PlayerNumber::TWO, at(0, 1), &[8]);
        assert_eq!(sync.input(PlayerNumber::TWO, at(0, 1)), Some(7));
    }

    #[test]
    fn spectators_wait_for_both_players() {
        let mut sync = InputSynchronizer::new();
        sync.set_spectate(true);
        sync.receive_inputs(PlayerNumber::ONE, at(0, 7), &[1]);
        assert!(!sync.is_remote_input_ready(at(0, 7), NetplayState::InGame));
        sync.receive_both_inputs(at(0, 7), &[[1, 2], [3, 4]]);
        assert!(sync.is_remote_input_ready(at(1, 7), NetplayState::InGame));
        assert_eq!(sync.frame_inputs(at(1, 7), NetplayState::InGame), [3, 4]);
    }

    // ==========================================
    // Prediction
    // ==========================================

    #[test]
    fn rollback_allows_running_ahead() {
        let mut sync = InputSynchronizer::new();
        sync.set_rollback(3);
        sync.receive_inputs(PlayerNumber::TWO, at(0, 4), &[9]);
        assert!(sync.is_remote_input_ready(at(3, 4), NetplayState::InGame));
        assert!(!sync.is_remote_input_ready(at(4, 4), NetplayState::InGame));
        // only while in a match
        assert!(!sync.is_remote_input_ready(at(3, 4), NetplayState::CharaSelect));
    }

    #[test]
    fn prediction_repeats_last_known_and_detects_change() {
        let mut sync = InputSynchronizer::new();
        sync.set_rollback(4);
        sync.receive_inputs(PlayerNumber::TWO, at(0, 4), &[9]);
        assert_eq!(sync.frame_inputs(at(1, 4), NetplayState::InGame)[1], 9);
        assert_eq!(sync.frame_inputs(at(2, 4), NetplayState::InGame)[1], 9);
        assert!(!sync.is_confirmed(at(1, 4)));

        sync.receive_inputs(PlayerNumber::TWO, at(1, 4), &[9, 3]);
        assert_eq!(sync.take_changed(), Some(at(2, 4)));
        assert_eq!(sync.take_changed(), None);
        assert!(sync.is_confirmed(at(2, 4)));
    }

    #[test]
    fn correct_prediction_is_silent() {
        let mut sync = InputSynchronizer::new();
        sync.set_rollback(2);
        sync.receive_inputs(PlayerNumber::TWO, at(0, 4), &[1]);
        sync.frame_inputs(at(1, 4), NetplayState::InGame);
        sync.receive_inputs(PlayerNumber::TWO, at(1, 4), &[1]);
        assert_eq!(sync.take_changed(), None);
        assert!(sync.check_invariants().is_ok());
    }

    #[test]
    fn no_prediction_without_rollback() {
        let mut sync = InputSynchronizer::new();
        assert_eq!(sync.frame_inputs(at(0, 4), NetplayState::InGame), [0, 0]);
        assert!(sync.is_confirmed(at(0, 4)));
    }

    #[test]
    fn discarded_predictions_are_forgotten() {
        let mut sync = InputSynchronizer::new();
        sync.set_rollback(4);
        sync.frame_inputs(at(0, 2), NetplayState::InGame);
        sync.frame_inputs(at(1, 2), NetplayState::InGame);
        sync.discard_predictions_from(at(1, 2));
        assert!(!sync.is_confirmed(at(0, 2)));
        sync.receive_inputs(PlayerNumber::TWO, at(0, 2), &[0]);
        assert!(sync.is_confirmed(at(5, 2)));
    }

    // ==========================================
    // Messages
    // ==========================================

    #[test]
    fn messages_carry_trailing_window() {
        let mut sync = InputSynchronizer::new();
        for f in 0..40 {
            sync.set_input(PlayerNumber::ONE, at(f, 2), f as u16);
        }
        let msgs = sync.inputs_messages(PlayerNumber::ONE, at(39, 2));
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            NetplayMessage::PlayerInputs { start, inputs } => {
                assert_eq!(*start, at(10, 2));
                assert_eq!(inputs.len(), NUM_INPUTS);
                assert_eq!(inputs[NUM_INPUTS - 1], 39);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn early_frames_repeat_previous_index_tail() {
        let mut sync = InputSynchronizer::new();
        sync.set_input(PlayerNumber::ONE, at(0, 1), 1);
        sync.inputs_messages(PlayerNumber::ONE, at(0, 1));
        sync.set_input(PlayerNumber::ONE, at(0, 2), 2);
        let msgs = sync.inputs_messages(PlayerNumber::ONE, at(0, 2));
        assert_eq!(msgs.len(), 2);
        assert!(matches!(
            msgs[0],
            NetplayMessage::PlayerInputs { start, .. } if start.index == 1
        ));
    }

    #[test]
    fn untransmitted_previous_index_is_not_repeated() {
        let mut sync = InputSynchronizer::new();
        sync.set_input(PlayerNumber::ONE, at(0, 1), 1);
        sync.set_input(PlayerNumber::ONE, at(0, 2), 2);
        assert_eq!(sync.inputs_messages(PlayerNumber::ONE, at(0, 2)).len(), 1);
    }

    #[test]
    fn stream_start_fills_unsimulated_frames() {
        let mut sync = InputSynchronizer::new();
        sync.set_spectate(true);
        sync.begin_stream(at(120, 5));
        sync.receive_both_inputs(at(120, 5), &[[1, 2]]);
        assert!(sync.is_remote_input_ready(at(120, 5), NetplayState::CharaSelect));
        assert!(!sync.is_remote_input_ready(at(121, 5), NetplayState::CharaSelect));
    }

    #[test]
    fn both_inputs_stop_at_confirmed() {
        let mut sync = InputSynchronizer::new();
        for f in 0..10 {
            sync.set_input(PlayerNumber::ONE, at(f, 3), 1);
        }
        sync.receive_inputs(PlayerNumber::TWO, at(0, 3), &[2; 6]);
        let batch = sync.both_inputs(at(2, 3), 30).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0], [1, 2]);
        assert!(sync.both_inputs(at(6, 3), 30).is_none());
    }

    // ==========================================
    // Retry menu
    // ==========================================

    #[test]
    fn retry_selection_needs_both_sides() {
        let mut sync = InputSynchronizer::new();
        sync.set_local_menu(8, 0);
        assert_eq!(sync.retry_selection(8), None);
        sync.set_remote_menu(8, 2);
        assert_eq!(sync.retry_selection(8), Some(2));
        assert_eq!(sync.retry_selection(9), None);
    }

    #[test]
    fn remote_menu_selection_is_sticky() {
        let mut sync = InputSynchronizer::new();
        sync.set_remote_menu(8, 1);
        sync.set_remote_menu(8, 0);
        assert_eq!(sync.remote_menu(8), Some(1));
    }

    // ==========================================
    // Housekeeping
    // ==========================================

    #[test]
    fn archive_and_prune() {
        let mut sync = InputSynchronizer::new();
        for index in 1..=5 {
            sync.set_input(PlayerNumber::ONE, at(0, index), index as u16);
        }
        sync.archive_game(3, 4);
        sync.prune_before(4);
        assert_eq!(sync.known_frames(PlayerNumber::ONE, 3), 0);
        assert_eq!(sync.known_frames(PlayerNumber::ONE, 4), 1);

        let game = sync.last_game().unwrap();
        assert_eq!(game.first_index, 3);
        assert_eq!(game.inputs.len(), 2);
        assert_eq!(game.inputs[&3][0], vec![3]);
    }
}
