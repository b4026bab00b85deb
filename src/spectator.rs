//! Fan-out of a running match to read-only spectators.
//!
//! Spectators connect on the control channel and go through a version handshake while
//! *pending*. Once they confirm the configuration they are admitted with a cursor
//! (`pos`): the next frame of both players' input the relay owes them. Cursors only move
//! forward after a successful send, so a failed send is retried on the next batch frame.

use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::frame_info::IndexedFrame;
use crate::input_sync::InputSynchronizer;
use crate::network::messages::NetplayMessage;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{Channel, NetplayState, Transport};

/// Batches sent to one spectator per batch frame, so late joiners catch up quickly.
pub const MAX_BATCHES_PER_TICK: usize = 4;

/// Progress of one admitted spectator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SpectatorState {
    /// Next frame owed to the spectator.
    pub pos: IndexedFrame,
}

/// Pending and admitted spectator connections.
#[derive(Debug, Clone)]
pub struct SpectatorRelay<A: Ord> {
    batch: u32,
    pending: BTreeMap<A, ()>,
    spectators: BTreeMap<A, SpectatorState>,
}

impl<A: Clone + Ord + Debug> SpectatorRelay<A> {
    /// Creates a relay sending `batch` frames per message.
    #[must_use]
    pub fn new(batch: u32) -> Self {
        Self {
            batch: batch.max(1),
            pending: BTreeMap::new(),
            spectators: BTreeMap::new(),
        }
    }

    /// Tracks a connection that still has to finish the handshake.
    pub fn add_pending(&mut self, addr: A) {
        self.pending.insert(addr, ());
    }

    /// Removes a pending connection, returning `true` if it was pending.
    pub fn pop_pending(&mut self, addr: &A) -> bool {
        self.pending.remove(addr).is_some()
    }

    /// `true` if `addr` is still in the handshake.
    #[must_use]
    pub fn is_pending(&self, addr: &A) -> bool {
        self.pending.contains_key(addr)
    }

    /// First frame a spectator joining now receives.
    ///
    /// Character select can be resumed from the current frame. Before character select
    /// the stream starts with the next match instance. Anything later is replayed from the
    /// first frame of the current game.
    #[must_use]
    pub fn bootstrap_position(
        state: NetplayState,
        current: IndexedFrame,
        game_start_index: u32,
    ) -> IndexedFrame {
        match state {
            NetplayState::CharaSelect => current,
            s if s < NetplayState::CharaSelect => IndexedFrame::start_of(current.index + 1),
            _ => IndexedFrame::start_of(game_start_index),
        }
    }

    /// Admits a spectator at `pos`. The connection must have been pending.
    pub fn admit(&mut self, addr: A, pos: IndexedFrame) -> bool {
        if !self.pop_pending(&addr) {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Spectator,
                "{:?} confirmed without a pending handshake",
                addr
            );
            return false;
        }
        tracing::info!(?addr, %pos, "spectator admitted");
        self.spectators.insert(addr, SpectatorState { pos });
        true
    }

    /// Drops a spectator or pending connection. Returns `true` if it was admitted.
    pub fn remove(&mut self, addr: &A) -> bool {
        self.pending.remove(addr);
        self.spectators.remove(addr).is_some()
    }

    /// Forgets every pending and admitted connection and returns them.
    pub fn clear(&mut self) -> Vec<A> {
        let mut addrs: Vec<A> = std::mem::take(&mut self.pending).into_keys().collect();
        addrs.extend(std::mem::take(&mut self.spectators).into_keys());
        addrs
    }

    /// `true` if `addr` is an admitted spectator.
    #[must_use]
    pub fn contains(&self, addr: &A) -> bool {
        self.spectators.contains_key(addr)
    }

    /// Cursor of an admitted spectator.
    #[must_use]
    pub fn position(&self, addr: &A) -> Option<IndexedFrame> {
        self.spectators.get(addr).map(|s| s.pos)
    }

    /// Admitted spectators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spectators.len()
    }

    /// `true` without admitted spectators.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spectators.is_empty()
    }

    /// Sends `msg` to every admitted spectator on the control channel.
    pub fn forward<T: Transport<A> + ?Sized>(&self, transport: &mut T, msg: &NetplayMessage) {
        for addr in self.spectators.keys() {
            if let Err(err) = transport.send(Channel::Control, addr, msg) {
                tracing::warn!(?addr, kind = msg.kind(), %err, "failed to forward to spectator");
            }
        }
    }

    /// `true` on frames where accumulated input is broadcast.
    #[must_use]
    pub fn is_batch_frame(&self, frame: u32) -> bool {
        frame > 0 && frame % self.batch == 0 && !self.spectators.is_empty()
    }

    /// Sends each spectator the confirmed input it is owed, a few batches at a time.
    ///
    /// A cursor that reached the end of a finished match instance moves on to the next
    /// one. Cursors never pass `current`.
    pub fn broadcast_batch<T: Transport<A> + ?Sized>(
        &mut self,
        transport: &mut T,
        sync: &InputSynchronizer,
        current: IndexedFrame,
    ) {
        let batch = self.batch as usize;
        for (addr, spectator) in &mut self.spectators {
            for _ in 0..MAX_BATCHES_PER_TICK {
                let pos = spectator.pos;
                match sync.both_inputs(pos, batch) {
                    Some(inputs) => {
                        let sent = inputs.len() as u32;
                        let msg = NetplayMessage::BothInputs { start: pos, inputs };
                        if let Err(err) = transport.send(Channel::Control, addr, &msg) {
                            tracing::warn!(?addr, %pos, %err, "failed to send inputs to spectator");
                            break;
                        }
                        spectator.pos.frame += sent;
                    },
                    None if pos.index < current.index => {
                        spectator.pos = IndexedFrame::start_of(pos.index + 1);
                    },
                    None => break,
                }
            }
        }
    }

    /// Lowest match instance any spectator still needs.
    #[must_use]
    pub fn min_pos_index(&self) -> Option<u32> {
        self.spectators.values().map(|s| s.pos.index).min()
    }
}

impl<A: Ord + Debug> InvariantChecker for SpectatorRelay<A> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if let Some(addr) = self.spectators.keys().find(|a| self.pending.contains_key(*a)) {
            return Err(InvariantViolation::new(
                "SpectatorRelay",
                "connection is both pending and admitted",
            )
            .with_details(format!("{addr:?}")));
        }
        if self.batch == 0 {
            return Err(InvariantViolation::new("SpectatorRelay", "batch size is zero"));
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
    use crate::error::NetplayError;
    use crate::network::control::IpAddrPort;
    use crate::{PlayerNumber, TransportEvent};
    use web_time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<(u32, NetplayMessage)>,
        fail: bool,
    }

    impl Transport<u32> for RecordingTransport {
        fn listen(&mut self, _channel: Channel, port: u16) -> Result<u16, NetplayError> {
            Ok(port)
        }

        fn connect(&mut self, _channel: Channel, _target: &IpAddrPort) -> Result<u32, NetplayError> {
            Ok(0)
        }

        fn send(&mut self, _channel: Channel, to: &u32, msg: &NetplayMessage) -> Result<(), NetplayError> {
            if self.fail {
                return Err(NetplayError::Disconnected);
            }
            self.sent.push((*to, msg.clone()));
            Ok(())
        }

        fn disconnect(&mut self, _channel: Channel, _peer: &u32) {}

        fn poll(&mut self, _timeout: Duration) -> Vec<TransportEvent<u32>> {
            Vec::new()
        }
    }

    fn confirmed(frames: u32, index: u32) -> InputSynchronizer {
        let mut sync = InputSynchronizer::new();
        for f in 0..frames {
            let at = IndexedFrame::new(f, index);
            sync.set_input(PlayerNumber::ONE, at, 1);
        }
        sync.receive_inputs(PlayerNumber::TWO, IndexedFrame::start_of(index), &vec![2; frames as usize]);
        sync
    }

    // ==========================================
    // Bootstrap
    // ==========================================

    #[test]
    fn chara_select_joiners_start_at_current_frame() {
        let current = IndexedFrame::new(140, 3);
        let pos = SpectatorRelay::<u32>::bootstrap_position(NetplayState::CharaSelect, current, 1);
        assert_eq!(pos, current);
    }

    #[test]
    fn in_game_joiners_start_at_game_start() {
        let current = IndexedFrame::new(900, 9);
        let pos = SpectatorRelay::<u32>::bootstrap_position(NetplayState::InGame, current, 7);
        assert_eq!(pos, IndexedFrame::start_of(7));
        let pos = SpectatorRelay::<u32>::bootstrap_position(NetplayState::Skippable, current, 9);
        assert_eq!(pos, IndexedFrame::start_of(9));
    }

    #[test]
    fn early_joiners_start_at_next_instance() {
        let current = IndexedFrame::new(12, 1);
        let pos = SpectatorRelay::<u32>::bootstrap_position(NetplayState::Initial, current, 0);
        assert_eq!(pos, IndexedFrame::start_of(2));
    }

    #[test]
    fn admission_requires_pending_handshake() {
        let mut relay = SpectatorRelay::new(30);
        assert!(!relay.admit(1, IndexedFrame::start_of(2)));
        relay.add_pending(1);
        assert!(relay.is_pending(&1));
        assert!(relay.admit(1, IndexedFrame::start_of(2)));
        assert!(!relay.is_pending(&1));
        assert_eq!(relay.position(&1), Some(IndexedFrame::start_of(2)));
        assert!(relay.check_invariants().is_ok());
    }

    // ==========================================
    // Batching
    // ==========================================

    #[test]
    fn batch_frames_need_spectators() {
        let mut relay = SpectatorRelay::new(30);
        assert!(!relay.is_batch_frame(30));
        relay.add_pending(1);
        relay.admit(1, IndexedFrame::default());
        assert!(!relay.is_batch_frame(0));
        assert!(!relay.is_batch_frame(31));
        assert!(relay.is_batch_frame(60));
    }

    #[test]
    fn batches_advance_cursor_only_on_success() {
        let sync = confirmed(45, 7);
        let mut relay = SpectatorRelay::new(30);
        relay.add_pending(5);
        relay.admit(5, IndexedFrame::start_of(7));

        let mut transport = RecordingTransport {
            fail: true,
            ..RecordingTransport::default()
        };
        relay.broadcast_batch(&mut transport, &sync, IndexedFrame::new(45, 7));
        assert_eq!(relay.position(&5), Some(IndexedFrame::start_of(7)));

        transport.fail = false;
        relay.broadcast_batch(&mut transport, &sync, IndexedFrame::new(45, 7));
        assert_eq!(relay.position(&5), Some(IndexedFrame::new(45, 7)));
        assert_eq!(transport.sent.len(), 2);
        match &transport.sent[0].1 {
            NetplayMessage::BothInputs { start, inputs } => {
                assert_eq!(*start, IndexedFrame::start_of(7));
                assert_eq!(inputs.len(), 30);
                assert_eq!(inputs[0], [1, 2]);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn finished_instances_are_skipped() {
        let sync = confirmed(10, 8);
        let mut relay = SpectatorRelay::new(30);
        relay.add_pending(5);
        relay.admit(5, IndexedFrame::start_of(7));
        let mut transport = RecordingTransport::default();
        relay.broadcast_batch(&mut transport, &sync, IndexedFrame::new(10, 8));
        assert_eq!(relay.position(&5), Some(IndexedFrame::new(10, 8)));
        assert_eq!(relay.min_pos_index(), Some(8));
    }

    #[test]
    fn forward_reaches_every_spectator() {
        let mut relay = SpectatorRelay::new(30);
        for addr in [1, 2, 3] {
            relay.add_pending(addr);
            relay.admit(addr, IndexedFrame::default());
        }
        relay.remove(&2);
        let mut transport = RecordingTransport::default();
        relay.forward(&mut transport, &NetplayMessage::ConfirmConfig);
        let targets: Vec<u32> = transport.sent.iter().map(|(to, _)| *to).collect();
        assert_eq!(targets, vec![1, 3]);
    }
}
