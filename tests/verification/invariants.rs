//! Invariant checks under random operation sequences.
//!
//! Every component implementing [`InvariantChecker`] is driven with arbitrary sequences
//! of its public operations, including out-of-order and contradictory ones, and must
//! report no violated invariant after any step.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::SocketAddr;

use fortress_netplay::consensus::{ConsensusChannel, ConsensusRole, RngState};
use fortress_netplay::desync::{DesyncDetector, SyncHash, MAX_PENDING_HASHES};
use fortress_netplay::input_sync::InputSynchronizer;
use fortress_netplay::snapshots::SnapshotRing;
use fortress_netplay::spectator::SpectatorRelay;
use fortress_netplay::telemetry::InvariantChecker;
use fortress_netplay::{
    DesyncDetection, IndexedFrame, InputBits, NetplayState, PlayerNumber,
};
use proptest::prelude::*;

fn assert_holds(component: &impl InvariantChecker) -> Result<(), TestCaseError> {
    if let Err(violation) = component.check_invariants() {
        return Err(TestCaseError::fail(format!("{violation}")));
    }
    Ok(())
}

fn frame_strategy() -> impl Strategy<Value = IndexedFrame> {
    (0u32..40, 0u32..4).prop_map(|(frame, index)| IndexedFrame::new(frame, index))
}

fn player_strategy() -> impl Strategy<Value = PlayerNumber> {
    prop_oneof![Just(PlayerNumber::ONE), Just(PlayerNumber::TWO)]
}

fn state_strategy() -> impl Strategy<Value = NetplayState> {
    prop_oneof![
        Just(NetplayState::Initial),
        Just(NetplayState::CharaSelect),
        Just(NetplayState::Loading),
        Just(NetplayState::Skippable),
        Just(NetplayState::InGame),
        Just(NetplayState::RetryMenu),
    ]
}

// ============================================================================
// InputSynchronizer
// ============================================================================

#[derive(Debug, Clone)]
enum SyncOp {
    SetInput(PlayerNumber, IndexedFrame, InputBits),
    Receive(PlayerNumber, IndexedFrame, Vec<InputBits>),
    FrameInputs(IndexedFrame, NetplayState),
    TakeChanged,
    Discard(IndexedFrame),
    Menu(u32, u8, bool),
    Prune(u32),
}

fn sync_op_strategy() -> impl Strategy<Value = SyncOp> {
    prop_oneof![
        // Local input only: the remote player's input arrives through `Receive`.
        (frame_strategy(), any::<InputBits>())
            .prop_map(|(at, bits)| SyncOp::SetInput(PlayerNumber::ONE, at, bits)),
        (
            player_strategy(),
            frame_strategy(),
            prop::collection::vec(any::<InputBits>(), 1..10)
        )
            .prop_map(|(p, at, inputs)| SyncOp::Receive(p, at, inputs)),
        (frame_strategy(), state_strategy()).prop_map(|(at, s)| SyncOp::FrameInputs(at, s)),
        Just(SyncOp::TakeChanged),
        frame_strategy().prop_map(SyncOp::Discard),
        (0u32..4, 0u8..3, any::<bool>()).prop_map(|(i, sel, local)| SyncOp::Menu(i, sel, local)),
        (0u32..4).prop_map(SyncOp::Prune),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn input_synchronizer_invariants_hold(
        delay in 0u8..4,
        rollback in 0u8..8,
        ops in prop::collection::vec(sync_op_strategy(), 1..120),
    ) {
        let mut sync = InputSynchronizer::new();
        sync.set_delay(delay);
        sync.set_rollback(rollback);
        sync.set_remote_player(PlayerNumber::TWO);
        assert_holds(&sync)?;

        for op in ops {
            match op {
                SyncOp::SetInput(player, at, bits) => sync.set_input(player, at, bits),
                SyncOp::Receive(player, start, inputs) => sync.receive_inputs(player, start, &inputs),
                SyncOp::FrameInputs(at, state) => {
                    sync.frame_inputs(at, state);
                },
                SyncOp::TakeChanged => {
                    sync.take_changed();
                },
                SyncOp::Discard(from) => sync.discard_predictions_from(from),
                SyncOp::Menu(index, selection, true) => sync.set_local_menu(index, selection),
                SyncOp::Menu(index, selection, false) => sync.set_remote_menu(index, selection),
                SyncOp::Prune(index) => sync.prune_before(index),
            }
            assert_holds(&sync)?;
        }
    }
}

// ============================================================================
// ConsensusChannel
// ============================================================================

#[derive(Debug, Clone)]
enum ConsensusOp {
    Arm(u32),
    Produce(u32),
    Receive(u32),
    Apply(u32),
    Prune(u32),
}

fn consensus_op_strategy() -> impl Strategy<Value = ConsensusOp> {
    prop_oneof![
        (0u32..30).prop_map(ConsensusOp::Arm),
        (0u32..30).prop_map(ConsensusOp::Produce),
        (0u32..30).prop_map(ConsensusOp::Receive),
        (0u32..30).prop_map(ConsensusOp::Apply),
        (0u32..30).prop_map(ConsensusOp::Prune),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn consensus_invariants_hold_for_every_role(
        role in prop_oneof![
            Just(ConsensusRole::Authority),
            Just(ConsensusRole::Consumer),
            Just(ConsensusRole::Passive),
        ],
        ops in prop::collection::vec(consensus_op_strategy(), 1..100),
    ) {
        let mut channel = ConsensusChannel::new(role);
        for op in ops {
            match op {
                ConsensusOp::Arm(index) => {
                    channel.arm(index);
                },
                ConsensusOp::Produce(index) => {
                    channel.produce(index, index.to_le_bytes().to_vec());
                },
                ConsensusOp::Receive(index) => {
                    channel.receive(RngState::new(index, vec![index as u8]));
                },
                ConsensusOp::Apply(index) => {
                    if let Some(state) = channel.take_for_apply(index) {
                        prop_assert_eq!(state.index, index);
                    }
                },
                ConsensusOp::Prune(index) => channel.prune_before(index),
            }
            assert_holds(&channel)?;
        }
        if role == ConsensusRole::Passive {
            prop_assert_eq!(channel.armed(), None);
        }
    }
}

// ============================================================================
// DesyncDetector
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn desync_queues_stay_bounded(
        ops in prop::collection::vec((any::<bool>(), 0u32..400, any::<u8>()), 1..300),
    ) {
        let mut detector = DesyncDetector::new(DesyncDetection::On { interval: 10 });
        for (local, frame, seed) in ops {
            let hash = SyncHash::compute(IndexedFrame::new(frame * 10, 4), &[seed]);
            if local {
                detector.push_local(hash);
            } else {
                detector.push_remote(hash);
            }
            assert_holds(&detector)?;
            let (l, r) = detector.pending();
            prop_assert!(l <= MAX_PENDING_HASHES && r <= MAX_PENDING_HASHES);
        }
    }
}

// ============================================================================
// SpectatorRelay
// ============================================================================

#[derive(Debug, Clone)]
enum RelayOp {
    Pending(u16),
    Admit(u16, IndexedFrame),
    Remove(u16),
    PopPending(u16),
    Clear,
}

fn relay_op_strategy() -> impl Strategy<Value = RelayOp> {
    let port = 9000u16..9008;
    prop_oneof![
        port.clone().prop_map(RelayOp::Pending),
        (port.clone(), frame_strategy()).prop_map(|(p, at)| RelayOp::Admit(p, at)),
        port.clone().prop_map(RelayOp::Remove),
        port.prop_map(RelayOp::PopPending),
        Just(RelayOp::Clear),
    ]
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn relay_never_holds_a_connection_twice(
        batch in 1u32..60,
        ops in prop::collection::vec(relay_op_strategy(), 1..80),
    ) {
        let mut relay: SpectatorRelay<SocketAddr> = SpectatorRelay::new(batch);
        for op in ops {
            match op {
                RelayOp::Pending(port) => {
                    if !relay.contains(&addr(port)) {
                        relay.add_pending(addr(port));
                    }
                },
                RelayOp::Admit(port, pos) => {
                    let was_pending = relay.is_pending(&addr(port));
                    prop_assert_eq!(relay.admit(addr(port), pos), was_pending);
                    if was_pending {
                        prop_assert_eq!(relay.position(&addr(port)), Some(pos));
                    }
                },
                RelayOp::Remove(port) => {
                    relay.remove(&addr(port));
                    prop_assert!(!relay.contains(&addr(port)));
                },
                RelayOp::PopPending(port) => {
                    relay.pop_pending(&addr(port));
                },
                RelayOp::Clear => {
                    relay.clear();
                    prop_assert!(relay.is_empty());
                },
            }
            assert_holds(&relay)?;
        }
    }
}

// ============================================================================
// SnapshotRing
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn snapshot_ring_returns_only_the_frame_asked_for(
        rollback in 0usize..10,
        frames in prop::collection::vec(0u32..100, 1..60),
    ) {
        let mut ring = SnapshotRing::new(rollback);
        prop_assert_eq!(ring.capacity(), rollback + 2);
        for &frame in &frames {
            let at = IndexedFrame::new(frame, 4);
            ring.save(at, frame);
            prop_assert_eq!(ring.get(at), Some(&frame));
            assert_holds(&ring)?;
        }
        for frame in 0..100 {
            if let Some(&held) = ring.get(IndexedFrame::new(frame, 4)) {
                prop_assert_eq!(held, frame);
            }
        }
        prop_assert!(ring.len() <= ring.capacity());
    }
}
