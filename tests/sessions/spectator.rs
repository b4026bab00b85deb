//! Spectators: joining a broadcast at different phases and following the stream.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::ip_constant
)]

use crate::common::harness::{
    broadcaster, common_frames, run_until, settle, spectator, Peer,
};
use crate::common::host::{
    Script, ScriptedHost, CHARA_SELECT, IN_GAME, LOADING, RETRY, TITLE,
};
use fortress_netplay::network::loopback::LoopbackHub;
use fortress_netplay::{
    IndexedFrame, InitialMode, Lifecycle, NetplayEvent, NetplayMessage, NetplayState,
};

fn joined_at(caster: &Peer) -> Option<IndexedFrame> {
    caster.events.iter().find_map(|event| match event {
        NetplayEvent::SpectatorJoined { pos, .. } => Some(*pos),
        _ => None,
    })
}

fn stream_start(caster: &Peer) -> NetplayMessage {
    let sent = caster.sent(|msg| matches!(msg, NetplayMessage::InitialGameState { .. }));
    assert_eq!(sent.len(), 1);
    sent[0].msg.clone()
}

/// Runs both until the spectator simulated `at`.
fn watch_until(caster: &mut Peer, watcher: &mut Peer, at: IndexedFrame) {
    run_until(&mut [caster, watcher], |peers| {
        peers.iter().any(|p| p.is_done()) || peers[1].rng.contains_key(&at)
    });
}

fn assert_same_frames(caster: &Peer, watcher: &Peer, index: u32, min: usize) {
    let frames = common_frames(caster, watcher, index);
    assert!(frames.len() >= min, "only {} frames in common", frames.len());
    for (at, a, b) in frames {
        assert_eq!(a, b, "generator states differ at {at}");
    }
}

#[test]
fn spectator_joining_mid_match_replays_the_current_game() {
    let hub = LoopbackHub::new();
    let broadcast_script = Script::Sequence(vec![
        (TITLE, 5),
        (CHARA_SELECT, 40),
        (LOADING, 10),
        (IN_GAME, 60),
        (RETRY, 10),
        (LOADING, 10),
        (IN_GAME, u32::MAX),
    ]);
    let (mut caster, port) = broadcaster(&hub, true, ScriptedHost::new(broadcast_script, 0));
    run_until(&mut [&mut caster], |peers| {
        peers[0].is_done() || peers[0].session.current_frame() >= IndexedFrame::new(20, 7)
    });
    assert_eq!(caster.state(), NetplayState::InGame);
    assert_eq!(caster.session.game_start_index(), 7);

    let watch_script = Script::Sequence(vec![
        (TITLE, 10),
        (CHARA_SELECT, 3),
        (LOADING, 5),
        (IN_GAME, u32::MAX),
    ]);
    let mut watcher = spectator(&hub, port, ScriptedHost::new(watch_script, 0));
    settle(&mut [&mut caster, &mut watcher], 6);

    let start = IndexedFrame::start_of(7);
    assert_eq!(joined_at(&caster), Some(start));
    assert_eq!(
        stream_start(&caster),
        NetplayMessage::InitialGameState {
            training: true,
            mode: InitialMode::InGame,
            start,
        }
    );
    let shared: Vec<u32> = caster
        .sent(|msg| matches!(msg, NetplayMessage::RngState(_)))
        .into_iter()
        .filter_map(|sent| match sent.msg {
            NetplayMessage::RngState(state) => Some(state.index),
            _ => None,
        })
        .collect();
    assert!(shared.contains(&7));

    watch_until(&mut caster, &mut watcher, IndexedFrame::new(90, 7));
    assert!(caster.error.is_none(), "{caster:?}");
    assert!(watcher.error.is_none(), "{watcher:?}");

    let first_batch = caster
        .sent(|msg| matches!(msg, NetplayMessage::BothInputs { .. }))
        .into_iter()
        .next()
        .unwrap();
    assert!(matches!(first_batch.msg, NetplayMessage::BothInputs { start: s, .. } if s == start));

    // The local menus are skipped and the stream lines up with the game in progress.
    assert_eq!(watcher.session.game_start_index(), 7);
    assert_eq!(watcher.entered(NetplayState::Loading), Some(IndexedFrame::start_of(6)));
    assert_eq!(watcher.entered(NetplayState::InGame), Some(start));
    assert_same_frames(&caster, &watcher, 7, 90);
}

#[test]
fn spectator_joining_before_character_select_follows_from_the_next_instance() {
    let hub = LoopbackHub::new();
    let (mut caster, port) = broadcaster(&hub, true, ScriptedHost::new(Script::Training, 0));
    let mut watcher = spectator(&hub, port, ScriptedHost::new(Script::Training, 0));
    settle(&mut [&mut caster, &mut watcher], 6);
    assert_eq!(joined_at(&caster), Some(IndexedFrame::start_of(2)));

    watch_until(&mut caster, &mut watcher, IndexedFrame::new(40, 4));
    assert!(watcher.error.is_none(), "{watcher:?}");

    assert_eq!(
        watcher.entered(NetplayState::InitialCharaSelect),
        Some(IndexedFrame::start_of(2))
    );
    // Both start character select from the same shared state.
    assert_same_frames(&caster, &watcher, 2, 30);
    assert_same_frames(&caster, &watcher, 4, 40);
}

#[test]
fn spectator_joining_in_character_select_resumes_at_the_current_frame() {
    let hub = LoopbackHub::new();
    let (mut caster, port) = broadcaster(&hub, true, ScriptedHost::new(Script::Training, 0));
    run_until(&mut [&mut caster], |peers| {
        peers[0].is_done() || peers[0].session.current_frame() >= IndexedFrame::new(10, 2)
    });
    assert_eq!(caster.state(), NetplayState::CharaSelect);
    let current = caster.session.current_frame();

    let mut watcher = spectator(&hub, port, ScriptedHost::new(Script::Training, 0));
    settle(&mut [&mut caster, &mut watcher], 6);
    assert_eq!(joined_at(&caster), Some(current));
    assert_eq!(
        stream_start(&caster),
        NetplayMessage::InitialGameState {
            training: true,
            mode: InitialMode::CharaSelect,
            start: current,
        }
    );

    watch_until(&mut caster, &mut watcher, IndexedFrame::new(40, 4));
    assert!(caster.error.is_none(), "{caster:?}");
    assert!(watcher.error.is_none(), "{watcher:?}");

    assert_eq!(watcher.entered(NetplayState::InitialCharaSelect), Some(current));
    assert_eq!(caster.entered(NetplayState::Loading), Some(IndexedFrame::start_of(3)));
    assert_eq!(watcher.entered(NetplayState::Loading), Some(IndexedFrame::start_of(3)));
    // Character select generator states differ since the spectator joined late; the match
    // starts over from the shared state.
    assert_same_frames(&caster, &watcher, 4, 40);
}

#[test]
fn broadcaster_forgets_a_severed_spectator() {
    let hub = LoopbackHub::new();
    let (mut caster, port) = broadcaster(&hub, true, ScriptedHost::new(Script::Training, 0));
    let mut watcher = spectator(&hub, port, ScriptedHost::new(Script::Training, 0));
    settle(&mut [&mut caster, &mut watcher], 6);
    assert_eq!(caster.session.num_spectators(), 1);

    watcher.probe.sever();
    settle(&mut [&mut caster, &mut watcher], 3);

    assert_eq!(caster.session.num_spectators(), 0);
    assert!(caster
        .events
        .iter()
        .any(|event| matches!(event, NetplayEvent::SpectatorLeft { .. })));
    assert!(caster.error.is_none());
    assert_eq!(caster.session.lifecycle(), Lifecycle::Running);

    assert_eq!(watcher.error_events(), vec!["Disconnected!".to_owned()]);
    assert_eq!(watcher.session.lifecycle(), Lifecycle::Stopped);
    assert!(matches!(watcher.events.last(), Some(NetplayEvent::Stopped)));
}
