//! Disconnects and orchestrator stop requests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::ip_constant
)]

use crate::common::harness::{
    netplay_config, netplay_pair, run_until, settle, Peer, Rules,
};
use crate::common::host::{Script, ScriptedHost};
use fortress_netplay::network::loopback::LoopbackHub;
use fortress_netplay::{
    ControlMessage, DesyncDetection, FrameStatus, IndexedFrame, Lifecycle, LocalInputs,
    NetplayEvent, NetplayState,
};

fn versus_pair(host: ScriptedHost, client: ScriptedHost) -> (Peer, Peer) {
    let hub = LoopbackHub::new();
    netplay_pair(
        &hub,
        &netplay_config(0, 0),
        Rules::Versus,
        DesyncDetection::Off,
        (host, client),
    )
}

fn assert_stopped(peer: &Peer, reason: &str) {
    assert!(peer.error.is_none(), "{peer:?}");
    assert_eq!(peer.session.lifecycle(), Lifecycle::Stopped);
    assert_eq!(peer.error_events(), vec![reason.to_owned()]);
    assert!(matches!(peer.events.last(), Some(NetplayEvent::Stopped)));
    assert!(peer.session.data_peer().is_none());
}

#[test]
fn severed_match_stops_both_peers() {
    let (mut host, mut client) = versus_pair(
        ScriptedHost::new(Script::Versus, 0),
        ScriptedHost::new(Script::Versus, 1),
    );
    run_until(&mut [&mut host, &mut client], |peers| {
        peers.iter().any(|p| p.is_done())
            || peers
                .iter()
                .all(|p| p.session.current_frame() >= IndexedFrame::new(20, 5))
    });
    assert_eq!(host.state(), NetplayState::InGame);

    host.probe.sever();
    settle(&mut [&mut host, &mut client], 3);

    assert_stopped(&host, "Disconnected!");
    assert_stopped(&client, "Disconnected!");
}

#[test]
fn stopped_session_ignores_further_frames() {
    let (mut host, mut client) = versus_pair(
        ScriptedHost::new(Script::Versus, 0),
        ScriptedHost::new(Script::Versus, 1),
    );
    host.probe.sever();
    settle(&mut [&mut host, &mut client], 3);
    assert_eq!(client.session.lifecycle(), Lifecycle::Stopped);

    let sent = client.probe.sent_count();
    let frame = client.session.current_frame();
    assert_eq!(
        client.session.advance_frame(LocalInputs::default()),
        Ok(FrameStatus::Stopped)
    );
    client
        .session
        .handle_control(ControlMessage::ErrorMessage {
            text: "again".to_owned(),
        })
        .unwrap();
    assert_eq!(client.session.current_frame(), frame);
    assert_eq!(client.probe.sent_count(), sent);
    assert_eq!(client.session.events().count(), 0);
}

#[test]
fn disconnect_after_game_over_waits_for_the_retry_menu() {
    let (mut host, mut client) = versus_pair(
        ScriptedHost::new(Script::Versus, 0).with_menu_choice(0),
        ScriptedHost::new(Script::Versus, 1).with_menu_choice(0),
    );
    run_until(&mut [&mut host, &mut client], |peers| {
        peers.iter().any(|p| p.is_done())
            || peers.iter().all(|p| p.state() == NetplayState::RetryMenu)
    });
    assert!(host.session.is_game_over());

    client.probe.sever();
    settle(&mut [&mut host, &mut client], 3);
    // The menu stays usable without the remote peer.
    for peer in [&host, &client] {
        assert_eq!(peer.session.lifecycle(), Lifecycle::Running);
        assert!(peer.error_events().is_empty());
    }

    run_until(&mut [&mut host, &mut client], |peers| {
        peers.iter().all(|p| p.is_done())
    });
    for peer in [&host, &client] {
        assert_eq!(peer.state(), NetplayState::RetryMenu);
        assert_stopped(peer, "Disconnected!");
    }
}

#[test]
fn error_message_from_the_orchestrator_stops_the_session() {
    let (mut host, mut client) = versus_pair(
        ScriptedHost::new(Script::Versus, 0),
        ScriptedHost::new(Script::Versus, 1),
    );
    host.control(ControlMessage::ErrorMessage {
        text: "bye".to_owned(),
    });
    assert_eq!(host.session.lifecycle(), Lifecycle::Stopping);
    settle(&mut [&mut host, &mut client], 3);

    assert_stopped(&host, "bye");
    assert_stopped(&client, "Disconnected!");
}
