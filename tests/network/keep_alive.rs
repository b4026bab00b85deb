//! Sessions whose transport is serviced from a background thread.
//!
//! These tests spawn threads and sleep, so they run one at a time.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::SocketAddr;

use fortress_netplay::network::keep_alive::KeepAlive;
use fortress_netplay::network::loopback::LoopbackHub;
use fortress_netplay::{
    ClientMode, ControlMessage, DesyncDetection, IndexedFrame, NetplayState, Role,
};
use serial_test::serial;
use web_time::Duration;

use crate::common::harness::{
    builder, common_frames, init_logging, loopback, netplay_config, run_until, settle, Peer,
    HOST_PORT,
};
use crate::common::host::{Script, ScriptedHost};

const DETECTION: DesyncDetection = DesyncDetection::On { interval: 60 };

/// A training pair whose host talks through a started [`KeepAlive`].
fn kept_alive_pair(hub: &LoopbackHub) -> (Peer, Peer) {
    init_logging();
    let endpoint = hub.endpoint();
    let probe = endpoint.probe();
    let mut keep_alive: KeepAlive<SocketAddr> =
        KeepAlive::new(endpoint).with_interval(Duration::from_millis(1));
    keep_alive.start().unwrap();
    assert!(keep_alive.is_running());

    let mut host = Peer::with_transport(
        "host",
        keep_alive,
        probe,
        builder(ClientMode::new(Role::Host, true), DETECTION),
        ScriptedHost::new(Script::Training, 0),
    );
    let mut client = Peer::new(
        "client",
        hub,
        builder(ClientMode::new(Role::Client, true), DETECTION),
        ScriptedHost::new(Script::Training, 1),
    );
    let config = netplay_config(1, 0);
    host.control(ControlMessage::IpAddrPort(loopback(HOST_PORT)));
    host.control(ControlMessage::NetplayConfig(config.clone()));
    client.control(ControlMessage::IpAddrPort(loopback(HOST_PORT)));
    client.control(ControlMessage::NetplayConfig(config));
    settle(&mut [&mut host, &mut client], 3);
    (host, client)
}

fn assert_in_step(host: &Peer, client: &Peer, min: usize) {
    for peer in [host, client] {
        assert!(peer.error.is_none(), "{peer:?}");
        assert!(peer.error_events().is_empty(), "{:?}", peer.error_events());
    }
    let frames = common_frames(host, client, 4);
    assert!(frames.len() >= min, "only {} common frames", frames.len());
    for (at, host_rng, client_rng) in frames {
        assert_eq!(host_rng, client_rng, "diverged at {at}");
    }
}

#[test]
#[serial]
fn match_over_a_kept_alive_transport_stays_in_step() {
    let hub = LoopbackHub::new();
    let (mut host, mut client) = kept_alive_pair(&hub);
    run_until(&mut [&mut host, &mut client], |peers| {
        peers.iter().any(|p| p.is_done())
            || peers
                .iter()
                .all(|p| p.session.current_frame() >= IndexedFrame::new(60, 4))
    });
    assert_eq!(host.state(), NetplayState::InGame);
    assert_in_step(&host, &client, 60);
}

#[test]
#[serial]
fn traffic_during_a_host_stall_is_delivered_afterwards() {
    let hub = LoopbackHub::new();
    let (mut host, mut client) = kept_alive_pair(&hub);
    run_until(&mut [&mut host, &mut client], |peers| {
        peers.iter().any(|p| p.is_done())
            || peers
                .iter()
                .all(|p| p.session.current_frame() >= IndexedFrame::new(10, 4))
    });

    // The host loop blocks while the client keeps running and sending.
    let stalled_at = host.session.current_frame();
    for _ in 0..50 {
        client.turn();
    }
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert_eq!(host.session.current_frame(), stalled_at);

    run_until(&mut [&mut host, &mut client], |peers| {
        peers.iter().any(|p| p.is_done())
            || peers
                .iter()
                .all(|p| p.session.current_frame() >= IndexedFrame::new(90, 4))
    });
    assert_in_step(&host, &client, 80);
}
