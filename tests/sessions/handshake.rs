//! Connection handshakes: the netplay data channel and the spectator control channel.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::ip_constant
)]

use std::sync::Arc;

use crate::common::harness::{
    broadcaster, builder, connect_netplay, init_logging, loopback, netplay_config, netplay_pair,
    reported_port, settle, spectator, test_timing, Peer, Rules, HOST_PORT,
};
use crate::common::host::{Script, ScriptedHost};
use fortress_netplay::network::loopback::LoopbackHub;
use fortress_netplay::telemetry::{CollectingObserver, ViolationKind};
use fortress_netplay::{
    Channel, ClientMode, ControlMessage, DesyncDetection, IndexedFrame, InitialMode, Lifecycle,
    NetplayError, NetplayEvent, NetplayMessage, NetplayState, Role, TimingConfig, Transport,
    TransportEvent, Version,
};
use web_time::Duration;

fn versus_host(salt: u32) -> ScriptedHost {
    ScriptedHost::new(Script::Versus, salt)
}

// ============================================================================
// Netplay Data Channel
// ============================================================================

#[test]
fn pair_connects_and_confirms_configs() {
    let hub = LoopbackHub::new();
    let (host, client) = netplay_pair(
        &hub,
        &netplay_config(1, 0),
        Rules::Versus,
        DesyncDetection::Off,
        (versus_host(0), versus_host(1)),
    );

    for peer in [&host, &client] {
        assert!(peer.error.is_none(), "{peer:?}");
        assert_eq!(peer.state(), NetplayState::Initial);
        assert_eq!(peer.session.current_frame(), IndexedFrame::start_of(1));
        assert!(peer.session.data_peer().is_some());
        assert!(peer.session.is_remote_config_confirmed());
        assert!(peer
            .events
            .iter()
            .any(|event| matches!(event, NetplayEvent::DataConnected { .. })));
        let settings = peer.host.with_state(|s| s.match_settings.clone());
        assert_eq!(settings.map(|c| c.delay), Some(1));
    }
    assert_eq!(host.session.input_sync().remote_player().get(), 2);
    assert_eq!(client.session.input_sync().remote_player().get(), 1);
}

#[test]
fn pair_starts_fast_forwarded() {
    let hub = LoopbackHub::new();
    let (host, client) = netplay_pair(
        &hub,
        &netplay_config(0, 0),
        Rules::Versus,
        DesyncDetection::Off,
        (versus_host(0), versus_host(1)),
    );
    assert!(host.host.with_state(|s| s.fast_forward));
    assert!(client.host.with_state(|s| s.fast_forward));
}

#[test]
fn client_retries_until_host_listens() {
    init_logging();
    let hub = LoopbackHub::new();
    let config = netplay_config(0, 0);

    let mut client = Peer::new(
        "client",
        &hub,
        builder(ClientMode::client(), DesyncDetection::Off),
        versus_host(1),
    );
    client.control(ControlMessage::IpAddrPort(loopback(HOST_PORT)));
    client.control(ControlMessage::NetplayConfig(config.clone()));
    settle(&mut [&mut client], 5);
    assert_eq!(client.state(), NetplayState::PreInitial);
    assert!(client.session.data_peer().is_none());
    assert!(client.error.is_none());

    let mut host = Peer::new(
        "host",
        &hub,
        builder(ClientMode::host(), DesyncDetection::Off),
        versus_host(0),
    );
    host.control(ControlMessage::IpAddrPort(loopback(HOST_PORT)));
    host.control(ControlMessage::NetplayConfig(config));
    settle(&mut [&mut host, &mut client], 4);

    assert_eq!(host.state(), NetplayState::Initial);
    assert_eq!(client.state(), NetplayState::Initial);
    assert!(host.session.is_remote_config_confirmed());
    assert!(client.session.is_remote_config_confirmed());
}

#[test]
fn mismatched_delay_terminates_both_peers() {
    let hub = LoopbackHub::new();
    let (mut host, mut client) = connect_netplay(
        &hub,
        (&netplay_config(0, 0), &netplay_config(2, 0)),
        Rules::Versus,
        DesyncDetection::Off,
        (versus_host(0), versus_host(1)),
    );

    for peer in [&mut host, &mut client] {
        assert_eq!(
            peer.error,
            Some(NetplayError::ConfigMismatch { field: "delay" }),
            "{peer:?}"
        );
        assert_eq!(peer.session.lifecycle(), Lifecycle::Terminated);
        assert!(!peer.session.is_remote_config_confirmed());
        assert_eq!(peer.session.poll(), Err(NetplayError::SessionTerminated));
    }
}

#[test]
fn host_without_client_times_out() {
    init_logging();
    let hub = LoopbackHub::new();
    let timing = TimingConfig {
        initial_connect_timeout: Duration::ZERO,
        ..test_timing()
    };
    let mut host = Peer::new(
        "host",
        &hub,
        builder(ClientMode::host(), DesyncDetection::Off).with_timing(timing),
        versus_host(0),
    );
    host.control(ControlMessage::IpAddrPort(loopback(HOST_PORT)));
    host.control(ControlMessage::NetplayConfig(netplay_config(0, 0)));
    settle(&mut [&mut host], 3);

    assert_eq!(host.session.lifecycle(), Lifecycle::Stopped);
    assert_eq!(host.error_events(), vec!["Timed out!".to_owned()]);
    assert_eq!(host.events.last(), Some(&NetplayEvent::Stopped));
    assert!(host.error.is_none());
}

#[test]
fn repeated_control_messages_are_ignored() {
    init_logging();
    let hub = LoopbackHub::new();
    let observer = Arc::new(CollectingObserver::new());
    let mut host = Peer::new(
        "host",
        &hub,
        builder(ClientMode::host(), DesyncDetection::Off).with_violation_observer(observer.clone()),
        versus_host(0),
    );
    host.control(ControlMessage::IpAddrPort(loopback(HOST_PORT)));
    host.control(ControlMessage::IpAddrPort(loopback(HOST_PORT + 1)));
    host.control(ControlMessage::NetplayConfig(netplay_config(0, 0)));
    host.control(ControlMessage::NetplayConfig(netplay_config(3, 0)));
    host.control(ControlMessage::ClientMode(ClientMode::client()));

    assert!(host.error.is_none());
    assert_eq!(host.session.config().map(|c| c.delay), Some(0));
    assert!(host.session.client_mode().is_host());
    let ignored = observer
        .violations()
        .iter()
        .filter(|v| v.kind == ViolationKind::Configuration)
        .count();
    assert_eq!(ignored, 3);
}

#[test]
fn netplay_config_adopts_its_mode_when_none_was_set() {
    init_logging();
    let hub = LoopbackHub::new();
    let mut session = Peer::new(
        "offline",
        &hub,
        fortress_netplay::SessionBuilder::new().with_timing(test_timing()),
        versus_host(0),
    );
    let config = fortress_netplay::NetplayConfig {
        mode: ClientMode::new(Role::Offline, true),
        ..netplay_config(0, 0)
    };
    session.control(ControlMessage::NetplayConfig(config));

    assert_eq!(session.session.client_mode(), ClientMode::new(Role::Offline, true));
    assert_eq!(session.state(), NetplayState::Initial);
}

#[test]
fn unset_delay_is_rejected() {
    init_logging();
    let hub = LoopbackHub::new();
    let mut host = Peer::new(
        "host",
        &hub,
        builder(ClientMode::host(), DesyncDetection::Off),
        versus_host(0),
    );
    host.control(ControlMessage::NetplayConfig(netplay_config(
        fortress_netplay::sessions::config::INVALID_DELAY,
        0,
    )));
    assert!(matches!(
        host.error,
        Some(NetplayError::InvalidHostConfig { .. })
    ));
    assert_eq!(host.session.lifecycle(), Lifecycle::Terminated);
}

#[test]
fn port_already_in_use_terminates_without_applying_the_config() {
    init_logging();
    let hub = LoopbackHub::new();
    let mut first = Peer::new(
        "first",
        &hub,
        builder(ClientMode::host(), DesyncDetection::Off),
        versus_host(0),
    );
    let mut second = Peer::new(
        "second",
        &hub,
        builder(ClientMode::host(), DesyncDetection::Off),
        versus_host(1),
    );
    for peer in [&mut first, &mut second] {
        peer.control(ControlMessage::IpAddrPort(loopback(HOST_PORT)));
        peer.control(ControlMessage::NetplayConfig(netplay_config(2, 0)));
    }

    assert!(first.error.is_none(), "{first:?}");
    assert!(first.session.config().is_some());

    assert!(matches!(second.error, Some(NetplayError::SocketError { .. })));
    assert_eq!(second.session.lifecycle(), Lifecycle::Terminated);
    assert_eq!(second.error_events().len(), 1);
    assert!(second.session.config().is_none());
    assert!(second.host.with_state(|s| s.match_settings.is_none()));
    assert_eq!(second.session.poll(), Err(NetplayError::SessionTerminated));
}

// ============================================================================
// Spectator Control Channel
// ============================================================================

#[test]
fn spectator_joining_before_character_select_starts_with_next_instance() {
    let hub = LoopbackHub::new();
    let (mut caster, port) = broadcaster(&hub, true, ScriptedHost::new(Script::Training, 0));
    assert_eq!(caster.state(), NetplayState::Initial);

    let mut watcher = spectator(&hub, port, ScriptedHost::new(Script::Training, 0));
    settle(&mut [&mut caster, &mut watcher], 6);

    let start = IndexedFrame::start_of(2);
    assert_eq!(caster.session.num_spectators(), 1);
    assert!(caster
        .events
        .iter()
        .any(|event| matches!(event, NetplayEvent::SpectatorJoined { pos, .. } if *pos == start)));
    let initial = caster.sent(|msg| matches!(msg, NetplayMessage::InitialGameState { .. }));
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].channel, Channel::Control);
    assert_eq!(
        initial[0].msg,
        NetplayMessage::InitialGameState {
            training: true,
            mode: InitialMode::CharaSelect,
            start,
        }
    );

    assert!(watcher.error.is_none(), "{watcher:?}");
    assert_eq!(watcher.state(), NetplayState::Initial);
    let config = watcher.session.spectate_config().cloned().unwrap();
    assert_eq!(config.initial.mode, InitialMode::CharaSelect);
    assert_eq!(config.session_id, "test-session");
    assert!(watcher.host.with_state(|s| s.initial.is_some()));
    assert!(watcher.session.client_mode().training);
}

#[test]
fn spectator_with_incompatible_version_is_refused() {
    let hub = LoopbackHub::new();
    let (mut caster, port) = broadcaster(&hub, false, ScriptedHost::new(Script::Versus, 0));

    let mut watcher = Peer::new(
        "spectator",
        &hub,
        builder(ClientMode::spectate(), DesyncDetection::Off).with_version(Version::new("99.0", "", "")),
        ScriptedHost::new(Script::Versus, 0),
    );
    watcher.control(ControlMessage::IpAddrPort(loopback(port)));
    settle(&mut [&mut caster, &mut watcher], 4);

    assert!(matches!(
        watcher.error,
        Some(NetplayError::IncompatibleVersion { .. })
    ));
    assert_eq!(watcher.session.lifecycle(), Lifecycle::Terminated);
    assert!(caster.error.is_none());
    assert_eq!(caster.session.num_spectators(), 0);
    assert!(caster
        .sent(|msg| matches!(msg, NetplayMessage::SpectateConfig(_)))
        .is_empty());
}

#[test]
fn silent_spectator_is_dropped_after_pending_timeout() {
    init_logging();
    let hub = LoopbackHub::new();
    let timing = TimingConfig {
        pending_spectator_timeout: Duration::ZERO,
        ..test_timing()
    };
    let mut caster = Peer::new(
        "broadcaster",
        &hub,
        builder(ClientMode::new(Role::Broadcast, false), DesyncDetection::Off).with_timing(timing),
        ScriptedHost::new(Script::Versus, 0),
    );
    caster.control(ControlMessage::NetplayConfig(netplay_config(0, 0)));
    let port = reported_port(&caster);

    let mut raw = hub.endpoint();
    let to_caster = raw.connect(Channel::Control, &loopback(port)).unwrap();
    settle(&mut [&mut caster], 1);

    let events = raw.poll(Duration::ZERO);
    assert!(matches!(events[0], TransportEvent::Connected { .. }));
    assert!(matches!(
        &events[1],
        TransportEvent::Received { msg: NetplayMessage::VersionConfig { .. }, .. }
    ));
    assert_eq!(
        events[2],
        TransportEvent::Disconnected {
            channel: Channel::Control,
            peer: to_caster,
        }
    );
    assert_eq!(caster.session.num_spectators(), 0);
    assert!(caster.error.is_none());
}

#[test]
fn version_outside_a_handshake_is_reported() {
    init_logging();
    let hub = LoopbackHub::new();
    let observer = Arc::new(CollectingObserver::new());
    let mut caster = Peer::new(
        "broadcaster",
        &hub,
        builder(ClientMode::broadcast(), DesyncDetection::Off).with_violation_observer(observer.clone()),
        ScriptedHost::new(Script::Versus, 0),
    );
    caster.control(ControlMessage::NetplayConfig(netplay_config(0, 0)));
    let port = reported_port(&caster);

    let mut raw = hub.endpoint();
    let to_caster = raw.connect(Channel::Control, &loopback(port)).unwrap();
    settle(&mut [&mut caster], 1);
    let hello = NetplayMessage::VersionConfig {
        version: Version::current(),
        mode: ClientMode::spectate(),
    };
    raw.send(Channel::Control, &to_caster, &hello).unwrap();
    settle(&mut [&mut caster], 1);
    assert_eq!(
        caster.sent(|msg| matches!(msg, NetplayMessage::SpectateConfig(_))).len(),
        1
    );

    raw.send(Channel::Control, &to_caster, &NetplayMessage::ConfirmConfig)
        .unwrap();
    settle(&mut [&mut caster], 1);
    assert_eq!(caster.session.num_spectators(), 1);

    raw.send(Channel::Control, &to_caster, &hello).unwrap();
    settle(&mut [&mut caster], 1);
    assert!(observer
        .violations()
        .iter()
        .any(|v| v.kind == ViolationKind::Spectator));
}
