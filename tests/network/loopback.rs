//! Loopback transport behaviour seen from several endpoints at once.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::ip_constant
)]

use std::net::SocketAddr;

use fortress_netplay::network::loopback::{LoopbackHub, LoopbackTransport};
use fortress_netplay::{
    Channel, IndexedFrame, IpAddrPort, NetplayMessage, Transport, TransportEvent,
};
use web_time::Duration;

use crate::common::harness::loopback;

fn accepted(endpoint: &mut LoopbackTransport) -> Vec<(Channel, SocketAddr)> {
    endpoint
        .poll(Duration::ZERO)
        .into_iter()
        .filter_map(|event| match event {
            TransportEvent::Accepted { channel, peer } => Some((channel, peer)),
            _ => None,
        })
        .collect()
}

fn received(endpoint: &mut LoopbackTransport) -> Vec<(Channel, SocketAddr, NetplayMessage)> {
    endpoint
        .poll(Duration::ZERO)
        .into_iter()
        .filter_map(|event| match event {
            TransportEvent::Received { channel, from, msg } => Some((channel, from, msg)),
            _ => None,
        })
        .collect()
}

fn inputs(frame: u32) -> NetplayMessage {
    NetplayMessage::PlayerInputs {
        start: IndexedFrame::new(frame, 4),
        inputs: vec![0x10, 0x20],
    }
}

#[test]
fn each_connection_gets_its_own_address() {
    let hub = LoopbackHub::new();
    let mut host = hub.endpoint();
    let mut first = hub.endpoint();
    let mut second = hub.endpoint();
    let port = host.listen(Channel::Control, 0).unwrap();

    let first_to_host = first.connect(Channel::Control, &loopback(port)).unwrap();
    let second_to_host = second.connect(Channel::Control, &loopback(port)).unwrap();
    assert_ne!(first_to_host, second_to_host);

    let peers = accepted(&mut host);
    assert_eq!(peers.len(), 2);
    assert_ne!(peers[0].1, peers[1].1);

    host.send(
        Channel::Control,
        &peers[1].1,
        &NetplayMessage::ErrorMessage {
            text: "second only".to_owned(),
        },
    )
    .unwrap();
    assert!(received(&mut first).is_empty());
    let got = received(&mut second);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1, second_to_host);
}

#[test]
fn refused_connection_reports_the_target_port() {
    let hub = LoopbackHub::new();
    let mut client = hub.endpoint();
    let peer = client.connect(Channel::Data, &loopback(4321)).unwrap();
    assert_eq!(peer.port(), 4321);
    assert_eq!(
        client.poll(Duration::ZERO),
        vec![TransportEvent::Disconnected {
            channel: Channel::Data,
            peer
        }]
    );
    assert!(client.send(Channel::Data, &peer, &inputs(0)).is_err());
}

#[test]
fn the_same_port_can_serve_both_channels() {
    let hub = LoopbackHub::new();
    let mut host = hub.endpoint();
    let mut client = hub.endpoint();
    host.listen(Channel::Control, 7600).unwrap();
    host.listen(Channel::Data, 7600).unwrap();

    let control = client.connect(Channel::Control, &loopback(7600)).unwrap();
    let data = client.connect(Channel::Data, &loopback(7600)).unwrap();
    assert_ne!(control, data);

    let mut channels: Vec<Channel> = accepted(&mut host).into_iter().map(|(c, _)| c).collect();
    channels.sort();
    assert_eq!(channels, vec![Channel::Control, Channel::Data]);
    assert!(client.send(Channel::Data, &control, &inputs(0)).is_err());
    assert!(client.send(Channel::Control, &control, &inputs(0)).is_ok());
}

#[test]
fn holding_data_keeps_control_traffic_flowing() {
    let hub = LoopbackHub::new();
    let mut host = hub.endpoint();
    let mut client = hub.endpoint();
    host.listen(Channel::Control, 7601).unwrap();
    host.listen(Channel::Data, 7601).unwrap();
    let control = client.connect(Channel::Control, &loopback(7601)).unwrap();
    let data = client.connect(Channel::Data, &loopback(7601)).unwrap();
    host.poll(Duration::ZERO);

    let probe = client.probe();
    probe.hold_data();
    for frame in 0..3 {
        client.send(Channel::Data, &data, &inputs(frame)).unwrap();
    }
    client
        .send(Channel::Control, &control, &NetplayMessage::ConfirmConfig)
        .unwrap();

    let got = received(&mut host);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, Channel::Control);

    probe.release();
    let got: Vec<NetplayMessage> = received(&mut host).into_iter().map(|(_, _, m)| m).collect();
    assert_eq!(got, vec![inputs(0), inputs(1), inputs(2)]);
    assert_eq!(probe.sent_count(), 4);
}

#[test]
fn severed_channel_leaves_the_other_one_up() {
    let hub = LoopbackHub::new();
    let mut host = hub.endpoint();
    let mut client = hub.endpoint();
    host.listen(Channel::Control, 7602).unwrap();
    host.listen(Channel::Data, 7602).unwrap();
    let control = client.connect(Channel::Control, &loopback(7602)).unwrap();
    let data = client.connect(Channel::Data, &loopback(7602)).unwrap();
    host.poll(Duration::ZERO);
    client.poll(Duration::ZERO);

    client.probe().sever_channel(Channel::Data);
    assert!(matches!(
        host.poll(Duration::ZERO).as_slice(),
        [TransportEvent::Disconnected {
            channel: Channel::Data,
            ..
        }]
    ));
    assert!(matches!(
        client.poll(Duration::ZERO).as_slice(),
        [TransportEvent::Disconnected {
            channel: Channel::Data,
            peer,
        }] if *peer == data
    ));
    assert!(client.send(Channel::Data, &data, &inputs(0)).is_err());
    client
        .send(Channel::Control, &control, &NetplayMessage::ConfirmConfig)
        .unwrap();
    assert_eq!(received(&mut host).len(), 1);
}

#[test]
fn listener_survives_a_severed_endpoint() {
    let hub = LoopbackHub::new();
    let mut host = hub.endpoint();
    let mut client = hub.endpoint();
    host.listen(Channel::Data, 7603).unwrap();
    client.connect(Channel::Data, &loopback(7603)).unwrap();
    host.poll(Duration::ZERO);

    host.probe().sever();
    host.poll(Duration::ZERO);
    client.poll(Duration::ZERO);

    let again = client.connect(Channel::Data, &loopback(7603)).unwrap();
    assert_eq!(accepted(&mut host).len(), 1);
    client.send(Channel::Data, &again, &inputs(7)).unwrap();
    let got = received(&mut host);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].2, inputs(7));
}

#[test]
fn disconnecting_an_unknown_peer_does_nothing() {
    let hub = LoopbackHub::new();
    let mut host = hub.endpoint();
    let mut client = hub.endpoint();
    host.listen(Channel::Data, 7604).unwrap();
    let to_host = client.connect(Channel::Data, &loopback(7604)).unwrap();
    host.poll(Duration::ZERO);
    client.poll(Duration::ZERO);

    client.disconnect(Channel::Data, &SocketAddr::from(([127, 0, 0, 1], 1)));
    // Wrong channel for an existing connection.
    client.disconnect(Channel::Control, &to_host);
    assert!(host.poll(Duration::ZERO).is_empty());
    client.send(Channel::Data, &to_host, &inputs(1)).unwrap();
    assert_eq!(received(&mut host).len(), 1);
}

#[test]
fn sent_log_records_the_addressee() {
    let hub = LoopbackHub::new();
    let mut host = hub.endpoint();
    let mut client = hub.endpoint();
    let port = host.listen(Channel::Data, 0).unwrap();
    let to_host = client
        .connect(Channel::Data, &IpAddrPort::new("127.0.0.1", port))
        .unwrap();
    let probe = client.probe();
    client.send(Channel::Data, &to_host, &inputs(3)).unwrap();

    let sent = probe.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, to_host);
    assert_eq!(sent[0].channel, Channel::Data);
    assert_eq!(sent[0].msg, inputs(3));

    probe.clear_sent();
    assert_eq!(probe.sent_count(), 0);
}
