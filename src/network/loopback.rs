//! In-process [`Transport`] for tests, demos and local matches.
//!
//! A [`LoopbackHub`] plays the network: every [`LoopbackTransport`] created from it can
//! listen on ports and connect to the other endpoints. Messages go through the wire codec
//! on the way, so anything that would not survive encoding fails here too.
//!
//! Each connection end gets its own `127.0.0.1` address. Peers are identified by the
//! address of the *remote* end, like accepted TCP sockets.
//!
//! # Example
//!
//! ```
//! use fortress_netplay::network::loopback::LoopbackHub;
//! use fortress_netplay::{Channel, IpAddrPort, NetplayMessage, Transport, TransportEvent};
//! use web_time::Duration;
//!
//! let hub = LoopbackHub::new();
//! let mut host = hub.endpoint();
//! let mut client = hub.endpoint();
//!
//! let port = host.listen(Channel::Data, 0).unwrap();
//! let peer = client.connect(Channel::Data, &IpAddrPort::new("127.0.0.1", port)).unwrap();
//! client.send(Channel::Data, &peer, &NetplayMessage::ConfirmConfig).unwrap();
//!
//! let events = host.poll(Duration::ZERO);
//! assert!(matches!(events[0], TransportEvent::Accepted { .. }));
//! assert!(matches!(events[1], TransportEvent::Received { .. }));
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use web_time::Duration;

use crate::network::codec;
use crate::network::control::IpAddrPort;
use crate::network::messages::NetplayMessage;
use crate::{Channel, NetplayError, Transport, TransportEvent};

/// First port handed out for connection ends and `listen(_, 0)`.
const FIRST_EPHEMERAL_PORT: u16 = 40000;

type EndpointId = u32;

/// Something waiting in an endpoint's inbox.
#[derive(Debug)]
enum Pending {
    Event(TransportEvent<SocketAddr>),
    /// Encoded message, decoded on poll.
    Bytes {
        channel: Channel,
        from: SocketAddr,
        bytes: Vec<u8>,
    },
}

/// One end of an established connection.
#[derive(Debug, Clone, Copy)]
struct ConnEnd {
    owner: EndpointId,
    channel: Channel,
    /// Address of the other end.
    peer: SocketAddr,
}

#[derive(Debug, Default)]
struct HubState {
    next_id: EndpointId,
    next_port: u16,
    listeners: BTreeMap<(Channel, u16), EndpointId>,
    /// Keyed by the address of the end.
    ends: BTreeMap<SocketAddr, ConnEnd>,
    inboxes: BTreeMap<EndpointId, VecDeque<Pending>>,
    sent: BTreeMap<EndpointId, Vec<SentMessage>>,
    /// Endpoints whose outgoing data channel traffic is held back.
    holding: BTreeMap<EndpointId, Vec<(SocketAddr, Pending)>>,
}

impl HubState {
    fn allocate_port(&mut self) -> u16 {
        if self.next_port < FIRST_EPHEMERAL_PORT {
            self.next_port = FIRST_EPHEMERAL_PORT;
        }
        while self.listeners.keys().any(|(_, port)| *port == self.next_port)
            || self.ends.contains_key(&local_addr(self.next_port))
        {
            self.next_port = self.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
        }
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
        port
    }

    fn deliver(&mut self, to: EndpointId, pending: Pending) {
        self.inboxes.entry(to).or_default().push_back(pending);
    }

    /// Removes the connection `end` belongs to, notifying the owner of `end` and/or the
    /// owner of the other end.
    fn close(&mut self, end: SocketAddr, notify_owner: bool, notify_peer: bool) {
        let Some(this) = self.ends.remove(&end) else {
            return;
        };
        let other = self.ends.remove(&this.peer);
        if notify_owner {
            self.deliver(
                this.owner,
                Pending::Event(TransportEvent::Disconnected {
                    channel: this.channel,
                    peer: this.peer,
                }),
            );
        }
        if let Some(other) = other.filter(|_| notify_peer) {
            self.deliver(
                other.owner,
                Pending::Event(TransportEvent::Disconnected {
                    channel: other.channel,
                    peer: end,
                }),
            );
        }
    }
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// A message an endpoint sent, as recorded by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    /// Channel it was sent on.
    pub channel: Channel,
    /// Recipient, as the sender addressed it.
    pub to: SocketAddr,
    /// The message.
    pub msg: NetplayMessage,
}

/// The simulated network shared by all loopback endpoints.
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new endpoint on this network.
    #[must_use]
    pub fn endpoint(&self) -> LoopbackTransport {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.inboxes.insert(id, VecDeque::new());
        LoopbackTransport {
            id,
            state: Arc::clone(&self.state),
        }
    }
}

/// A [`Transport`] endpoint on a [`LoopbackHub`].
#[derive(Debug)]
pub struct LoopbackTransport {
    id: EndpointId,
    state: Arc<Mutex<HubState>>,
}

impl LoopbackTransport {
    /// A handle for inspecting and disturbing this endpoint after it was handed to a
    /// session.
    #[must_use]
    pub fn probe(&self) -> LoopbackProbe {
        LoopbackProbe {
            id: self.id,
            state: Arc::clone(&self.state),
        }
    }
}

impl Transport<SocketAddr> for LoopbackTransport {
    fn listen(&mut self, channel: Channel, port: u16) -> Result<u16, NetplayError> {
        let mut state = self.state.lock();
        let port = if port == 0 {
            state.allocate_port()
        } else {
            port
        };
        if let Some(owner) = state.listeners.get(&(channel, port)) {
            if *owner != self.id {
                return Err(NetplayError::SocketError {
                    context: format!("{channel:?} port {port} is already in use"),
                });
            }
        }
        state.listeners.insert((channel, port), self.id);
        tracing::debug!(endpoint = self.id, ?channel, port, "listening");
        Ok(port)
    }

    fn connect(&mut self, channel: Channel, target: &IpAddrPort) -> Result<SocketAddr, NetplayError> {
        let mut state = self.state.lock();
        let local = local_addr(state.allocate_port());
        let Some(&listener) = state.listeners.get(&(channel, target.port)) else {
            // Nobody listening: the attempt fails asynchronously, like a refused socket.
            let peer = local_addr(target.port);
            state.deliver(
                self.id,
                Pending::Event(TransportEvent::Disconnected { channel, peer }),
            );
            return Ok(peer);
        };
        let remote = local_addr(state.allocate_port());
        state.ends.insert(
            local,
            ConnEnd {
                owner: self.id,
                channel,
                peer: remote,
            },
        );
        state.ends.insert(
            remote,
            ConnEnd {
                owner: listener,
                channel,
                peer: local,
            },
        );
        state.deliver(
            self.id,
            Pending::Event(TransportEvent::Connected {
                channel,
                peer: remote,
            }),
        );
        state.deliver(
            listener,
            Pending::Event(TransportEvent::Accepted {
                channel,
                peer: local,
            }),
        );
        Ok(remote)
    }

    fn send(&mut self, channel: Channel, to: &SocketAddr, msg: &NetplayMessage) -> Result<(), NetplayError> {
        let mut state = self.state.lock();
        let Some(end) = state.ends.get(to).copied() else {
            return Err(NetplayError::SocketError {
                context: format!("{to} is not connected"),
            });
        };
        if end.channel != channel {
            return Err(NetplayError::SocketError {
                context: format!("{to} is a {:?} connection, not {channel:?}", end.channel),
            });
        }
        let bytes = codec::encode_message(msg)?;
        state.sent.entry(self.id).or_default().push(SentMessage {
            channel,
            to: *to,
            msg: msg.clone(),
        });
        let pending = Pending::Bytes {
            channel,
            from: end.peer,
            bytes,
        };
        if channel == Channel::Data {
            if let Some(held) = state.holding.get_mut(&self.id) {
                held.push((*to, pending));
                return Ok(());
            }
        }
        state.deliver(end.owner, pending);
        Ok(())
    }

    fn disconnect(&mut self, channel: Channel, peer: &SocketAddr) {
        let mut state = self.state.lock();
        let Some(remote) = state.ends.get(peer).copied() else {
            return;
        };
        if remote.channel != channel {
            return;
        }
        tracing::debug!(endpoint = self.id, %peer, "disconnecting");
        // `peer` is the remote end: its owner is told, the caller is not.
        state.close(*peer, true, false);
    }

    fn poll(&mut self, _timeout: Duration) -> Vec<TransportEvent<SocketAddr>> {
        let pending: Vec<Pending> = {
            let mut state = self.state.lock();
            state
                .inboxes
                .get_mut(&self.id)
                .map(|inbox| inbox.drain(..).collect())
                .unwrap_or_default()
        };
        let mut events = Vec::with_capacity(pending.len());
        for item in pending {
            match item {
                Pending::Event(event) => events.push(event),
                Pending::Bytes {
                    channel,
                    from,
                    bytes,
                } => match codec::decode_message(&bytes) {
                    Ok(msg) => events.push(TransportEvent::Received { channel, from, msg }),
                    Err(err) => tracing::warn!(%from, %err, "dropping undecodable message"),
                },
            }
        }
        events
    }
}

/// Inspection and fault injection for one [`LoopbackTransport`].
#[derive(Debug, Clone)]
pub struct LoopbackProbe {
    id: EndpointId,
    state: Arc<Mutex<HubState>>,
}

impl LoopbackProbe {
    /// Everything the endpoint sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.get(&self.id).cloned().unwrap_or_default()
    }

    /// Number of messages the endpoint sent so far.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.get(&self.id).map_or(0, Vec::len)
    }

    /// Forgets the sent log.
    pub fn clear_sent(&self) {
        self.state.lock().sent.remove(&self.id);
    }

    /// Holds back outgoing data channel messages until [`release`](Self::release).
    pub fn hold_data(&self) {
        self.state.lock().holding.entry(self.id).or_default();
    }

    /// Delivers held data channel messages and stops holding.
    pub fn release(&self) {
        let mut state = self.state.lock();
        let Some(held) = state.holding.remove(&self.id) else {
            return;
        };
        for (to, pending) in held {
            if let Some(end) = state.ends.get(&to).copied() {
                state.deliver(end.owner, pending);
            }
        }
    }

    /// Drops every connection of the endpoint, as if its network cable was pulled. Both
    /// sides see a disconnect. Listeners stay up.
    pub fn sever(&self) {
        let mut state = self.state.lock();
        let mine: Vec<SocketAddr> = state
            .ends
            .iter()
            .filter(|(_, end)| end.owner == self.id)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in mine {
            state.close(addr, true, true);
        }
        state.holding.remove(&self.id);
    }

    /// Drops the endpoint's connections on `channel` only.
    pub fn sever_channel(&self, channel: Channel) {
        let mut state = self.state.lock();
        let mine: Vec<SocketAddr> = state
            .ends
            .iter()
            .filter(|(_, end)| end.owner == self.id && end.channel == channel)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in mine {
            state.close(addr, true, true);
        }
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

    fn connected_pair() -> (LoopbackTransport, LoopbackTransport, SocketAddr, SocketAddr) {
        let hub = LoopbackHub::new();
        let mut host = hub.endpoint();
        let mut client = hub.endpoint();
        let port = host.listen(Channel::Data, 3939).unwrap();
        let to_host = client
            .connect(Channel::Data, &IpAddrPort::new("127.0.0.1", port))
            .unwrap();
        let to_client = match host.poll(Duration::ZERO).as_slice() {
            [TransportEvent::Accepted { peer, .. }] => *peer,
            other => panic!("unexpected events {other:?}"),
        };
        assert!(matches!(
            client.poll(Duration::ZERO).as_slice(),
            [TransportEvent::Connected { .. }]
        ));
        (host, client, to_client, to_host)
    }

    #[test]
    fn messages_round_trip_through_the_codec() {
        let (mut host, mut client, to_client, to_host) = connected_pair();
        client
            .send(Channel::Data, &to_host, &NetplayMessage::ConfirmConfig)
            .unwrap();
        let events = host.poll(Duration::ZERO);
        assert_eq!(
            events,
            vec![TransportEvent::Received {
                channel: Channel::Data,
                from: to_client,
                msg: NetplayMessage::ConfirmConfig,
            }]
        );
    }

    #[test]
    fn connecting_to_nobody_reports_disconnect() {
        let hub = LoopbackHub::new();
        let mut client = hub.endpoint();
        let peer = client
            .connect(Channel::Data, &IpAddrPort::new("127.0.0.1", 5000))
            .unwrap();
        assert_eq!(
            client.poll(Duration::ZERO),
            vec![TransportEvent::Disconnected {
                channel: Channel::Data,
                peer
            }]
        );
    }

    #[test]
    fn port_conflicts_are_errors() {
        let hub = LoopbackHub::new();
        let mut a = hub.endpoint();
        let mut b = hub.endpoint();
        a.listen(Channel::Control, 7000).unwrap();
        assert!(b.listen(Channel::Control, 7000).is_err());
        assert!(b.listen(Channel::Data, 7000).is_ok());
    }

    #[test]
    fn disconnect_notifies_remote_only() {
        let (mut host, mut client, to_client, _) = connected_pair();
        host.disconnect(Channel::Data, &to_client);
        assert!(host.poll(Duration::ZERO).is_empty());
        assert!(matches!(
            client.poll(Duration::ZERO).as_slice(),
            [TransportEvent::Disconnected { .. }]
        ));
    }

    #[test]
    fn sever_notifies_both_sides() {
        let (mut host, mut client, _, _) = connected_pair();
        client.probe().sever();
        assert_eq!(host.poll(Duration::ZERO).len(), 1);
        assert_eq!(client.poll(Duration::ZERO).len(), 1);
        assert!(client
            .send(Channel::Data, &local_addr(1), &NetplayMessage::ConfirmConfig)
            .is_err());
    }

    #[test]
    fn held_data_is_delivered_on_release() {
        let (mut host, mut client, _, to_host) = connected_pair();
        let probe = client.probe();
        probe.hold_data();
        client
            .send(Channel::Data, &to_host, &NetplayMessage::ConfirmConfig)
            .unwrap();
        assert!(host.poll(Duration::ZERO).is_empty());
        probe.release();
        assert_eq!(host.poll(Duration::ZERO).len(), 1);
        assert_eq!(probe.sent_count(), 1);
    }

    #[test]
    fn wrong_channel_is_rejected() {
        let (_, mut client, _, to_host) = connected_pair();
        assert!(client
            .send(Channel::Control, &to_host, &NetplayMessage::ConfirmConfig)
            .is_err());
    }
}
