//! Session wiring and the host loop used by the integration tests.
//!
//! Every [`Peer`] is one process in a real deployment: a session, the host it drives and
//! the loopback endpoint it talks through. [`run_until`] interleaves the peers' host loops one
//! turn at a time, so a peer waiting on remote data does not block the others.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::ip_constant,
    dead_code
)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Once;

use fortress_netplay::network::loopback::{LoopbackHub, LoopbackProbe, SentMessage};
use fortress_netplay::{
    ClientMode, Config, ControlMessage, DesyncDetection, FrameStatus, IndexedFrame, IpAddrPort,
    Lifecycle, NetplayConfig, NetplayError, NetplayEvent, NetplayMessage, NetplaySession,
    NetplayState, Role, SessionBuilder, TimingConfig, Transport,
};
use web_time::Duration;

use super::host::{ScriptedHost, Sim};

/// Turns after which a scenario that has not reached its goal counts as stalled.
pub const MAX_TURNS: usize = 20_000;

/// Port the netplay host listens on for both channels.
pub const HOST_PORT: u16 = 7500;

#[derive(Debug)]
pub struct TestConfig;

impl Config for TestConfig {
    type Address = SocketAddr;
    type Snapshot = Sim;
}

static LOGGING: Once = Once::new();

/// Routes `tracing` output to the test harness, once per test binary.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Timing for in-process tests: no waiting in polls and immediate stops.
pub fn test_timing() -> TimingConfig {
    TimingConfig {
        poll_timeout: Duration::ZERO,
        delayed_stop: Duration::ZERO,
        ..TimingConfig::default()
    }
}

pub fn netplay_config(delay: u8, rollback: u8) -> NetplayConfig {
    NetplayConfig {
        delay,
        rollback,
        win_count: 2,
        host_player: 1,
        session_id: "test-session".to_owned(),
        names: ["alice".to_owned(), "bob".to_owned()],
        ..NetplayConfig::default()
    }
}

pub fn loopback(port: u16) -> IpAddrPort {
    IpAddrPort::new("127.0.0.1", port)
}

/// One session with its host and transport.
pub struct Peer {
    pub name: &'static str,
    pub session: NetplaySession<TestConfig>,
    pub host: ScriptedHost,
    pub probe: LoopbackProbe,
    /// Generator state after simulating each frame; replayed frames overwrite.
    pub rng: BTreeMap<IndexedFrame, u32>,
    /// Every frame handed to the host, in order, replays included.
    pub frames: Vec<IndexedFrame>,
    pub events: Vec<NetplayEvent<SocketAddr>>,
    pub error: Option<NetplayError>,
    pending: bool,
}

impl Peer {
    pub fn new(
        name: &'static str,
        hub: &LoopbackHub,
        builder: SessionBuilder<TestConfig>,
        host: ScriptedHost,
    ) -> Self {
        let transport = hub.endpoint();
        let probe = transport.probe();
        Self::with_transport(name, transport, probe, builder, host)
    }

    /// A peer talking through `transport`; `probe` must belong to the endpoint it wraps.
    pub fn with_transport(
        name: &'static str,
        transport: impl Transport<SocketAddr> + 'static,
        probe: LoopbackProbe,
        builder: SessionBuilder<TestConfig>,
        host: ScriptedHost,
    ) -> Self {
        let session = builder
            .start_session(host.clone(), transport)
            .expect("session should start");
        Self {
            name,
            session,
            host,
            probe,
            rng: BTreeMap::new(),
            frames: Vec::new(),
            events: Vec::new(),
            error: None,
            pending: false,
        }
    }

    pub fn control(&mut self, msg: ControlMessage) {
        if let Err(err) = self.session.handle_control(msg) {
            self.error = Some(err);
        }
        self.collect_events();
    }

    pub fn is_done(&self) -> bool {
        self.error.is_some()
            || matches!(
                self.session.lifecycle(),
                Lifecycle::Stopped | Lifecycle::Terminated
            )
    }

    /// One pass of the host loop: start a frame if none is pending, poll once, and step
    /// the host if the frame became ready. Returns the simulated frame.
    pub fn turn(&mut self) -> Option<IndexedFrame> {
        if self.is_done() {
            return None;
        }
        if !self.pending {
            let inputs = self.host.sample();
            if let Err(err) = self.session.begin_frame(inputs) {
                self.error = Some(err);
                self.collect_events();
                return None;
            }
            self.pending = true;
        }
        let simulated = self.finish_pending();
        self.collect_events();
        simulated
    }

    /// Services the network without starting a frame.
    pub fn pump(&mut self) {
        if self.is_done() {
            return;
        }
        if self.pending {
            self.finish_pending();
        } else if let Err(err) = self.session.poll() {
            self.error = Some(err);
        }
        self.collect_events();
    }

    fn finish_pending(&mut self) -> Option<IndexedFrame> {
        match self.session.poll() {
            Ok(FrameStatus::Ready(at)) => {
                self.pending = false;
                self.host.step();
                self.rng.insert(at, self.host.rng());
                self.frames.push(at);
                Some(at)
            },
            Ok(FrameStatus::Waiting) => None,
            Ok(FrameStatus::Stopped) => {
                self.pending = false;
                None
            },
            Err(err) => {
                self.pending = false;
                self.error = Some(err);
                None
            },
        }
    }

    fn collect_events(&mut self) {
        self.events.extend(self.session.events());
    }

    pub fn state(&self) -> NetplayState {
        self.session.state()
    }

    /// Frame of the first transition into `state`.
    pub fn entered(&self, state: NetplayState) -> Option<IndexedFrame> {
        self.events.iter().find_map(|event| match event {
            NetplayEvent::StateChanged { to, at, .. } if *to == state => Some(*at),
            _ => None,
        })
    }

    /// Messages this peer sent that match `filter`.
    pub fn sent(&self, filter: impl Fn(&NetplayMessage) -> bool) -> Vec<SentMessage> {
        self.probe
            .sent()
            .into_iter()
            .filter(|sent| filter(&sent.msg))
            .collect()
    }

    pub fn error_events(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                NetplayEvent::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("session", &self.session)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Interleaves the peers' host loops until `done` holds.
///
/// # Panics
///
/// If `done` does not hold after [`MAX_TURNS`] rounds.
pub fn run_until(peers: &mut [&mut Peer], mut done: impl FnMut(&[&mut Peer]) -> bool) {
    for _ in 0..MAX_TURNS {
        if done(peers) {
            return;
        }
        for peer in peers.iter_mut() {
            peer.turn();
        }
    }
    panic!("scenario stalled: {peers:#?}");
}

/// Runs until every peer simulated at least `frames` more frames or is done.
pub fn run_frames(peers: &mut [&mut Peer], frames: usize) {
    let targets: Vec<usize> = peers.iter().map(|p| p.frames.len() + frames).collect();
    run_until(peers, |peers| {
        peers
            .iter()
            .zip(&targets)
            .all(|(peer, &target)| peer.is_done() || peer.frames.len() >= target)
    });
}

/// Services the network of every peer `rounds` times without starting frames.
pub fn settle(peers: &mut [&mut Peer], rounds: usize) {
    for _ in 0..rounds {
        for peer in peers.iter_mut() {
            peer.pump();
        }
    }
}

/// Builder with test timing.
pub fn builder(mode: ClientMode, detection: DesyncDetection) -> SessionBuilder<TestConfig> {
    SessionBuilder::new()
        .with_client_mode(mode)
        .with_desync_detection(detection)
        .with_timing(test_timing())
}

/// Match flavour of a netplay pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rules {
    Versus,
    Training,
}

/// A netplay host and client connected over `hub` with matching configurations.
pub fn netplay_pair(
    hub: &LoopbackHub,
    config: &NetplayConfig,
    rules: Rules,
    detection: DesyncDetection,
    hosts: (ScriptedHost, ScriptedHost),
) -> (Peer, Peer) {
    connect_netplay(hub, (config, config), rules, detection, hosts)
}

/// A netplay host and client, each configured with its own [`NetplayConfig`].
pub fn connect_netplay(
    hub: &LoopbackHub,
    configs: (&NetplayConfig, &NetplayConfig),
    rules: Rules,
    detection: DesyncDetection,
    hosts: (ScriptedHost, ScriptedHost),
) -> (Peer, Peer) {
    init_logging();
    let training = rules == Rules::Training;
    let mut host = Peer::new(
        "host",
        hub,
        builder(ClientMode::new(Role::Host, training), detection),
        hosts.0,
    );
    let mut client = Peer::new(
        "client",
        hub,
        builder(ClientMode::new(Role::Client, training), detection),
        hosts.1,
    );
    host.control(ControlMessage::IpAddrPort(loopback(HOST_PORT)));
    host.control(ControlMessage::NetplayConfig(configs.0.clone()));
    client.control(ControlMessage::IpAddrPort(loopback(HOST_PORT)));
    client.control(ControlMessage::NetplayConfig(configs.1.clone()));
    settle(&mut [&mut host, &mut client], 3);
    (host, client)
}

/// A broadcast session (local two-player match) listening for spectators.
///
/// Returns the session and the control port it bound.
pub fn broadcaster(hub: &LoopbackHub, training: bool, host: ScriptedHost) -> (Peer, u16) {
    init_logging();
    let mode = ClientMode::new(Role::Broadcast, training);
    let mut peer = Peer::new("broadcaster", hub, builder(mode, DesyncDetection::Off), host);
    peer.control(ControlMessage::NetplayConfig(netplay_config(0, 0)));
    let port = reported_port(&peer);
    (peer, port)
}

/// Control port a broadcast session reported after binding it.
pub fn reported_port(peer: &Peer) -> u16 {
    peer.events
        .iter()
        .find_map(|event| match event {
            NetplayEvent::ConfigUpdated(config) => Some(config.broadcast_port),
            _ => None,
        })
        .expect("broadcast port should be reported")
}

/// A spectator connecting to the control port `port`.
pub fn spectator(hub: &LoopbackHub, port: u16, host: ScriptedHost) -> Peer {
    let mut peer = Peer::new(
        "spectator",
        hub,
        builder(ClientMode::spectate(), DesyncDetection::Off),
        host,
    );
    peer.control(ControlMessage::IpAddrPort(loopback(port)));
    peer
}

/// Frames both peers simulated in `index`, with their generator states.
pub fn common_frames(a: &Peer, b: &Peer, index: u32) -> Vec<(IndexedFrame, u32, u32)> {
    a.rng
        .range(IndexedFrame::start_of(index)..IndexedFrame::start_of(index + 1))
        .filter_map(|(at, &rng_a)| b.rng.get(at).map(|&rng_b| (*at, rng_a, rng_b)))
        .collect()
}
