//! # Fortress Netplay
//!
//! Fortress Netplay keeps two independently clocked copies of a deterministic host
//! simulation in lockstep over an unreliable network, and streams the match to any
//! number of read-only spectators.
//!
//! The engine never touches the host process directly. It observes the host through a
//! [`HostAdapter`], talks to peers through a [`Transport`], and reports back to the
//! surrounding orchestrator through [`NetplayEvent`]s. One [`NetplaySession`] is driven
//! once per host tick:
//!
//! 1. [`NetplaySession::begin_frame`] advances the [`IndexedFrame`], samples host phase
//!    signals and hands local input to the [`InputSynchronizer`](input_sync::InputSynchronizer).
//! 2. [`NetplaySession::poll`] pumps the transport until remote input and, if armed, the
//!    shared generator state are available.
//! 3. Once [`FrameStatus::Ready`] is returned, the inputs for the frame have been written
//!    to the host and the host may simulate it.

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::{fmt::Debug, hash::Hash};

use web_time::Duration;

pub use error::NetplayError;
pub use frame_info::{IndexedFrame, InputBits, LocalInputs};
pub use network::control::{compute_delay, ControlMessage, ControllerMappings, IpAddrPort};
pub use network::messages::NetplayMessage;
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{
    InitialMatchState, InitialMode, NetplayConfig, PhaseTable, SpectateConfig, TimingConfig,
};
pub use sessions::netplay_session::{FrameStatus, Lifecycle, NetplaySession, SessionEvent};
pub use version::Version;

pub mod consensus;
pub mod desync;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
pub mod game_over;
pub mod hash;
pub mod input_sync;
pub mod snapshots;
pub mod spectator;
pub mod telemetry;
pub mod version;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    pub mod config;
    #[doc(hidden)]
    pub mod event_drain;
    pub mod monitor;
    #[doc(hidden)]
    pub mod netplay_session;
    pub mod timers;
}
#[doc(hidden)]
pub mod network {
    /// Binary codec for wire message serialization.
    ///
    /// Provides centralized encoding and decoding of [`NetplayMessage`](crate::NetplayMessage)s
    /// using bincode.
    pub mod codec;
    pub mod control;
    pub mod keep_alive;
    pub mod loopback;
    #[doc(hidden)]
    pub mod messages;
}

/// Match phase as seen by the netplay engine.
///
/// Variants are declared in the order a match normally moves through them, and the
/// derived ordering is used for "at or after character select" style checks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum NetplayState {
    /// Before any peer connection is confirmed.
    PreInitial,
    /// Connected (or local), host still in its attract/menu modes.
    Initial,
    /// Spectator-only: character select being initialized from the bootstrap state.
    InitialCharaSelect,
    /// Character select.
    CharaSelect,
    /// Loading between character select and the match.
    Loading,
    /// A skippable section (character intros, round end).
    Skippable,
    /// Players are in control.
    InGame,
    /// Post-match retry menu.
    RetryMenu,
    /// Pause menu.
    PauseMenu,
}

impl NetplayState {
    /// Returns a string representation suitable for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PreInitial => "PreInitial",
            Self::Initial => "Initial",
            Self::InitialCharaSelect => "InitialCharaSelect",
            Self::CharaSelect => "CharaSelect",
            Self::Loading => "Loading",
            Self::Skippable => "Skippable",
            Self::InGame => "InGame",
            Self::RetryMenu => "RetryMenu",
            Self::PauseMenu => "PauseMenu",
        }
    }

    /// States in which the host runs uncapped to reach character select quickly.
    #[must_use]
    pub const fn is_fast_forward(&self) -> bool {
        matches!(
            self,
            Self::PreInitial | Self::Initial | Self::InitialCharaSelect
        )
    }
}

impl std::fmt::Display for NetplayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part a session plays in a match.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Role {
    /// Not assigned yet; the orchestrator has not sent a client mode.
    #[default]
    Unknown,
    /// Authoritative netplay peer; listens for the client and for spectators.
    Host,
    /// Netplay peer that connects to the host.
    Client,
    /// Read-only observer of a remote match.
    Spectate,
    /// Local two-player match streamed to spectators.
    Broadcast,
    /// Local two-player match without any network traffic.
    Offline,
}

/// Role plus match flags, as delivered by the orchestrator.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ClientMode {
    /// The part this session plays.
    pub role: Role,
    /// Training mode: no rounds, no game over.
    pub training: bool,
}

impl ClientMode {
    /// Creates a client mode.
    #[must_use]
    pub const fn new(role: Role, training: bool) -> Self {
        Self { role, training }
    }

    /// Versus-mode host.
    #[must_use]
    pub const fn host() -> Self {
        Self::new(Role::Host, false)
    }

    /// Versus-mode client.
    #[must_use]
    pub const fn client() -> Self {
        Self::new(Role::Client, false)
    }

    /// Spectator.
    #[must_use]
    pub const fn spectate() -> Self {
        Self::new(Role::Spectate, false)
    }

    /// Local versus match.
    #[must_use]
    pub const fn offline() -> Self {
        Self::new(Role::Offline, false)
    }

    /// Local versus match with spectators.
    #[must_use]
    pub const fn broadcast() -> Self {
        Self::new(Role::Broadcast, false)
    }

    /// `true` once a role has been assigned.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        !matches!(self.role, Role::Unknown)
    }

    /// Authoritative netplay peer.
    #[must_use]
    pub const fn is_host(&self) -> bool {
        matches!(self.role, Role::Host)
    }

    /// Connecting netplay peer.
    #[must_use]
    pub const fn is_client(&self) -> bool {
        matches!(self.role, Role::Client)
    }

    /// Either side of a two-peer match.
    #[must_use]
    pub const fn is_netplay(&self) -> bool {
        matches!(self.role, Role::Host | Role::Client)
    }

    /// Read-only observer.
    #[must_use]
    pub const fn is_spectate(&self) -> bool {
        matches!(self.role, Role::Spectate)
    }

    /// Local match streamed to spectators.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        matches!(self.role, Role::Broadcast)
    }

    /// Local match with no network.
    #[must_use]
    pub const fn is_offline(&self) -> bool {
        matches!(self.role, Role::Offline)
    }

    /// Both players are at this machine.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.role, Role::Broadcast | Role::Offline)
    }

    /// Versus rules (rounds, win counts) apply.
    #[must_use]
    pub const fn is_versus(&self) -> bool {
        !self.training
    }

    /// Roles allowed to generate the shared generator state.
    #[must_use]
    pub const fn is_authority(&self) -> bool {
        matches!(self.role, Role::Host | Role::Broadcast)
    }
}

impl std::fmt::Display for ClientMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.role)?;
        if self.training {
            write!(f, " (training)")?;
        }
        Ok(())
    }
}

/// Player slot, 1 or 2.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct PlayerNumber(u8);

impl PlayerNumber {
    /// Player one.
    pub const ONE: Self = Self(1);
    /// Player two.
    pub const TWO: Self = Self(2);

    /// Validates a raw player number.
    #[must_use]
    pub const fn new(number: u8) -> Option<Self> {
        match number {
            1 | 2 => Some(Self(number)),
            _ => None,
        }
    }

    /// The opposing player.
    #[must_use]
    pub const fn other(self) -> Self {
        Self(3 - self.0)
    }

    /// Zero-based slot, for indexing per-player arrays.
    #[must_use]
    pub const fn slot(self) -> usize {
        (self.0 - 1) as usize
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for PlayerNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Desync detection by periodic exchange of state digests.
///
/// When on, a digest of the shared generator state is exchanged every `interval` frames
/// in stable phases. A mismatch terminates the session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DesyncDetection {
    /// Exchange a digest every `interval` frames.
    On {
        /// Frames between checkpoints.
        interval: u32,
    },
    /// Desync detection is turned off.
    Off,
}

impl Default for DesyncDetection {
    /// Once every 5 seconds at 60 fps.
    fn default() -> Self {
        Self::On { interval: 300 }
    }
}

/// Host simulation variables watched for changes every tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HostFlag {
    /// Counter bumped when players gain control at round start.
    RoundStart,
    /// Non-zero while the current section can be skipped.
    SkippableFlag,
    /// Non-zero once the local player confirmed a menu entry.
    MenuConfirmState,
    /// Cursor position in the current menu.
    CurrentMenuIndex,
    /// Player one health.
    P1Health,
    /// Player two health.
    P2Health,
    /// Remaining round time.
    RoundTimer,
    /// Rounds won by player one.
    P1Wins,
    /// Rounds won by player two.
    P2Wins,
    /// Rounds required to win the match.
    WinCount,
}

/// A change observed in the host simulation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HostSignal {
    /// The host game mode changed.
    GameModeChanged {
        /// Mode before the change.
        previous: u32,
        /// Mode after the change.
        current: u32,
    },
    /// Players gained control.
    RoundStarted,
    /// The skippable flag changed.
    SkippableChanged {
        /// Value before the change.
        previous: u32,
        /// Value after the change.
        current: u32,
    },
}

/// Notifications for the orchestrator. Handling them is up to the user.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]`. Always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetplayEvent<A> {
    /// The match phase changed.
    StateChanged {
        /// Phase before the change.
        from: NetplayState,
        /// Phase after the change, with the indexed frame it starts on.
        to: NetplayState,
        /// First frame of the new phase.
        at: IndexedFrame,
    },
    /// Something went wrong; shown to the user.
    Error {
        /// Human readable description.
        message: String,
    },
    /// The configuration changed locally (e.g. the broadcast port was bound).
    ConfigUpdated(NetplayConfig),
    /// The data channel to the remote peer is up.
    DataConnected {
        /// Remote peer.
        addr: A,
    },
    /// A spectator completed the handshake.
    SpectatorJoined {
        /// Spectator connection.
        addr: A,
        /// First frame the spectator will receive.
        pos: IndexedFrame,
    },
    /// A spectator connection went away.
    SpectatorLeft {
        /// Spectator connection.
        addr: A,
    },
    /// State digests disagree; the session terminates.
    DesyncDetected {
        /// Oldest unmatched local checkpoint.
        local: IndexedFrame,
        /// Oldest unmatched remote checkpoint.
        remote: IndexedFrame,
    },
    /// A confirmed input contradicted a prediction; frames are being replayed.
    RolledBack {
        /// Frame the session was on.
        from: IndexedFrame,
        /// Frame replay restarts from.
        to: IndexedFrame,
    },
    /// Both retry menu selections are known and the final one was applied.
    RetryMenuResolved {
        /// Applied menu entry.
        index: u8,
    },
    /// The session stopped; no more frames will be processed.
    Stopped,
}

/// Compile time parameterization for sessions.
///
/// # Example
///
/// ```
/// use fortress_netplay::Config;
/// use std::net::SocketAddr;
///
/// struct MyConfig;
///
/// impl Config for MyConfig {
///     type Address = SocketAddr;
///     type Snapshot = Vec<u8>;
/// }
/// ```
pub trait Config: 'static {
    /// The address type which identifies remote connections.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug + Send;

    /// A saved host simulation state, used for rollback.
    type Snapshot;
}

/// The host simulation as seen by the engine.
///
/// Required methods are the ones every session needs. The defaulted methods are hooks
/// for hosts that can do more (run uncapped, allocate rollback storage up front, apply a
/// negotiated menu choice or match settings).
pub trait HostAdapter<S> {
    /// Current host game mode, mapped to phases through the [`PhaseTable`].
    fn phase_signal(&self) -> u32;

    /// Current value of a watched host variable.
    fn flag(&self, flag: HostFlag) -> u32;

    /// Sets the input `player` sees on the frame about to be simulated.
    fn write_input(&mut self, player: PlayerNumber, bits: InputBits);

    /// Captures the complete simulation state.
    fn capture_snapshot(&mut self) -> S;

    /// Restores a state captured with [`capture_snapshot`](Self::capture_snapshot).
    fn restore_snapshot(&mut self, snapshot: &S);

    /// Current shared generator state.
    fn read_rng(&self) -> Vec<u8>;

    /// Overwrites the shared generator state.
    fn write_rng(&mut self, state: &[u8]);

    /// Called at the start of every tick, before any input is written.
    fn clear_inputs(&mut self) {}

    /// Rollback storage is about to be used.
    fn allocate_snapshot_storage(&mut self) {}

    /// Rollback storage is no longer needed.
    fn release_snapshot_storage(&mut self) {}

    /// Run uncapped (`true`) or at the normal rate.
    fn set_fast_forward(&mut self, _enabled: bool) {}

    /// Apply the negotiated retry menu selection.
    fn apply_menu_selection(&mut self, _index: u8) {}

    /// Apply negotiated match settings such as the win count.
    fn apply_match_settings(&mut self, _config: &NetplayConfig) {}

    /// Spectators: set up the host from the match state sent by the broadcaster.
    fn apply_initial_state(&mut self, _initial: &InitialMatchState) {}
}

/// Which of the two peer channels a message travels on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    /// Reliable, ordered (handshake, spectators).
    Control,
    /// Best-effort (in-match traffic between the two peers).
    Data,
}

/// Something that happened on the transport since the last poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent<A> {
    /// A listening channel accepted a connection.
    Accepted {
        /// Channel that was listening.
        channel: Channel,
        /// New remote connection.
        peer: A,
    },
    /// An outgoing connection completed.
    Connected {
        /// Channel of the connection.
        channel: Channel,
        /// Remote end.
        peer: A,
    },
    /// A message arrived.
    Received {
        /// Channel the message arrived on.
        channel: Channel,
        /// Sender.
        from: A,
        /// Decoded message.
        msg: NetplayMessage,
    },
    /// A connection went away.
    Disconnected {
        /// Channel of the connection.
        channel: Channel,
        /// Remote end.
        peer: A,
    },
}

/// Peer connectivity as used by the engine.
///
/// Implementations own the sockets. The engine only listens, connects, sends typed
/// messages and polls for [`TransportEvent`]s. It never retries on its own beyond the
/// input resend timer.
pub trait Transport<A> {
    /// Starts listening on `port` (0 picks a free port) and returns the bound port.
    fn listen(&mut self, channel: Channel, port: u16) -> Result<u16, NetplayError>;

    /// Starts connecting to `target` and returns the address the connection will report.
    fn connect(&mut self, channel: Channel, target: &IpAddrPort) -> Result<A, NetplayError>;

    /// Sends a message to a connected peer.
    fn send(&mut self, channel: Channel, to: &A, msg: &NetplayMessage) -> Result<(), NetplayError>;

    /// Closes a connection.
    fn disconnect(&mut self, channel: Channel, peer: &A);

    /// Returns everything that happened since the last call, waiting up to `timeout` for
    /// the first event.
    fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent<A>>;
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    // ==========================================
    // NetplayState Tests
    // ==========================================

    #[test]
    fn states_are_ordered_by_match_progress() {
        assert!(NetplayState::PreInitial < NetplayState::Initial);
        assert!(NetplayState::InitialCharaSelect < NetplayState::CharaSelect);
        assert!(NetplayState::CharaSelect < NetplayState::Loading);
        assert!(NetplayState::InGame < NetplayState::RetryMenu);
    }

    #[test]
    fn fast_forward_only_before_character_select() {
        assert!(NetplayState::PreInitial.is_fast_forward());
        assert!(NetplayState::InitialCharaSelect.is_fast_forward());
        assert!(!NetplayState::CharaSelect.is_fast_forward());
        assert!(!NetplayState::InGame.is_fast_forward());
    }

    // ==========================================
    // ClientMode Tests
    // ==========================================

    #[test]
    fn client_mode_predicates() {
        assert!(ClientMode::host().is_netplay());
        assert!(ClientMode::client().is_netplay());
        assert!(!ClientMode::spectate().is_netplay());
        assert!(ClientMode::offline().is_local());
        assert!(ClientMode::broadcast().is_local());
        assert!(ClientMode::broadcast().is_authority());
        assert!(!ClientMode::client().is_authority());
        assert!(!ClientMode::default().is_known());
        assert!(!ClientMode::new(Role::Host, true).is_versus());
    }

    #[test]
    fn client_mode_display_marks_training() {
        assert_eq!(ClientMode::host().to_string(), "Host");
        assert_eq!(
            ClientMode::new(Role::Offline, true).to_string(),
            "Offline (training)"
        );
    }

    // ==========================================
    // PlayerNumber Tests
    // ==========================================

    #[test]
    fn player_number_validation() {
        assert_eq!(PlayerNumber::new(1), Some(PlayerNumber::ONE));
        assert_eq!(PlayerNumber::new(2), Some(PlayerNumber::TWO));
        assert_eq!(PlayerNumber::new(0), None);
        assert_eq!(PlayerNumber::new(3), None);
    }

    #[test]
    fn player_number_other_and_slot() {
        assert_eq!(PlayerNumber::ONE.other(), PlayerNumber::TWO);
        assert_eq!(PlayerNumber::TWO.other(), PlayerNumber::ONE);
        assert_eq!(PlayerNumber::ONE.slot(), 0);
        assert_eq!(PlayerNumber::TWO.slot(), 1);
    }

    #[test]
    fn desync_detection_defaults_to_five_seconds() {
        assert_eq!(
            DesyncDetection::default(),
            DesyncDetection::On { interval: 300 }
        );
    }
}
