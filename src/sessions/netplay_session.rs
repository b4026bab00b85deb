use std::collections::VecDeque;
use std::sync::Arc;

use web_time::{Duration, Instant};

use crate::consensus::{ConsensusChannel, ConsensusRole};
use crate::desync::{DesyncDetector, SyncHash};
use crate::error::NetplayError;
use crate::frame_info::{IndexedFrame, LocalInputs};
use crate::game_over::{GameOverTracker, RoundResult};
use crate::input_sync::{ArchivedGame, InputSynchronizer};
use crate::network::control::{ControlMessage, ControllerMappings, IpAddrPort};
use crate::network::messages::NetplayMessage;
use crate::sessions::config::{
    InitialMatchState, InitialMode, NetplayConfig, PhaseTable, SpectateConfig, TimingConfig,
};
use crate::sessions::event_drain::EventDrain;
use crate::sessions::monitor::ChangeMonitor;
use crate::sessions::timers::{TimerKind, Timers};
use crate::snapshots::SnapshotRing;
use crate::spectator::SpectatorRelay;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::version::Version;
use crate::{
    debug_check_invariants, report_violation_to, Channel, ClientMode, Config, DesyncDetection,
    HostAdapter, HostFlag, HostSignal, NetplayEvent, NetplayState, PlayerNumber, Role, Transport,
    TransportEvent,
};

/// Error text shown when the remote side goes away.
const DISCONNECTED: &str = "Disconnected!";

/// Where the session is in its life.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Processing frames.
    Running,
    /// A stop was requested; frames are still processed until the grace period ends.
    Stopping,
    /// Stopped after a disconnect or stop request. No more frames are processed.
    Stopped,
    /// Terminated by a fatal error. Every call returns [`NetplayError::SessionTerminated`].
    Terminated,
}

/// Outcome of [`NetplaySession::poll`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FrameStatus {
    /// Inputs for this frame were written to the host; it may simulate the frame.
    Ready(IndexedFrame),
    /// Still waiting on remote input or shared state. Poll again.
    Waiting,
    /// The session stopped.
    Stopped,
}

/// Anything the session reacts to, in one place.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent<A> {
    /// The host simulation changed.
    HostSignal(HostSignal),
    /// The transport reported something.
    Transport(TransportEvent<A>),
    /// The orchestrator sent a command.
    Control(ControlMessage),
    /// A session timer ran out.
    TimerExpired(TimerKind<A>),
}

/// Settings fixed at session start, see [`SessionBuilder`](crate::SessionBuilder).
pub(crate) struct SessionSettings {
    pub(crate) client_mode: ClientMode,
    pub(crate) timing: TimingConfig,
    pub(crate) desync_detection: DesyncDetection,
    pub(crate) version: Version,
    pub(crate) strict_version: u8,
    pub(crate) phase_table: PhaseTable,
    pub(crate) observer: Option<Arc<dyn ViolationObserver>>,
    pub(crate) event_queue_size: usize,
}

/// One netplay, spectator, broadcast or offline session.
///
/// The session is driven by the host's tick: call [`begin_frame`](Self::begin_frame)
/// once per tick, then [`poll`](Self::poll) until it returns [`FrameStatus::Ready`],
/// then let the host simulate the frame. [`advance_frame`](Self::advance_frame) does
/// both. Control messages from the orchestrator go through
/// [`handle_control`](Self::handle_control), and notifications come back through
/// [`events`](Self::events).
pub struct NetplaySession<T: Config> {
    host: Box<dyn HostAdapter<T::Snapshot>>,
    transport: Box<dyn Transport<T::Address>>,
    timing: TimingConfig,
    version: Version,
    strict_version: u8,
    phase_table: PhaseTable,
    observer: Option<Arc<dyn ViolationObserver>>,

    client_mode: ClientMode,
    address: Option<IpAddrPort>,
    mappings: Option<ControllerMappings>,
    config: Option<NetplayConfig>,
    spectate_config: Option<SpectateConfig>,
    remote_config_confirmed: bool,

    state: NetplayState,
    lifecycle: Lifecycle,
    current: IndexedFrame,
    game_start_index: u32,

    /// Connected remote peer on the data channel.
    data_peer: Option<T::Address>,
    /// Client: outstanding data channel connection attempt.
    connecting: Option<T::Address>,
    /// Spectator: the session being watched.
    broadcaster: Option<T::Address>,
    /// Spectator: where the stream starts, from `InitialGameState`.
    stream_start: Option<(InitialMode, IndexedFrame)>,

    sync: InputSynchronizer,
    consensus: ConsensusChannel,
    desync: DesyncDetector,
    relay: SpectatorRelay<T::Address>,
    game_over: GameOverTracker,
    snapshots: Option<SnapshotRing<T::Snapshot>>,
    monitor: ChangeMonitor,
    timers: Timers<T::Address>,

    waiting: bool,
    rerun_stop: Option<IndexedFrame>,
    fast_forward: bool,
    lazy_disconnect: bool,
    local_menu_sent: bool,
    menu_applied: bool,

    events: VecDeque<NetplayEvent<T::Address>>,
    event_queue_size: usize,
}

impl<T: Config> NetplaySession<T> {
    pub(crate) fn new(
        settings: SessionSettings,
        host: Box<dyn HostAdapter<T::Snapshot>>,
        transport: Box<dyn Transport<T::Address>>,
    ) -> Self {
        let SessionSettings {
            client_mode,
            timing,
            desync_detection,
            version,
            strict_version,
            phase_table,
            observer,
            event_queue_size,
        } = settings;
        let monitor = ChangeMonitor::new(&*host);
        let mut session = Self {
            host,
            transport,
            timing,
            version,
            strict_version,
            phase_table,
            observer,
            client_mode: ClientMode::default(),
            address: None,
            mappings: None,
            config: None,
            spectate_config: None,
            remote_config_confirmed: false,
            state: NetplayState::PreInitial,
            lifecycle: Lifecycle::Running,
            current: IndexedFrame::default(),
            game_start_index: 0,
            data_peer: None,
            connecting: None,
            broadcaster: None,
            stream_start: None,
            sync: InputSynchronizer::new(),
            consensus: ConsensusChannel::new(ConsensusRole::Passive),
            desync: DesyncDetector::new(desync_detection),
            relay: SpectatorRelay::new(timing.spectator_batch),
            game_over: GameOverTracker::new(),
            snapshots: None,
            monitor,
            timers: Timers::new(),
            waiting: false,
            rerun_stop: None,
            fast_forward: false,
            lazy_disconnect: false,
            local_menu_sent: false,
            menu_applied: false,
            events: VecDeque::new(),
            event_queue_size,
        };
        if client_mode.is_known() {
            session.assign_client_mode(client_mode);
        }
        session.update_fast_forward();
        session
    }

    // ==========================================
    // Accessors
    // ==========================================

    /// Current match phase.
    #[must_use]
    pub fn state(&self) -> NetplayState {
        self.state
    }

    /// Where the session is in its life.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Frame being processed.
    #[must_use]
    pub fn current_frame(&self) -> IndexedFrame {
        self.current
    }

    /// First match instance of the current game.
    #[must_use]
    pub fn game_start_index(&self) -> u32 {
        self.game_start_index
    }

    /// Role and match flags.
    #[must_use]
    pub fn client_mode(&self) -> ClientMode {
        self.client_mode
    }

    /// Local match configuration, once received.
    #[must_use]
    pub fn config(&self) -> Option<&NetplayConfig> {
        self.config.as_ref()
    }

    /// Spectators: configuration of the watched match, once received.
    #[must_use]
    pub fn spectate_config(&self) -> Option<&SpectateConfig> {
        self.spectate_config.as_ref()
    }

    /// Controller mappings from the orchestrator, if any.
    #[must_use]
    pub fn controller_mappings(&self) -> Option<&ControllerMappings> {
        self.mappings.as_ref()
    }

    /// `true` once the remote peer's configuration matched the local one.
    #[must_use]
    pub fn is_remote_config_confirmed(&self) -> bool {
        self.remote_config_confirmed
    }

    /// Connected remote peer on the data channel.
    #[must_use]
    pub fn data_peer(&self) -> Option<&T::Address> {
        self.data_peer.as_ref()
    }

    /// Admitted spectators.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.relay.len()
    }

    /// `true` while frames are being replayed after a rollback.
    #[must_use]
    pub fn is_rerunning(&self) -> bool {
        self.rerun_stop.is_some()
    }

    /// `true` once the current game is decided.
    #[must_use]
    pub fn is_game_over(&self) -> bool {
        self.game_over.is_game_over()
    }

    /// Checkpoints confirmed equal with the remote peer so far.
    #[must_use]
    pub fn matched_checkpoints(&self) -> u64 {
        self.desync.matched()
    }

    /// Inputs of the last finished game.
    #[must_use]
    pub fn last_game(&self) -> Option<&ArchivedGame> {
        self.sync.last_game()
    }

    /// The input synchronizer, for inspection.
    #[must_use]
    pub fn input_sync(&self) -> &InputSynchronizer {
        &self.sync
    }

    /// Drains the queued [`NetplayEvent`]s.
    pub fn events(&mut self) -> EventDrain<'_, T::Address> {
        EventDrain::from_drain(self.events.drain(..))
    }

    // ==========================================
    // Frame Driving
    // ==========================================

    /// Starts a host tick: advances the frame, reacts to host changes and hands the
    /// sampled local input to the synchronizer.
    ///
    /// # Errors
    ///
    /// - [`NetplayError::SessionTerminated`] if the session was terminated.
    /// - [`NetplayError::InvalidRequest`] if the previous frame is still waiting.
    /// - Any fatal error raised while reacting to host changes.
    pub fn begin_frame(&mut self, inputs: LocalInputs) -> Result<(), NetplayError> {
        self.ensure_alive()?;
        if self.lifecycle == Lifecycle::Stopped {
            return Ok(());
        }
        if self.waiting {
            return Err(NetplayError::InvalidRequest {
                info: format!("frame {} is still waiting for remote data", self.current),
            });
        }

        self.current = self.current.next();
        self.host.clear_inputs();

        for signal in self.monitor.check(&*self.host) {
            self.on_host_signal(signal)?;
        }

        if let Some(stop) = self.rerun_stop {
            let finished = self.current >= stop;
            if finished {
                tracing::debug!(frame = %self.current, "rerun finished");
                self.rerun_stop = None;
                self.update_fast_forward();
            }
            if self.state == NetplayState::InGame {
                if let Some(ring) = self.snapshots.as_mut() {
                    ring.save(self.current, self.host.capture_snapshot());
                }
            }
            if finished {
                // The rollback started here, before this frame was settled.
                self.settle_frame(self.current)?;
            }
            self.write_inputs(self.current);
            return Ok(());
        }

        self.step_normal(inputs)?;
        self.waiting = true;
        Ok(())
    }

    /// Pumps the transport and timers and, once the pending frame has everything it
    /// needs, writes its inputs to the host.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::SessionTerminated`] if the session was terminated, or the
    /// fatal error that terminated it during this call.
    pub fn poll(&mut self) -> Result<FrameStatus, NetplayError> {
        self.ensure_alive()?;
        self.pump()?;
        if self.lifecycle == Lifecycle::Stopped {
            return Ok(FrameStatus::Stopped);
        }
        if !self.waiting {
            return Ok(FrameStatus::Ready(self.current));
        }
        if self.is_frame_ready() {
            self.waiting = false;
            self.timers.cancel(&TimerKind::Resend);
            let at = self.finish_frame()?;
            return Ok(FrameStatus::Ready(at));
        }
        if self.client_mode.is_netplay() {
            self.timers
                .ensure(TimerKind::Resend, self.timing.resend_interval);
        }
        Ok(FrameStatus::Waiting)
    }

    /// [`begin_frame`](Self::begin_frame) followed by [`poll`](Self::poll) until the frame
    /// is ready or the session stops.
    ///
    /// # Errors
    ///
    /// See [`begin_frame`](Self::begin_frame) and [`poll`](Self::poll).
    pub fn advance_frame(&mut self, inputs: LocalInputs) -> Result<FrameStatus, NetplayError> {
        self.begin_frame(inputs)?;
        loop {
            match self.poll()? {
                FrameStatus::Waiting => {},
                status => return Ok(status),
            }
        }
    }

    /// Handles a command from the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::SessionTerminated`] if the session was terminated, or the
    /// fatal error a bad configuration raised.
    pub fn handle_control(&mut self, msg: ControlMessage) -> Result<(), NetplayError> {
        self.handle_event(SessionEvent::Control(msg))
    }

    /// Single dispatch point for everything the session reacts to.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::SessionTerminated`] if the session was terminated, or the
    /// fatal error raised while handling `event`.
    pub fn handle_event(&mut self, event: SessionEvent<T::Address>) -> Result<(), NetplayError> {
        self.ensure_alive()?;
        if self.lifecycle == Lifecycle::Stopped {
            return Ok(());
        }
        match event {
            SessionEvent::HostSignal(signal) => self.on_host_signal(signal),
            SessionEvent::Transport(event) => self.on_transport_event(event),
            SessionEvent::Control(msg) => self.on_control(msg),
            SessionEvent::TimerExpired(kind) => self.on_timer(kind),
        }
    }

    fn ensure_alive(&self) -> Result<(), NetplayError> {
        if self.lifecycle == Lifecycle::Terminated {
            return Err(NetplayError::SessionTerminated);
        }
        Ok(())
    }

    fn pump(&mut self) -> Result<(), NetplayError> {
        let timeout = if self.waiting {
            self.timing.poll_timeout
        } else {
            Duration::ZERO
        };
        for event in self.transport.poll(timeout) {
            self.handle_event(SessionEvent::Transport(event))?;
        }
        for kind in self.timers.expired(Instant::now()) {
            self.handle_event(SessionEvent::TimerExpired(kind))?;
        }
        Ok(())
    }

    fn local_player(&self) -> PlayerNumber {
        self.sync.remote_player().other()
    }

    fn step_normal(&mut self, inputs: LocalInputs) -> Result<(), NetplayError> {
        let at = self.current;
        if self.state == NetplayState::InGame {
            if let Some(ring) = self.snapshots.as_mut() {
                ring.save(at, self.host.capture_snapshot());
            }
        }

        if self.client_mode.is_spectate() || !self.client_mode.is_known() {
            return Ok(());
        }

        let local = self.local_player();
        if self.client_mode.is_local() {
            self.sync.set_input(PlayerNumber::ONE, at, inputs.primary);
            self.sync.set_input(PlayerNumber::TWO, at, inputs.secondary);
        } else if self.state == NetplayState::RetryMenu {
            let bits = self.step_retry_menu(inputs.primary);
            self.sync.set_input(local, at, bits);
        } else {
            self.sync.set_input(local, at, inputs.primary);
            if self.state >= NetplayState::CharaSelect {
                self.send_inputs();
            }
        }

        if self.consensus.needs_produce(at.index) {
            if let Some(state) = self.consensus.produce(at.index, self.host.read_rng()) {
                tracing::debug!(index = state.index, "shared state generated");
                let msg = NetplayMessage::RngState(state);
                if self.client_mode.is_host() {
                    self.send_data(&msg);
                }
                self.relay.forward(&mut *self.transport, &msg);
            }
        }
        Ok(())
    }

    /// Retry menu: picks up the local selection, sends it once and masks the local
    /// input from then on.
    fn step_retry_menu(&mut self, bits: u16) -> u16 {
        let index = self.current.index;
        if self.sync.local_menu(index).is_none()
            && self.host.flag(HostFlag::MenuConfirmState) > 0
        {
            let selection = u8::try_from(self.host.flag(HostFlag::CurrentMenuIndex)).unwrap_or(0);
            tracing::info!(index, selection, "local retry menu selection");
            self.sync.set_local_menu(index, selection);
        }
        let Some(selection) = self.sync.local_menu(index) else {
            return bits;
        };
        if !self.local_menu_sent {
            self.local_menu_sent = true;
            self.send_data(&NetplayMessage::MenuIndex {
                index,
                menu_index: selection,
            });
            self.timers
                .start(TimerKind::Resend, self.timing.resend_interval);
        }
        if self.lazy_disconnect && self.data_peer.is_none() {
            self.lazy_disconnect = false;
            self.delayed_stop(DISCONNECTED);
        }
        0
    }

    fn is_frame_ready(&self) -> bool {
        let at = self.current;
        if self.client_mode.is_spectate() {
            return match self.stream_start {
                None => self.state < NetplayState::CharaSelect,
                Some((_, start)) => {
                    self.state == NetplayState::RetryMenu
                        || at < start
                        || (self.sync.is_remote_input_ready(at, self.state)
                            && self.consensus.is_ready(at.index))
                },
            };
        }
        if self.client_mode.is_local() || !self.client_mode.is_known() {
            return true;
        }
        if self.lazy_disconnect && self.data_peer.is_none() {
            return true;
        }
        self.sync.is_remote_input_ready(at, self.state) && self.consensus.is_ready(at.index)
    }

    fn finish_frame(&mut self) -> Result<IndexedFrame, NetplayError> {
        let at = self.current;

        if let Some(state) = self.consensus.take_for_apply(at.index) {
            tracing::debug!(index = state.index, "shared state applied");
            self.host.write_rng(&state.blob);
            // The snapshot for this frame was taken before the shared state arrived.
            if self.state == NetplayState::InGame {
                if let Some(ring) = self.snapshots.as_mut() {
                    ring.save(at, self.host.capture_snapshot());
                }
            }
        }

        if let Some(to) = self.try_rollback(at) {
            self.write_inputs(to);
            return Ok(to);
        }

        self.settle_frame(at)?;

        if self.state == NetplayState::RetryMenu && !self.client_mode.is_local() {
            self.resolve_retry_menu();
        }

        self.write_inputs(at);
        debug_check_invariants!(self.sync);
        Ok(at)
    }

    /// Spectator batch and checkpoint for a frame whose inputs are final.
    fn settle_frame(&mut self, at: IndexedFrame) -> Result<(), NetplayError> {
        if self.relay.is_batch_frame(at.frame) {
            self.relay
                .broadcast_batch(&mut *self.transport, &self.sync, at);
        }

        if self
            .desync
            .should_check(at, self.state, self.data_peer.is_some())
            && self.sync.is_confirmed(at)
        {
            let hash = SyncHash::compute(at, &self.host.read_rng());
            self.send_data(&NetplayMessage::SyncHash(hash));
            if let Some((local, remote)) = self.desync.push_local(hash) {
                return self.desync_detected(local, remote);
            }
        }
        Ok(())
    }

    /// Replays from the earliest mispredicted frame, if there is one.
    fn try_rollback(&mut self, at: IndexedFrame) -> Option<IndexedFrame> {
        let to = self.sync.take_changed()?;
        if self.state != NetplayState::InGame || to.index != at.index || to >= at {
            report_violation_to!(
                self.observer,
                at,
                ViolationSeverity::Error,
                ViolationKind::InputSync,
                "misprediction at {} cannot be rolled back from {} in {}",
                to,
                at,
                self.state
            );
            return None;
        }
        let Some(snapshot) = self.snapshots.as_ref().and_then(|ring| ring.get(to)) else {
            report_violation_to!(
                self.observer,
                at,
                ViolationSeverity::Error,
                ViolationKind::InternalError,
                "no snapshot for {}",
                to
            );
            return None;
        };
        self.host.restore_snapshot(snapshot);
        self.sync.discard_predictions_from(to);
        tracing::debug!(from = %at, %to, "rolling back");
        self.rerun_stop = Some(at);
        self.current = to;
        self.update_fast_forward();
        self.push_event(NetplayEvent::RolledBack { from: at, to });
        Some(to)
    }

    fn resolve_retry_menu(&mut self) {
        if self.menu_applied {
            return;
        }
        let index = self.current.index;
        let Some(selection) = self.sync.retry_selection(index) else {
            return;
        };
        self.menu_applied = true;
        self.timers.cancel(&TimerKind::Resend);
        tracing::info!(index, selection, "retry menu resolved");
        self.host.apply_menu_selection(selection);
        self.relay.forward(
            &mut *self.transport,
            &NetplayMessage::MenuIndex {
                index,
                menu_index: selection,
            },
        );
        self.push_event(NetplayEvent::RetryMenuResolved { index: selection });
    }

    fn write_inputs(&mut self, at: IndexedFrame) {
        let [p1, p2] = self.sync.frame_inputs(at, self.state);
        self.host.write_input(PlayerNumber::ONE, p1);
        self.host.write_input(PlayerNumber::TWO, p2);
    }

    // ==========================================
    // Phase Transitions
    // ==========================================

    /// Maps a host change to a phase transition.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidGameMode`] (and terminates) for a game mode that has
    /// no phase.
    pub fn on_host_signal(&mut self, signal: HostSignal) -> Result<(), NetplayError> {
        self.ensure_alive()?;
        match signal {
            HostSignal::GameModeChanged { previous, current } => {
                self.on_game_mode_changed(previous, current)
            },
            HostSignal::RoundStarted => self.set_state(NetplayState::InGame),
            HostSignal::SkippableChanged { previous, current } => {
                if self.client_mode.training
                    || previous != 0
                    || current == 0
                    || self.state != NetplayState::InGame
                {
                    return Ok(());
                }
                let over = self.game_over.update(RoundResult::read(&*self.host));
                self.set_state(NetplayState::Skippable)?;
                self.lazy_disconnect = self.client_mode.is_netplay() && over;
                Ok(())
            },
        }
    }

    fn on_game_mode_changed(&mut self, previous: u32, current: u32) -> Result<(), NetplayError> {
        let table = self.phase_table;
        tracing::debug!(previous, current, state = %self.state, "game mode changed");
        if table.is_attract(previous, current) {
            if !matches!(self.state, NetplayState::PreInitial | NetplayState::Initial) {
                report_violation_to!(
                    self.observer,
                    self.current,
                    ViolationSeverity::Warning,
                    ViolationKind::PhaseTransition,
                    "attract game mode {} in {}",
                    current,
                    self.state
                );
            }
            return Ok(());
        }
        if current == table.chara_select {
            let state = if self.client_mode.is_spectate() {
                NetplayState::InitialCharaSelect
            } else {
                NetplayState::CharaSelect
            };
            self.set_state(state)
        } else if current == table.loading {
            self.set_state(NetplayState::Loading)
        } else if current == table.in_game {
            let state = if self.client_mode.is_versus() {
                NetplayState::Skippable
            } else {
                NetplayState::InGame
            };
            self.set_state(state)
        } else if current == table.retry {
            self.sync
                .archive_game(self.game_start_index, self.current.index);
            self.set_state(NetplayState::RetryMenu)
        } else {
            self.terminate(NetplayError::InvalidGameMode { previous, current })
        }
    }

    fn set_state(&mut self, state: NetplayState) -> Result<(), NetplayError> {
        if state == self.state {
            report_violation_to!(
                self.observer,
                self.current,
                ViolationSeverity::Warning,
                ViolationKind::PhaseTransition,
                "already in {}",
                state
            );
            return Ok(());
        }
        let from = self.state;

        if state == NetplayState::RetryMenu {
            self.lazy_disconnect = self.client_mode.is_netplay();
            self.local_menu_sent = false;
            self.menu_applied = false;
        } else if self.lazy_disconnect {
            self.lazy_disconnect = false;
            if self.client_mode.is_netplay() && self.data_peer.is_none() {
                self.delayed_stop(DISCONNECTED);
                return Ok(());
            }
        }

        if state == NetplayState::Loading {
            self.game_start_index = self.current.index + 2;
            self.game_over.reset();
        }

        if state == NetplayState::InGame && self.sync.rollback() > 0 {
            if self.snapshots.is_none() {
                self.host.allocate_snapshot_storage();
                self.snapshots = Some(SnapshotRing::new(self.sync.rollback() as usize));
            }
        } else if self.snapshots.take().is_some() {
            self.host.release_snapshot_storage();
        }

        self.current = IndexedFrame::start_of(self.current.index + 1);
        let mut aligned = false;
        if self.client_mode.is_spectate() {
            if let Some((mode, start)) = self.stream_start {
                match (mode, state) {
                    (InitialMode::CharaSelect, NetplayState::InitialCharaSelect) => {
                        self.current = start;
                        aligned = true;
                    },
                    (InitialMode::InGame, NetplayState::Loading) => {
                        self.current = IndexedFrame::start_of(start.index.saturating_sub(1));
                        self.game_start_index = start.index;
                    },
                    _ => {},
                }
            }
        }

        let arm = matches!(state, NetplayState::CharaSelect | NetplayState::InGame) || aligned;
        if arm && !self.client_mode.is_offline() && !self.game_over.is_game_over() {
            self.consensus.arm(self.current.index);
        }

        self.state = state;
        self.update_fast_forward();
        tracing::info!(%from, to = %state, at = %self.current, "state changed");
        self.push_event(NetplayEvent::StateChanged {
            from,
            to: state,
            at: self.current,
        });
        self.prune();
        Ok(())
    }

    fn update_fast_forward(&mut self) {
        let enabled = self.state.is_fast_forward() || self.rerun_stop.is_some();
        if enabled != self.fast_forward {
            self.fast_forward = enabled;
            self.host.set_fast_forward(enabled);
        }
    }

    fn prune(&mut self) {
        let mut low = self
            .current
            .index
            .saturating_sub(1)
            .min(self.game_start_index);
        if let Some(index) = self.relay.min_pos_index() {
            low = low.min(index);
        }
        self.sync.prune_before(low);
        self.consensus.prune_before(low);
    }

    // ==========================================
    // Control Messages
    // ==========================================

    fn assign_client_mode(&mut self, mode: ClientMode) {
        self.client_mode = mode;
        let role = match mode.role {
            Role::Host | Role::Broadcast => ConsensusRole::Authority,
            Role::Client | Role::Spectate => ConsensusRole::Consumer,
            Role::Offline | Role::Unknown => ConsensusRole::Passive,
        };
        self.consensus.set_role(role);
        self.sync.set_spectate(mode.is_spectate());
        tracing::info!(%mode, "client mode");
    }

    fn on_control(&mut self, msg: ControlMessage) -> Result<(), NetplayError> {
        tracing::debug!(kind = msg.kind(), "control message");
        match msg {
            ControlMessage::ClientMode(mode) => {
                if self.client_mode.is_known() {
                    self.config_ignored("client mode");
                } else {
                    self.assign_client_mode(mode);
                }
                Ok(())
            },
            ControlMessage::IpAddrPort(address) => {
                if self.address.is_some() {
                    self.config_ignored("address");
                    return Ok(());
                }
                if self.client_mode.is_spectate() {
                    match self.transport.connect(Channel::Control, &address) {
                        Ok(peer) => self.broadcaster = Some(peer),
                        Err(err) => return self.terminate(err),
                    }
                }
                self.address = Some(address);
                Ok(())
            },
            ControlMessage::ControllerMappings(mappings) => {
                self.mappings = Some(mappings);
                Ok(())
            },
            ControlMessage::NetplayConfig(config) => self.apply_netplay_config(config),
            ControlMessage::SpectateConfig(config) => self.accept_spectate_config(config),
            ControlMessage::ErrorMessage { text } => {
                self.delayed_stop(&text);
                Ok(())
            },
        }
    }

    fn config_ignored(&self, what: &str) {
        report_violation_to!(
            self.observer,
            self.current,
            ViolationSeverity::Warning,
            ViolationKind::Configuration,
            "{} already set, ignoring",
            what
        );
    }

    fn apply_netplay_config(&mut self, mut config: NetplayConfig) -> Result<(), NetplayError> {
        if self.config.is_some() {
            self.config_ignored("netplay config");
            return Ok(());
        }
        if !self.client_mode.is_known() && config.mode.is_known() {
            self.assign_client_mode(config.mode);
        }
        config.mode = self.client_mode;
        if let Err(err) = config.validate() {
            return self.terminate(err);
        }
        let Some(host_player) = PlayerNumber::new(config.host_player) else {
            return self.terminate(NetplayError::InvalidHostConfig {
                info: format!("host player must be 1 or 2, got {}", config.host_player),
            });
        };

        if matches!(self.client_mode.role, Role::Spectate | Role::Unknown) {
            report_violation_to!(
                self.observer,
                self.current,
                ViolationSeverity::Warning,
                ViolationKind::Configuration,
                "netplay config for {} role",
                self.client_mode
            );
            return Ok(());
        }
        if let Err(err) = self.open_endpoints(&mut config) {
            return self.terminate(err);
        }

        self.sync.set_delay(config.delay);
        self.sync.set_rollback(config.rollback);
        self.desync.set_prediction(config.rollback > 0);
        let local = if self.client_mode.is_client() {
            host_player.other()
        } else {
            host_player
        };
        self.sync.set_remote_player(local.other());
        self.host.apply_match_settings(&config);
        tracing::info!(
            delay = config.delay,
            rollback = config.rollback,
            mode = %self.client_mode,
            "netplay config"
        );
        if matches!(self.client_mode.role, Role::Host | Role::Client) {
            self.timers.start(
                TimerKind::InitialConnect,
                self.timing.initial_connect_timeout,
            );
        }
        if self.client_mode.role == Role::Broadcast {
            self.push_event(NetplayEvent::ConfigUpdated(config.clone()));
        }
        self.config = Some(config);
        if self.client_mode.is_local() {
            self.set_state(NetplayState::Initial)?;
        }
        Ok(())
    }

    /// Binds and connects what the role needs. Nothing of the config is applied yet when
    /// this fails.
    fn open_endpoints(&mut self, config: &mut NetplayConfig) -> Result<(), NetplayError> {
        let port = self.address.as_ref().map_or(0, |a| a.port);
        match self.client_mode.role {
            Role::Host => {
                self.transport.listen(Channel::Control, port)?;
                self.transport.listen(Channel::Data, port)?;
            },
            Role::Client => {
                let address = self
                    .address
                    .clone()
                    .ok_or_else(|| NetplayError::InvalidHostConfig {
                        info: "client has no host address".to_owned(),
                    })?;
                self.transport.listen(Channel::Control, 0)?;
                self.connecting = Some(self.transport.connect(Channel::Data, &address)?);
            },
            Role::Broadcast => {
                config.broadcast_port = self
                    .transport
                    .listen(Channel::Control, config.broadcast_port)?;
            },
            Role::Offline | Role::Spectate | Role::Unknown => {},
        }
        Ok(())
    }

    fn accept_spectate_config(&mut self, config: SpectateConfig) -> Result<(), NetplayError> {
        if !self.client_mode.is_spectate() {
            report_violation_to!(
                self.observer,
                self.current,
                ViolationSeverity::Warning,
                ViolationKind::Configuration,
                "spectate config for {} role",
                self.client_mode
            );
            return Ok(());
        }
        if self.spectate_config.is_some() {
            self.config_ignored("spectate config");
            return Ok(());
        }
        if let Err(err) = config.validate() {
            return self.terminate(err);
        }
        self.sync.set_delay(config.delay);
        self.host.apply_initial_state(&config.initial);
        tracing::info!(session = %config.session_id, mode = ?config.initial.mode, "spectating");
        self.spectate_config = Some(config);
        if let Some(broadcaster) = self.broadcaster.clone() {
            self.send(Channel::Control, &broadcaster, &NetplayMessage::ConfirmConfig);
        }
        self.set_state(NetplayState::Initial)
    }

    // ==========================================
    // Transport Events
    // ==========================================

    fn on_transport_event(&mut self, event: TransportEvent<T::Address>) -> Result<(), NetplayError> {
        match event {
            TransportEvent::Accepted { channel, peer } => self.on_accepted(channel, peer),
            TransportEvent::Connected { channel, peer } => self.on_connected(channel, peer),
            TransportEvent::Received { channel, from, msg } => self.on_message(channel, from, msg),
            TransportEvent::Disconnected { channel, peer } => {
                self.on_disconnected(channel, &peer);
                Ok(())
            },
        }
    }

    fn on_accepted(&mut self, channel: Channel, peer: T::Address) -> Result<(), NetplayError> {
        match channel {
            Channel::Control => {
                tracing::debug!(?peer, "control connection accepted");
                let msg = NetplayMessage::VersionConfig {
                    version: self.version.clone(),
                    mode: self.client_mode,
                };
                self.send(Channel::Control, &peer, &msg);
                self.timers.start(
                    TimerKind::Pending(peer.clone()),
                    self.timing.pending_spectator_timeout,
                );
                self.relay.add_pending(peer);
                Ok(())
            },
            Channel::Data => self.on_data_connected(peer),
        }
    }

    fn on_connected(&mut self, channel: Channel, peer: T::Address) -> Result<(), NetplayError> {
        match channel {
            Channel::Data => {
                self.connecting = None;
                self.on_data_connected(peer)
            },
            Channel::Control => {
                tracing::debug!(?peer, "connected to broadcaster");
                Ok(())
            },
        }
    }

    fn on_data_connected(&mut self, peer: T::Address) -> Result<(), NetplayError> {
        if self.data_peer.is_some() {
            tracing::warn!(?peer, "second data connection refused");
            self.transport.disconnect(Channel::Data, &peer);
            return Ok(());
        }
        tracing::info!(?peer, "data channel connected");
        self.timers.cancel(&TimerKind::InitialConnect);
        self.data_peer = Some(peer.clone());
        if let Some(config) = self.config.clone() {
            self.send(Channel::Data, &peer, &NetplayMessage::NetplayConfig(config));
        }
        self.push_event(NetplayEvent::DataConnected { addr: peer });
        if self.state == NetplayState::PreInitial {
            self.set_state(NetplayState::Initial)?;
        }
        Ok(())
    }

    fn on_disconnected(&mut self, channel: Channel, peer: &T::Address) {
        match channel {
            Channel::Data if self.connecting.as_ref() == Some(peer) => {
                self.connecting = None;
                if self.state != NetplayState::PreInitial {
                    return;
                }
                let Some(address) = self.address.clone() else {
                    return;
                };
                tracing::debug!(%address, "host not reachable yet, reconnecting");
                match self.transport.connect(Channel::Data, &address) {
                    Ok(peer) => self.connecting = Some(peer),
                    Err(err) => tracing::warn!(%err, "reconnect failed"),
                }
            },
            Channel::Data if self.data_peer.as_ref() == Some(peer) => {
                tracing::info!(?peer, "data channel disconnected");
                self.data_peer = None;
                if !self.lazy_disconnect {
                    self.delayed_stop(DISCONNECTED);
                }
            },
            Channel::Control if self.broadcaster.as_ref() == Some(peer) => {
                tracing::info!(?peer, "broadcaster disconnected");
                self.broadcaster = None;
                self.delayed_stop(DISCONNECTED);
            },
            Channel::Control => {
                self.timers.cancel(&TimerKind::Pending(peer.clone()));
                if self.relay.remove(peer) {
                    tracing::info!(?peer, "spectator left");
                    self.push_event(NetplayEvent::SpectatorLeft { addr: peer.clone() });
                }
            },
            Channel::Data => {
                tracing::debug!(?peer, "stale data connection closed");
            },
        }
    }

    fn on_message(
        &mut self,
        channel: Channel,
        from: T::Address,
        msg: NetplayMessage,
    ) -> Result<(), NetplayError> {
        tracing::trace!(?channel, ?from, ?msg, "received");
        let mode = self.client_mode;
        match msg {
            NetplayMessage::VersionConfig { version, mode: remote } => {
                self.on_version_config(from, &version, remote)
            },
            NetplayMessage::ConfirmConfig if self.relay.is_pending(&from) => {
                self.admit_spectator(from);
                Ok(())
            },
            NetplayMessage::SpectateConfig(config) if mode.is_spectate() => {
                self.accept_spectate_config(config)
            },
            NetplayMessage::NetplayConfig(remote) if mode.is_netplay() => {
                self.on_remote_config(&remote)
            },
            NetplayMessage::PlayerInputs { start, inputs } if mode.is_netplay() => {
                self.sync
                    .receive_inputs(self.sync.remote_player(), start, &inputs);
                Ok(())
            },
            NetplayMessage::BothInputs { start, inputs } if mode.is_spectate() => {
                self.sync.receive_both_inputs(start, &inputs);
                Ok(())
            },
            NetplayMessage::MenuIndex { index, menu_index } if mode.is_netplay() => {
                self.sync.set_remote_menu(index, menu_index);
                Ok(())
            },
            NetplayMessage::MenuIndex { index, menu_index } if mode.is_spectate() => {
                self.sync.set_local_menu(index, menu_index);
                self.sync.set_remote_menu(index, menu_index);
                Ok(())
            },
            NetplayMessage::RngState(state) if self.consensus.role() == ConsensusRole::Consumer => {
                self.relay
                    .forward(&mut *self.transport, &NetplayMessage::RngState(state.clone()));
                self.consensus.receive(state);
                Ok(())
            },
            NetplayMessage::SyncHash(hash) if mode.is_netplay() => {
                if self.desync.detection() == DesyncDetection::Off {
                    return Ok(());
                }
                match self.desync.push_remote(hash) {
                    Some((local, remote)) => self.desync_detected(local, remote),
                    None => Ok(()),
                }
            },
            NetplayMessage::InitialGameState {
                training,
                mode: initial,
                start,
            } if mode.is_spectate() => {
                tracing::info!(?initial, %start, training, "stream start");
                self.client_mode.training = training;
                self.stream_start = Some((initial, start));
                self.sync.begin_stream(start);
                Ok(())
            },
            NetplayMessage::ErrorMessage { text } => {
                self.delayed_stop(&text);
                Ok(())
            },
            other => {
                report_violation_to!(
                    self.observer,
                    self.current,
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "unexpected {} on {:?} for {}",
                    other.kind(),
                    channel,
                    mode
                );
                Ok(())
            },
        }
    }

    fn on_version_config(
        &mut self,
        from: T::Address,
        remote: &Version,
        remote_mode: ClientMode,
    ) -> Result<(), NetplayError> {
        let level = 1 + self.strict_version;
        let compatible = self.version.similar(remote, level);

        if self.client_mode.is_spectate() {
            if !compatible {
                return self.terminate(NetplayError::IncompatibleVersion {
                    local: self.version.describe(self.strict_version),
                    remote: remote.describe(self.strict_version),
                });
            }
            tracing::info!(%remote, mode = %remote_mode, "broadcaster version accepted");
            let msg = NetplayMessage::VersionConfig {
                version: self.version.clone(),
                mode: self.client_mode,
            };
            self.send(Channel::Control, &from, &msg);
            return Ok(());
        }

        if !self.relay.is_pending(&from) {
            report_violation_to!(
                self.observer,
                self.current,
                ViolationSeverity::Warning,
                ViolationKind::Spectator,
                "version from {:?} outside a handshake",
                from
            );
            return Ok(());
        }
        if !compatible {
            tracing::warn!(
                ?from,
                local = %self.version.describe(self.strict_version),
                remote = %remote.describe(self.strict_version),
                "incompatible spectator refused"
            );
            self.refuse(&from);
            return Ok(());
        }
        let Some(config) = self.spectate_config_for_peer() else {
            tracing::warn!(?from, "spectator refused, no match configured");
            self.refuse(&from);
            return Ok(());
        };
        self.send(Channel::Control, &from, &NetplayMessage::SpectateConfig(config));
        Ok(())
    }

    fn refuse(&mut self, peer: &T::Address) {
        self.relay.pop_pending(peer);
        self.timers.cancel(&TimerKind::Pending(peer.clone()));
        self.transport.disconnect(Channel::Control, peer);
    }

    fn stream_mode(&self) -> InitialMode {
        if self.state <= NetplayState::CharaSelect {
            InitialMode::CharaSelect
        } else {
            InitialMode::InGame
        }
    }

    fn spectate_config_for_peer(&self) -> Option<SpectateConfig> {
        let config = self.config.as_ref()?;
        Some(SpectateConfig {
            delay: config.delay,
            rollback: config.rollback,
            win_count: config.win_count,
            names: config.names.clone(),
            session_id: config.session_id.clone(),
            initial: InitialMatchState {
                mode: self.stream_mode(),
                ..InitialMatchState::default()
            },
        })
    }

    fn admit_spectator(&mut self, addr: T::Address) {
        let pos = SpectatorRelay::<T::Address>::bootstrap_position(
            self.state,
            self.current,
            self.game_start_index,
        );
        self.timers.cancel(&TimerKind::Pending(addr.clone()));
        if !self.relay.admit(addr.clone(), pos) {
            return;
        }
        let start = NetplayMessage::InitialGameState {
            training: self.client_mode.training,
            mode: self.stream_mode(),
            start: pos,
        };
        self.send(Channel::Control, &addr, &start);
        let retained: Vec<_> = self.consensus.history_from(pos.index).cloned().collect();
        for state in retained {
            self.send(Channel::Control, &addr, &NetplayMessage::RngState(state));
        }
        self.push_event(NetplayEvent::SpectatorJoined { addr, pos });
    }

    fn on_remote_config(&mut self, remote: &NetplayConfig) -> Result<(), NetplayError> {
        let Some(local) = self.config.as_ref() else {
            report_violation_to!(
                self.observer,
                self.current,
                ViolationSeverity::Warning,
                ViolationKind::Configuration,
                "remote config before local config"
            );
            return Ok(());
        };
        if let Some(field) = local.mismatch_field(remote) {
            return self.terminate(NetplayError::ConfigMismatch { field });
        }
        tracing::info!("remote config confirmed");
        self.remote_config_confirmed = true;
        Ok(())
    }

    // ==========================================
    // Timers
    // ==========================================

    fn on_timer(&mut self, kind: TimerKind<T::Address>) -> Result<(), NetplayError> {
        match kind {
            TimerKind::Resend => {
                if self.state == NetplayState::RetryMenu {
                    let index = self.current.index;
                    let unresolved = self.sync.local_menu(index).filter(|_| !self.menu_applied);
                    if let Some(selection) = unresolved {
                        self.send_data(&NetplayMessage::MenuIndex {
                            index,
                            menu_index: selection,
                        });
                        self.timers
                            .start(TimerKind::Resend, self.timing.resend_interval);
                    }
                } else if self.waiting {
                    tracing::trace!(frame = %self.current, "resending inputs");
                    self.send_inputs();
                    self.timers
                        .start(TimerKind::Resend, self.timing.resend_interval);
                }
            },
            TimerKind::InitialConnect => {
                if self.data_peer.is_none() {
                    self.delayed_stop("Timed out!");
                }
            },
            TimerKind::DelayedStop => self.stop(),
            TimerKind::Pending(peer) => {
                if self.relay.pop_pending(&peer) {
                    tracing::info!(?peer, "pending spectator timed out");
                    self.transport.disconnect(Channel::Control, &peer);
                }
            },
        }
        Ok(())
    }

    // ==========================================
    // Sending
    // ==========================================

    fn send(&mut self, channel: Channel, to: &T::Address, msg: &NetplayMessage) {
        if let Err(err) = self.transport.send(channel, to, msg) {
            tracing::warn!(?to, kind = msg.kind(), %err, "send failed");
        }
    }

    fn send_data(&mut self, msg: &NetplayMessage) {
        if let Some(peer) = self.data_peer.clone() {
            self.send(Channel::Data, &peer, msg);
        }
    }

    fn send_inputs(&mut self) {
        if !self.client_mode.is_netplay()
            || self.state < NetplayState::CharaSelect
            || self.state == NetplayState::RetryMenu
        {
            return;
        }
        let Some(peer) = self.data_peer.clone() else {
            return;
        };
        let local = self.local_player();
        for msg in self.sync.inputs_messages(local, self.current) {
            self.send(Channel::Data, &peer, &msg);
        }
    }

    // ==========================================
    // Stopping
    // ==========================================

    fn push_event(&mut self, event: NetplayEvent<T::Address>) {
        if self.events.len() >= self.event_queue_size {
            self.events.pop_front();
            tracing::warn!("event queue full, dropped oldest event");
        }
        self.events.push_back(event);
    }

    /// Reports `reason` and stops after the grace period.
    fn delayed_stop(&mut self, reason: &str) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        tracing::info!(reason, "stopping");
        self.lifecycle = Lifecycle::Stopping;
        if !reason.is_empty() {
            self.push_event(NetplayEvent::Error {
                message: reason.to_owned(),
            });
        }
        self.timers
            .start(TimerKind::DelayedStop, self.timing.delayed_stop);
    }

    fn stop(&mut self) {
        self.disconnect_all();
        self.timers.clear();
        self.waiting = false;
        self.lifecycle = Lifecycle::Stopped;
        self.push_event(NetplayEvent::Stopped);
    }

    fn disconnect_all(&mut self) {
        if let Some(peer) = self.data_peer.take() {
            self.transport.disconnect(Channel::Data, &peer);
        }
        if let Some(peer) = self.broadcaster.take() {
            self.transport.disconnect(Channel::Control, &peer);
        }
        for peer in self.relay.clear() {
            self.timers.cancel(&TimerKind::Pending(peer.clone()));
            self.transport.disconnect(Channel::Control, &peer);
        }
    }

    fn desync_detected<R>(&mut self, local: SyncHash, remote: SyncHash) -> Result<R, NetplayError> {
        self.push_event(NetplayEvent::DesyncDetected {
            local: local.indexed_frame,
            remote: remote.indexed_frame,
        });
        self.terminate(NetplayError::Desync {
            local: local.indexed_frame,
            remote: remote.indexed_frame,
        })
    }

    /// Ends the session for good and returns `err`.
    fn terminate<R>(&mut self, err: NetplayError) -> Result<R, NetplayError> {
        tracing::error!(%err, frame = %self.current, state = %self.state, "session terminated");
        self.push_event(NetplayEvent::Error {
            message: err.to_string(),
        });
        self.disconnect_all();
        self.timers.clear();
        self.waiting = false;
        self.lifecycle = Lifecycle::Terminated;
        Err(err)
    }
}

impl<T: Config> std::fmt::Debug for NetplaySession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetplaySession")
            .field("client_mode", &self.client_mode)
            .field("state", &self.state)
            .field("lifecycle", &self.lifecycle)
            .field("current", &self.current)
            .field("game_start_index", &self.game_start_index)
            .field("data_peer", &self.data_peer)
            .field("spectators", &self.relay.len())
            .field("waiting", &self.waiting)
            .field("rerun_stop", &self.rerun_stop)
            .finish_non_exhaustive()
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
    use crate::telemetry::CollectingObserver;
    use crate::{InputBits, SessionBuilder};

    struct TestConfig;

    impl Config for TestConfig {
        type Address = u32;
        type Snapshot = ();
    }

    struct IdleHost;

    impl HostAdapter<()> for IdleHost {
        fn phase_signal(&self) -> u32 {
            0
        }

        fn flag(&self, _flag: HostFlag) -> u32 {
            0
        }

        fn write_input(&mut self, _player: PlayerNumber, _bits: InputBits) {}

        fn capture_snapshot(&mut self) {}

        fn restore_snapshot(&mut self, _snapshot: &()) {}

        fn read_rng(&self) -> Vec<u8> {
            Vec::new()
        }

        fn write_rng(&mut self, _state: &[u8]) {}
    }

    struct NullTransport;

    impl Transport<u32> for NullTransport {
        fn listen(&mut self, _channel: Channel, port: u16) -> Result<u16, NetplayError> {
            Ok(port)
        }

        fn connect(&mut self, _channel: Channel, _target: &IpAddrPort) -> Result<u32, NetplayError> {
            Ok(1)
        }

        fn send(&mut self, _channel: Channel, _to: &u32, _msg: &NetplayMessage) -> Result<(), NetplayError> {
            Ok(())
        }

        fn disconnect(&mut self, _channel: Channel, _peer: &u32) {}

        fn poll(&mut self, _timeout: Duration) -> Vec<TransportEvent<u32>> {
            Vec::new()
        }
    }

    const TABLE: PhaseTable = PhaseTable {
        startup: 65535,
        opening: 3,
        title: 2,
        main: 25,
        loading_demo: 13,
        high_scores: 11,
        chara_select: 20,
        loading: 8,
        in_game: 1,
        retry: 5,
    };

    /// An offline session that reached `Initial`.
    fn offline(training: bool, observer: Arc<CollectingObserver>) -> NetplaySession<TestConfig> {
        let mode = ClientMode::new(Role::Offline, training);
        let mut session = SessionBuilder::<TestConfig>::new()
            .with_client_mode(mode)
            .with_violation_observer(observer)
            .start_session(IdleHost, NullTransport)
            .unwrap();
        session
            .handle_control(ControlMessage::NetplayConfig(NetplayConfig {
                mode,
                ..NetplayConfig::default()
            }))
            .unwrap();
        assert_eq!(session.state(), NetplayState::Initial);
        session
    }

    fn mode_change(session: &mut NetplaySession<TestConfig>, previous: u32, current: u32) -> Result<(), NetplayError> {
        session.on_host_signal(HostSignal::GameModeChanged { previous, current })
    }

    // ==========================================
    // Phase Mapping Tests
    // ==========================================

    #[test]
    fn versus_match_walks_through_every_phase() {
        let mut session = offline(false, Arc::new(CollectingObserver::new()));
        assert_eq!(session.current_frame(), IndexedFrame::start_of(1));

        mode_change(&mut session, TABLE.title, TABLE.chara_select).unwrap();
        assert_eq!(session.state(), NetplayState::CharaSelect);
        assert_eq!(session.current_frame(), IndexedFrame::start_of(2));

        mode_change(&mut session, TABLE.chara_select, TABLE.loading).unwrap();
        assert_eq!(session.state(), NetplayState::Loading);
        assert_eq!(session.game_start_index(), 4);

        mode_change(&mut session, TABLE.loading, TABLE.in_game).unwrap();
        assert_eq!(session.state(), NetplayState::Skippable);
        assert_eq!(session.current_frame(), IndexedFrame::start_of(4));

        session.on_host_signal(HostSignal::RoundStarted).unwrap();
        assert_eq!(session.state(), NetplayState::InGame);
        assert_eq!(session.current_frame(), IndexedFrame::start_of(5));

        mode_change(&mut session, TABLE.in_game, TABLE.retry).unwrap();
        assert_eq!(session.state(), NetplayState::RetryMenu);
        assert_eq!(session.last_game().map(|game| game.first_index), Some(4));
    }

    #[test]
    fn training_goes_straight_in_game_and_ignores_skippable() {
        let mut session = offline(true, Arc::new(CollectingObserver::new()));
        mode_change(&mut session, TABLE.title, TABLE.chara_select).unwrap();
        mode_change(&mut session, TABLE.chara_select, TABLE.loading).unwrap();
        mode_change(&mut session, TABLE.loading, TABLE.in_game).unwrap();
        assert_eq!(session.state(), NetplayState::InGame);

        let at = session.current_frame();
        session
            .on_host_signal(HostSignal::SkippableChanged {
                previous: 0,
                current: 1,
            })
            .unwrap();
        assert_eq!(session.state(), NetplayState::InGame);
        assert_eq!(session.current_frame(), at);
    }

    #[test]
    fn unmapped_game_mode_terminates() {
        let mut session = offline(false, Arc::new(CollectingObserver::new()));
        mode_change(&mut session, TABLE.title, TABLE.chara_select).unwrap();

        assert_eq!(
            mode_change(&mut session, TABLE.chara_select, 77),
            Err(NetplayError::InvalidGameMode {
                previous: TABLE.chara_select,
                current: 77
            })
        );
        assert_eq!(session.lifecycle(), Lifecycle::Terminated);
        assert_eq!(
            session.on_host_signal(HostSignal::RoundStarted),
            Err(NetplayError::SessionTerminated)
        );
        assert!(session
            .events()
            .any(|event| matches!(event, NetplayEvent::Error { .. })));
    }

    #[test]
    fn attract_mode_is_only_legal_before_the_match() {
        let observer = Arc::new(CollectingObserver::new());
        let mut session = offline(false, observer.clone());
        mode_change(&mut session, TABLE.startup, TABLE.title).unwrap();
        mode_change(&mut session, TABLE.loading_demo, TABLE.in_game).unwrap();
        assert_eq!(session.state(), NetplayState::Initial);
        assert!(observer.is_empty());

        mode_change(&mut session, TABLE.title, TABLE.chara_select).unwrap();
        mode_change(&mut session, TABLE.chara_select, TABLE.main).unwrap();
        assert_eq!(session.state(), NetplayState::CharaSelect);
        assert!(observer.has_violation(ViolationKind::PhaseTransition));
    }

    #[test]
    fn repeated_transition_is_reported_and_ignored() {
        let observer = Arc::new(CollectingObserver::new());
        let mut session = offline(true, observer.clone());
        mode_change(&mut session, TABLE.title, TABLE.chara_select).unwrap();
        let at = session.current_frame();

        mode_change(&mut session, TABLE.chara_select, TABLE.chara_select).unwrap();
        assert_eq!(session.current_frame(), at);
        assert!(observer.has_violation(ViolationKind::PhaseTransition));
    }
}
