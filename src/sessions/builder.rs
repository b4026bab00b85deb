use std::sync::Arc;

use crate::sessions::netplay_session::SessionSettings;
use crate::{
    telemetry::ViolationObserver, ClientMode, Config, DesyncDetection, HostAdapter,
    NetplayError, NetplaySession, PhaseTable, TimingConfig, Transport, Version,
};

/// Default desync detection mode.
///
/// Defaults to `On { interval: 300 }`, one checkpoint every five seconds at 60fps. A
/// checkpoint costs one digest of the shared generator state and one small message.
const DEFAULT_DETECTION_MODE: DesyncDetection = DesyncDetection::On { interval: 300 };
/// Default version strictness: only the major version has to match.
const DEFAULT_STRICT_VERSION: u8 = 0;
/// Highest meaningful version strictness, see [`Version::similar`].
const MAX_STRICT_VERSION: u8 = 3;
/// Default event queue size.
/// Events older than this threshold may be dropped if not polled.
const DEFAULT_EVENT_QUEUE_SIZE: usize = 100;
/// Smallest event queue a session may be built with.
const MIN_EVENT_QUEUE_SIZE: usize = 10;

/// The [`SessionBuilder`] builds every kind of [`NetplaySession`].
///
/// The role may be fixed here with [`with_client_mode`](Self::with_client_mode) or left
/// to the orchestrator, which sends it as the first control message.
///
/// ```
/// use fortress_netplay::{ClientMode, Config, DesyncDetection, SessionBuilder, TimingConfig};
///
/// # struct MyConfig;
/// # impl Config for MyConfig {
/// #     type Address = std::net::SocketAddr;
/// #     type Snapshot = Vec<u8>;
/// # }
/// let builder = SessionBuilder::<MyConfig>::new()
///     .with_client_mode(ClientMode::host())
///     .with_desync_detection(DesyncDetection::On { interval: 60 })
///     .with_timing(TimingConfig::lan());
/// ```
#[must_use = "SessionBuilder must be consumed by calling start_session"]
pub struct SessionBuilder<T>
where
    T: Config,
{
    client_mode: ClientMode,
    timing: TimingConfig,
    desync_detection: DesyncDetection,
    version: Version,
    /// How much of the version has to match, see [`Version::similar`].
    strict_version: u8,
    phase_table: PhaseTable,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    /// Maximum number of events to queue before oldest are dropped.
    event_queue_size: usize,
    marker: std::marker::PhantomData<T>,
}

impl<T: Config> std::fmt::Debug for SessionBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            client_mode,
            timing,
            desync_detection,
            version,
            strict_version,
            phase_table,
            violation_observer,
            event_queue_size,
            marker: _,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("client_mode", client_mode)
            .field("timing", timing)
            .field("desync_detection", desync_detection)
            .field("version", version)
            .field("strict_version", strict_version)
            .field("phase_table", phase_table)
            .field("has_violation_observer", &violation_observer.is_some())
            .field("event_queue_size", event_queue_size)
            .finish()
    }
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            client_mode: ClientMode::default(),
            timing: TimingConfig::default(),
            desync_detection: DEFAULT_DETECTION_MODE,
            version: Version::current(),
            strict_version: DEFAULT_STRICT_VERSION,
            phase_table: PhaseTable::default(),
            violation_observer: None,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            marker: std::marker::PhantomData,
        }
    }

    /// Fixes the session role up front instead of waiting for the orchestrator.
    pub fn with_client_mode(mut self, client_mode: ClientMode) -> Self {
        self.client_mode = client_mode;
        self
    }

    /// Sets poll, resend and timeout intervals.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Sets the desync detection mode. With desync detection, the peers exchange digests
    /// of the shared generator state at fixed intervals and terminate on a mismatch.
    pub fn with_desync_detection(mut self, desync_detection: DesyncDetection) -> Self {
        self.desync_detection = desync_detection;
        self
    }

    /// Overrides the version advertised in handshakes. Mostly useful in tests.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Sets how much of a remote version has to match for a connection to be accepted.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] above the highest strictness level.
    pub fn with_strict_version(mut self, strict_version: u8) -> Result<Self, NetplayError> {
        if strict_version > MAX_STRICT_VERSION {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "strict version must be at most {MAX_STRICT_VERSION}, got {strict_version}"
                ),
            });
        }
        self.strict_version = strict_version;
        Ok(self)
    }

    /// Sets the game-mode codes the host reports for each phase.
    pub fn with_phase_table(mut self, phase_table: PhaseTable) -> Self {
        self.phase_table = phase_table;
        self
    }

    /// Sets a custom observer for protocol violations.
    ///
    /// When a violation occurs during session operation (e.g., a message for the wrong
    /// role or a phase signal out of order), it will be reported to this observer.
    /// This enables programmatic monitoring, custom logging, or test assertions.
    ///
    /// If no observer is set, violations are logged via the `tracing` crate by default.
    ///
    /// # Example
    ///
    /// ```
    /// use fortress_netplay::{SessionBuilder, Config, telemetry::CollectingObserver};
    /// use std::sync::Arc;
    ///
    /// # struct MyConfig;
    /// # impl Config for MyConfig {
    /// #     type Address = std::net::SocketAddr;
    /// #     type Snapshot = Vec<u8>;
    /// # }
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = SessionBuilder::<MyConfig>::new()
    ///     .with_violation_observer(observer.clone());
    ///
    /// // After session operations, check for violations
    /// // assert!(observer.violations().is_empty());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Sets the maximum number of queued events before the oldest are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] for sizes below 10.
    pub fn with_event_queue_size(mut self, event_queue_size: usize) -> Result<Self, NetplayError> {
        if event_queue_size < MIN_EVENT_QUEUE_SIZE {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "event queue size must be at least {MIN_EVENT_QUEUE_SIZE}, got {event_queue_size}"
                ),
            });
        }
        self.event_queue_size = event_queue_size;
        Ok(self)
    }

    /// Consumes the builder to create a [`NetplaySession`] observing `host` and talking
    /// through `transport`.
    ///
    /// The session starts in [`NetplayState::PreInitial`](crate::NetplayState::PreInitial)
    /// and waits for control messages.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if the timing configuration, the phase
    /// table or the desync interval is invalid.
    pub fn start_session<H, X>(self, host: H, transport: X) -> Result<NetplaySession<T>, NetplayError>
    where
        H: HostAdapter<T::Snapshot> + 'static,
        X: Transport<T::Address> + 'static,
    {
        self.timing.validate()?;
        self.phase_table.validate()?;
        if self.desync_detection == (DesyncDetection::On { interval: 0 }) {
            return Err(NetplayError::InvalidRequest {
                info: "desync detection interval must be at least 1".to_owned(),
            });
        }

        let settings = SessionSettings {
            client_mode: self.client_mode,
            timing: self.timing,
            desync_detection: self.desync_detection,
            version: self.version,
            strict_version: self.strict_version,
            phase_table: self.phase_table,
            observer: self.violation_observer,
            event_queue_size: self.event_queue_size,
        };
        Ok(NetplaySession::new(
            settings,
            Box::new(host),
            Box::new(transport),
        ))
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
    use crate::network::control::IpAddrPort;
    use crate::{
        Channel, HostFlag, InputBits, NetplayMessage, NetplayState, PlayerNumber, TransportEvent,
    };
    use web_time::Duration;

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

    #[test]
    fn defaults_build_a_pre_initial_session() {
        let session = SessionBuilder::<TestConfig>::new()
            .start_session(IdleHost, NullTransport)
            .unwrap();
        assert_eq!(session.state(), NetplayState::PreInitial);
        assert!(!session.client_mode().is_known());
    }

    #[test]
    fn client_mode_can_be_fixed_up_front() {
        let session = SessionBuilder::<TestConfig>::new()
            .with_client_mode(ClientMode::host())
            .start_session(IdleHost, NullTransport)
            .unwrap();
        assert!(session.client_mode().is_host());
    }

    #[test]
    fn tiny_event_queue_is_rejected() {
        let result = SessionBuilder::<TestConfig>::new().with_event_queue_size(5);
        assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
    }

    #[test]
    fn strict_version_is_bounded() {
        assert!(SessionBuilder::<TestConfig>::new()
            .with_strict_version(3)
            .is_ok());
        assert!(SessionBuilder::<TestConfig>::new()
            .with_strict_version(4)
            .is_err());
    }

    #[test]
    fn zero_desync_interval_is_rejected() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_desync_detection(DesyncDetection::On { interval: 0 })
            .start_session(IdleHost, NullTransport);
        assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
    }

    #[test]
    fn duplicate_phase_codes_are_rejected() {
        let table = PhaseTable {
            loading: 1,
            in_game: 1,
            ..PhaseTable::default()
        };
        let result = SessionBuilder::<TestConfig>::new()
            .with_phase_table(table)
            .start_session(IdleHost, NullTransport);
        assert!(result.is_err());
    }

    #[test]
    fn invalid_timing_is_rejected() {
        let timing = TimingConfig {
            spectator_batch: 0,
            ..TimingConfig::default()
        };
        let result = SessionBuilder::<TestConfig>::new()
            .with_timing(timing)
            .start_session(IdleHost, NullTransport);
        assert!(result.is_err());
    }

    #[test]
    fn debug_lists_every_setting() {
        let text = format!("{:?}", SessionBuilder::<TestConfig>::new());
        assert!(text.contains("desync_detection"));
        assert!(text.contains("has_violation_observer: false"));
        assert!(text.contains("event_queue_size: 100"));
    }
}
