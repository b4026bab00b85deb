//! Configuration types for netplay sessions.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `NetplayConfig` | Negotiated match parameters | - |
//! | `SpectateConfig` | What a spectator is told by the broadcaster | - |
//! | `TimingConfig` | Poll, resend and timeout intervals | `lan()`, `high_latency()` |
//! | `PhaseTable` | Host game-mode codes | `default()` |
//!
//! # Example
//!
//! ```
//! use fortress_netplay::{ClientMode, NetplayConfig, TimingConfig};
//!
//! let config = NetplayConfig {
//!     delay: 2,
//!     win_count: 2,
//!     host_player: 1,
//!     mode: ClientMode::host(),
//!     ..NetplayConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! assert!(TimingConfig::lan().validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use web_time::Duration;

use crate::error::NetplayError;
use crate::input_sync::MAX_ROLLBACK;
use crate::ClientMode;

/// Delay value the orchestrator uses for "not chosen yet".
pub const INVALID_DELAY: u8 = 0xFF;

/// Negotiated match parameters.
///
/// Host and client each receive one from their orchestrator and exchange it once the data
/// channel is up. The fields compared by [`mismatch_field`](Self::mismatch_field) must
/// agree, otherwise the session terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetplayConfig {
    /// Input delay in frames.
    ///
    /// Default: 0
    pub delay: u8,
    /// Rollback depth in frames. 0 means delay-only lockstep.
    ///
    /// Default: 0
    pub rollback: u8,
    /// Rounds needed to win the match.
    ///
    /// Default: 2
    pub win_count: u8,
    /// Which player (1 or 2) the host controls.
    ///
    /// Default: 1
    pub host_player: u8,
    /// Identifier shared by both peers of one match.
    pub session_id: String,
    /// Display names of player one and two.
    pub names: [String; 2],
    /// Control port a broadcast session listens on. Reported back once bound.
    pub broadcast_port: u16,
    /// Role and match flags.
    pub mode: ClientMode,
}

impl Default for NetplayConfig {
    fn default() -> Self {
        Self {
            delay: 0,
            rollback: 0,
            win_count: 2,
            host_player: 1,
            session_id: String::new(),
            names: [String::new(), String::new()],
            broadcast_port: 0,
            mode: ClientMode::default(),
        }
    }
}

impl NetplayConfig {
    /// Checks that the configuration can be used.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidHostConfig`] for the unset delay marker, a host
    /// player other than 1 or 2 in netplay roles, or a rollback depth above
    /// [`MAX_ROLLBACK`].
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.delay == INVALID_DELAY {
            return Err(NetplayError::InvalidHostConfig {
                info: "input delay is not set".to_owned(),
            });
        }
        if self.mode.is_netplay() && !matches!(self.host_player, 1 | 2) {
            return Err(NetplayError::InvalidHostConfig {
                info: format!("host player must be 1 or 2, got {}", self.host_player),
            });
        }
        if usize::from(self.rollback) > MAX_ROLLBACK {
            return Err(NetplayError::InvalidHostConfig {
                info: format!(
                    "rollback must be at most {MAX_ROLLBACK}, got {}",
                    self.rollback
                ),
            });
        }
        Ok(())
    }

    /// First negotiated field that differs between the two peers' configurations.
    #[must_use]
    pub fn mismatch_field(&self, other: &Self) -> Option<&'static str> {
        if self.delay != other.delay {
            Some("delay")
        } else if self.rollback != other.rollback {
            Some("rollback")
        } else if self.win_count != other.win_count {
            Some("win_count")
        } else if self.host_player != other.host_player {
            Some("host_player")
        } else if self.session_id != other.session_id {
            Some("session_id")
        } else {
            None
        }
    }
}

/// Phase a spectator starts from.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitialMode {
    /// Not set; invalid in a [`SpectateConfig`].
    #[default]
    Unknown,
    /// The broadcaster is in character select.
    CharaSelect,
    /// The broadcaster is in a game that the spectator replays from its start.
    InGame,
}

/// Host setup a spectator needs before it can replay the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InitialMatchState {
    /// Phase the stream starts in.
    pub mode: InitialMode,
    /// Stage selected on the broadcaster.
    pub stage: u32,
    /// Character per player.
    pub chara: [u8; 2],
    /// Character variant per player.
    pub moon: [u8; 2],
}

/// Configuration a spectator receives from the session it watches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectateConfig {
    /// Input delay of the watched match.
    pub delay: u8,
    /// Rollback depth of the watched match.
    pub rollback: u8,
    /// Rounds needed to win.
    pub win_count: u8,
    /// Player names.
    pub names: [String; 2],
    /// Session identifier.
    pub session_id: String,
    /// Host setup to start from.
    pub initial: InitialMatchState,
}

impl SpectateConfig {
    /// Checks that the configuration can be used.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidHostConfig`] if the initial mode is unknown or the
    /// delay is the unset marker.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.initial.mode == InitialMode::Unknown {
            return Err(NetplayError::InvalidHostConfig {
                info: "spectate config has no initial mode".to_owned(),
            });
        }
        if self.delay == INVALID_DELAY {
            return Err(NetplayError::InvalidHostConfig {
                info: "spectate config has no input delay".to_owned(),
            });
        }
        Ok(())
    }
}

/// Poll, resend and timeout intervals.
///
/// # Forward Compatibility
///
/// New fields may be added to this struct in future versions. Construct instances with
/// `..TimingConfig::default()`.
///
/// ```
/// use fortress_netplay::TimingConfig;
/// use web_time::Duration;
///
/// let timing = TimingConfig {
///     resend_interval: Duration::from_millis(50),
///     ..TimingConfig::default()
/// };
/// assert!(timing.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "TimingConfig has no effect unless passed to SessionBuilder::with_timing()"]
pub struct TimingConfig {
    /// Transport wait per poll step while a frame is pending.
    ///
    /// Default: 1ms
    pub poll_timeout: Duration,
    /// Time without remote input before the local inputs are sent again.
    ///
    /// Default: 100ms
    pub resend_interval: Duration,
    /// Grace period between a stop request and the session stopping.
    ///
    /// Default: 100ms
    pub delayed_stop: Duration,
    /// Time the peers have to establish the data channel.
    ///
    /// Default: 10s
    pub initial_connect_timeout: Duration,
    /// Time an accepted control connection has to finish the spectator handshake.
    ///
    /// Default: 10s
    pub pending_spectator_timeout: Duration,
    /// Frames of confirmed input per spectator batch.
    ///
    /// Default: 30
    pub spectator_batch: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1),
            resend_interval: Duration::from_millis(100),
            delayed_stop: Duration::from_millis(100),
            initial_connect_timeout: Duration::from_secs(10),
            pending_spectator_timeout: Duration::from_secs(10),
            spectator_batch: 30,
        }
    }
}

impl TimingConfig {
    /// Creates a new `TimingConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks: quicker resends and connect timeout.
    pub fn lan() -> Self {
        Self {
            resend_interval: Duration::from_millis(50),
            initial_connect_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Preset for high-latency links (100-200ms RTT): slower resends, longer timeouts.
    pub fn high_latency() -> Self {
        Self {
            resend_interval: Duration::from_millis(250),
            delayed_stop: Duration::from_millis(250),
            initial_connect_timeout: Duration::from_secs(20),
            pending_spectator_timeout: Duration::from_secs(20),
            ..Self::default()
        }
    }

    /// Validates the timing configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if any value is out of range.
    pub fn validate(&self) -> Result<(), NetplayError> {
        check_duration("poll_timeout", self.poll_timeout, 0, 1_000)?;
        check_duration("resend_interval", self.resend_interval, 0, 10_000)?;
        check_duration("delayed_stop", self.delayed_stop, 0, 60_000)?;
        check_duration(
            "initial_connect_timeout",
            self.initial_connect_timeout,
            0,
            300_000,
        )?;
        check_duration(
            "pending_spectator_timeout",
            self.pending_spectator_timeout,
            0,
            300_000,
        )?;

        // One batch must fit in the retained input window.
        if self.spectator_batch < 1 || self.spectator_batch > 600 {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "spectator_batch must be in 1..=600, got {}",
                    self.spectator_batch
                ),
            });
        }
        Ok(())
    }
}

fn check_duration(
    field: &'static str,
    value: Duration,
    min_ms: u64,
    max_ms: u64,
) -> Result<(), NetplayError> {
    let actual_ms = value.as_millis();
    if actual_ms < u128::from(min_ms) || actual_ms > u128::from(max_ms) {
        return Err(NetplayError::InvalidRequest {
            info: format!("{field} must be in {min_ms}..={max_ms} ms, got {actual_ms} ms"),
        });
    }
    Ok(())
}

/// Host game-mode codes mapped to match phases.
///
/// The defaults match the host this engine was first written for. Sessions only compare
/// [`HostAdapter::phase_signal`](crate::HostAdapter::phase_signal) values against this
/// table and never interpret them otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "PhaseTable has no effect unless passed to SessionBuilder::with_phase_table()"]
pub struct PhaseTable {
    /// Boot.
    pub startup: u32,
    /// Opening movie.
    pub opening: u32,
    /// Title screen.
    pub title: u32,
    /// Main menu.
    pub main: u32,
    /// Loading the attract demo.
    pub loading_demo: u32,
    /// High score screen.
    pub high_scores: u32,
    /// Character select.
    pub chara_select: u32,
    /// Loading a match.
    pub loading: u32,
    /// In a match.
    pub in_game: u32,
    /// Post-match retry menu.
    pub retry: u32,
}

impl Default for PhaseTable {
    fn default() -> Self {
        Self {
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
        }
    }
}

impl PhaseTable {
    /// `true` for attract and menu modes, which are only legal before a match starts.
    ///
    /// The attract demo passes through the in-game code right after loading, so that
    /// transition is attract mode too.
    #[must_use]
    pub fn is_attract(&self, previous: u32, current: u32) -> bool {
        current == 0
            || current == self.startup
            || current == self.opening
            || current == self.title
            || current == self.main
            || current == self.loading_demo
            || current == self.high_scores
            || (previous == self.loading_demo && current == self.in_game)
    }

    /// Checks that every phase has its own code.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if two fields share a code.
    pub fn validate(&self) -> Result<(), NetplayError> {
        let codes = [
            ("startup", self.startup),
            ("opening", self.opening),
            ("title", self.title),
            ("main", self.main),
            ("loading_demo", self.loading_demo),
            ("high_scores", self.high_scores),
            ("chara_select", self.chara_select),
            ("loading", self.loading),
            ("in_game", self.in_game),
            ("retry", self.retry),
        ];
        for (i, (name, code)) in codes.iter().enumerate() {
            if let Some((other, _)) = codes.iter().skip(i + 1).find(|(_, c)| c == code) {
                return Err(NetplayError::InvalidRequest {
                    info: format!("phase codes {name} and {other} are both {code}"),
                });
            }
        }
        Ok(())
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
    use crate::Role;

    fn host_config() -> NetplayConfig {
        NetplayConfig {
            delay: 2,
            win_count: 2,
            host_player: 1,
            session_id: "abc".to_owned(),
            mode: ClientMode::host(),
            ..NetplayConfig::default()
        }
    }

    // ==========================================
    // NetplayConfig Tests
    // ==========================================

    #[test]
    fn valid_config_passes() {
        assert!(host_config().validate().is_ok());
    }

    #[test]
    fn unset_delay_is_rejected() {
        let config = NetplayConfig {
            delay: INVALID_DELAY,
            ..host_config()
        };
        assert!(matches!(
            config.validate(),
            Err(NetplayError::InvalidHostConfig { .. })
        ));
    }

    #[test]
    fn host_player_checked_only_for_netplay() {
        let netplay = NetplayConfig {
            host_player: 3,
            ..host_config()
        };
        assert!(netplay.validate().is_err());

        let offline = NetplayConfig {
            host_player: 0,
            mode: ClientMode::new(Role::Offline, false),
            ..host_config()
        };
        assert!(offline.validate().is_ok());
    }

    #[test]
    fn rollback_depth_is_bounded() {
        let config = NetplayConfig {
            rollback: 31,
            ..host_config()
        };
        assert!(config.validate().is_err());
        let config = NetplayConfig {
            rollback: 30,
            ..host_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mismatch_reports_first_differing_field() {
        let a = host_config();
        let mut b = host_config();
        b.mode = ClientMode::client();
        b.names[0] = "someone".to_owned();
        assert_eq!(a.mismatch_field(&b), None);

        b.win_count = 3;
        assert_eq!(a.mismatch_field(&b), Some("win_count"));
        b.delay = 4;
        assert_eq!(a.mismatch_field(&b), Some("delay"));
    }

    // ==========================================
    // SpectateConfig Tests
    // ==========================================

    #[test]
    fn spectate_config_requires_initial_mode() {
        let mut config = SpectateConfig::default();
        assert!(config.validate().is_err());
        config.initial.mode = InitialMode::InGame;
        assert!(config.validate().is_ok());
        config.delay = INVALID_DELAY;
        assert!(config.validate().is_err());
    }

    // ==========================================
    // TimingConfig Tests
    // ==========================================

    #[test]
    fn timing_presets_are_valid() {
        assert!(TimingConfig::default().validate().is_ok());
        assert!(TimingConfig::lan().validate().is_ok());
        assert!(TimingConfig::high_latency().validate().is_ok());
    }

    #[test]
    fn timing_rejects_out_of_range() {
        let timing = TimingConfig {
            resend_interval: Duration::from_secs(60),
            ..TimingConfig::default()
        };
        assert!(timing.validate().is_err());

        let timing = TimingConfig {
            spectator_batch: 0,
            ..TimingConfig::default()
        };
        assert!(timing.validate().is_err());
    }

    #[test]
    fn zero_durations_are_allowed_for_tests() {
        let timing = TimingConfig {
            poll_timeout: Duration::ZERO,
            resend_interval: Duration::ZERO,
            delayed_stop: Duration::ZERO,
            ..TimingConfig::default()
        };
        assert!(timing.validate().is_ok());
    }

    // ==========================================
    // PhaseTable Tests
    // ==========================================

    #[test]
    fn attract_codes() {
        let table = PhaseTable::default();
        assert!(table.is_attract(0, 0));
        assert!(table.is_attract(0, table.title));
        assert!(table.is_attract(table.title, table.main));
        assert!(table.is_attract(table.loading_demo, table.in_game));
        assert!(!table.is_attract(table.loading, table.in_game));
        assert!(!table.is_attract(table.main, table.chara_select));
        assert!(!table.is_attract(table.in_game, table.retry));
    }

    #[test]
    fn default_table_has_distinct_codes() {
        assert!(PhaseTable::default().validate().is_ok());
        let table = PhaseTable {
            retry: 1,
            ..PhaseTable::default()
        };
        assert!(table.validate().is_err());
    }
}
