use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::frame_info::IndexedFrame;

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetplayError>`].
///
/// Variants are split into two groups. Protocol violations and desyncs are fatal: the session
/// terminates and every later call returns [`NetplayError::SessionTerminated`]. The remaining
/// variants describe rejected requests and leave the session untouched.
///
/// [`Result<(), NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetplayError {
    /// The host simulation reported a game mode that has no entry in the phase table.
    InvalidGameMode {
        /// Game mode before the change.
        previous: u32,
        /// Game mode after the change.
        current: u32,
    },
    /// A received or configured session configuration cannot be used.
    InvalidHostConfig {
        /// Further specifies which value was rejected.
        info: String,
    },
    /// The remote side runs a version that is not compatible at the configured strictness.
    IncompatibleVersion {
        /// Local version description.
        local: String,
        /// Remote version description.
        remote: String,
    },
    /// Both peers confirmed a configuration but the confirmed values differ.
    ConfigMismatch {
        /// Name of the first field that differs.
        field: &'static str,
    },
    /// The periodic state digests of both peers disagree.
    Desync {
        /// Indexed frame of the oldest unmatched local digest.
        local: IndexedFrame,
        /// Indexed frame of the oldest unmatched remote digest.
        remote: IndexedFrame,
    },
    /// The remote peer is gone and the session cannot continue.
    Disconnected,
    /// The session has already been terminated; no further work is performed.
    SessionTerminated,
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// An internal error occurred that should not happen under normal operation.
    /// If you encounter this error, please report it as a bug.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
    /// A transport operation failed.
    SocketError {
        /// A description of the socket error.
        context: String,
    },
}

impl NetplayError {
    /// Returns `true` if this error terminates the session it was raised in.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidGameMode { .. }
                | Self::InvalidHostConfig { .. }
                | Self::IncompatibleVersion { .. }
                | Self::ConfigMismatch { .. }
                | Self::Desync { .. }
                | Self::Disconnected
                | Self::SessionTerminated
                | Self::InternalError { .. }
        )
    }
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::InvalidGameMode { previous, current } => {
                write!(f, "Invalid game mode change: {} -> {}", previous, current)
            }
            NetplayError::InvalidHostConfig { info } => {
                write!(f, "Invalid host config: {}", info)
            }
            NetplayError::IncompatibleVersion { local, remote } => {
                write!(
                    f,
                    "Incompatible versions: local {}, remote {}",
                    local, remote
                )
            }
            NetplayError::ConfigMismatch { field } => {
                write!(f, "Confirmed configs differ in '{}'", field)
            }
            NetplayError::Desync { local, remote } => {
                write!(f, "Desync: local=[{}]; remote=[{}]", local, remote)
            }
            NetplayError::Disconnected => write!(f, "Disconnected!"),
            NetplayError::SessionTerminated => {
                write!(f, "The session has already been terminated.")
            }
            NetplayError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            NetplayError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
            NetplayError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            }
            NetplayError::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            }
        }
    }
}

impl Error for NetplayError {}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_game_modes() {
        let err = NetplayError::InvalidGameMode {
            previous: 20,
            current: 99,
        };
        assert_eq!(err.to_string(), "Invalid game mode change: 20 -> 99");
    }

    #[test]
    fn display_desync_shows_both_frames() {
        let err = NetplayError::Desync {
            local: IndexedFrame::new(120, 4),
            remote: IndexedFrame::new(120, 4),
        };
        let text = err.to_string();
        assert!(text.contains("local=[4:120]"));
        assert!(text.contains("remote=[4:120]"));
    }

    #[test]
    fn request_errors_are_not_fatal() {
        assert!(!NetplayError::InvalidRequest {
            info: "bad".to_owned()
        }
        .is_fatal());
        assert!(!NetplayError::SocketError {
            context: "closed".to_owned()
        }
        .is_fatal());
        assert!(NetplayError::Desync {
            local: IndexedFrame::default(),
            remote: IndexedFrame::default(),
        }
        .is_fatal());
        assert!(NetplayError::ConfigMismatch { field: "delay" }.is_fatal());
    }
}
