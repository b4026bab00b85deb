use serde::{Deserialize, Serialize};

use crate::consensus::RngState;
use crate::desync::SyncHash;
use crate::frame_info::{IndexedFrame, InputBits};
use crate::sessions::config::{InitialMode, NetplayConfig, SpectateConfig};
use crate::version::Version;
use crate::ClientMode;

/// Messages exchanged between peers and with spectators.
///
/// Handshake messages travel on the control channel, in-match traffic between the two
/// netplay peers on the data channel. Spectators only ever use the control channel.
///
/// # Note
///
/// This type is re-exported at the crate root for transport implementations.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetplayMessage {
    /// Handshake opener: sender version and mode.
    VersionConfig {
        /// Sender version.
        version: Version,
        /// Sender mode.
        mode: ClientMode,
    },
    /// Spectator accepted the [`SpectateConfig`] and is ready for the stream.
    ConfirmConfig,
    /// Configuration a spectator should use.
    SpectateConfig(SpectateConfig),
    /// Match configuration, sent by both peers for confirmation once the data channel is up.
    NetplayConfig(NetplayConfig),
    /// Contiguous inputs of the sender's player, starting at `start`.
    PlayerInputs {
        /// First frame covered by `inputs`.
        start: IndexedFrame,
        /// One entry per frame.
        inputs: Vec<InputBits>,
    },
    /// Contiguous confirmed inputs of both players, for spectators.
    BothInputs {
        /// First frame covered by `inputs`.
        start: IndexedFrame,
        /// One `[p1, p2]` pair per frame.
        inputs: Vec<[InputBits; 2]>,
    },
    /// Retry menu selection for match instance `index`.
    MenuIndex {
        /// Match instance the selection belongs to.
        index: u32,
        /// Selected entry.
        menu_index: u8,
    },
    /// Shared generator state for a match instance.
    RngState(RngState),
    /// Periodic state digest.
    SyncHash(SyncHash),
    /// First message of the spectator stream.
    InitialGameState {
        /// Training mode match.
        training: bool,
        /// Phase the spectator starts from.
        mode: InitialMode,
        /// First frame the spectator will receive.
        start: IndexedFrame,
    },
    /// Error text to show the user; the sender is going away.
    ErrorMessage {
        /// Human readable description.
        text: String,
    },
}

impl NetplayMessage {
    /// Variant name, for logs and violation reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::VersionConfig { .. } => "VersionConfig",
            Self::ConfirmConfig => "ConfirmConfig",
            Self::SpectateConfig(_) => "SpectateConfig",
            Self::NetplayConfig(_) => "NetplayConfig",
            Self::PlayerInputs { .. } => "PlayerInputs",
            Self::BothInputs { .. } => "BothInputs",
            Self::MenuIndex { .. } => "MenuIndex",
            Self::RngState(_) => "RngState",
            Self::SyncHash(_) => "SyncHash",
            Self::InitialGameState { .. } => "InitialGameState",
            Self::ErrorMessage { .. } => "ErrorMessage",
        }
    }
}

impl std::fmt::Debug for NetplayMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlayerInputs { start, inputs } => f
                .debug_struct("PlayerInputs")
                .field("start", start)
                .field("len", &inputs.len())
                .finish(),
            Self::BothInputs { start, inputs } => f
                .debug_struct("BothInputs")
                .field("start", start)
                .field("len", &inputs.len())
                .finish(),
            Self::RngState(state) => f
                .debug_struct("RngState")
                .field("index", &state.index)
                .field("bytes", &state.blob.len())
                .finish(),
            Self::VersionConfig { version, mode } => f
                .debug_struct("VersionConfig")
                .field("version", &version.code)
                .field("mode", mode)
                .finish(),
            Self::ConfirmConfig => write!(f, "ConfirmConfig"),
            Self::SpectateConfig(config) => f.debug_tuple("SpectateConfig").field(config).finish(),
            Self::NetplayConfig(config) => f.debug_tuple("NetplayConfig").field(config).finish(),
            Self::MenuIndex { index, menu_index } => f
                .debug_struct("MenuIndex")
                .field("index", index)
                .field("menu_index", menu_index)
                .finish(),
            Self::SyncHash(hash) => f.debug_tuple("SyncHash").field(hash).finish(),
            Self::InitialGameState {
                training,
                mode,
                start,
            } => f
                .debug_struct("InitialGameState")
                .field("training", training)
                .field("mode", mode)
                .field("start", start)
                .finish(),
            Self::ErrorMessage { text } => {
                f.debug_struct("ErrorMessage").field("text", text).finish()
            },
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

    #[test]
    fn kind_names_match_variants() {
        assert_eq!(NetplayMessage::ConfirmConfig.kind(), "ConfirmConfig");
        let inputs = NetplayMessage::PlayerInputs {
            start: IndexedFrame::new(0, 1),
            inputs: vec![1, 2, 3],
        };
        assert_eq!(inputs.kind(), "PlayerInputs");
        let hash = NetplayMessage::SyncHash(SyncHash::new(IndexedFrame::new(60, 2), 7));
        assert_eq!(hash.kind(), "SyncHash");
    }

    #[test]
    fn debug_summarizes_input_payloads() {
        let msg = NetplayMessage::BothInputs {
            start: IndexedFrame::new(30, 4),
            inputs: vec![[0, 0]; 30],
        };
        let text = format!("{msg:?}");
        assert!(text.contains("len: 30"));
        assert!(!text.contains("[0, 0]"));
    }

    #[test]
    fn debug_hides_rng_bytes() {
        let msg = NetplayMessage::RngState(RngState::new(3, vec![0xAB; 64]));
        let text = format!("{msg:?}");
        assert!(text.contains("bytes: 64"));
    }
}
