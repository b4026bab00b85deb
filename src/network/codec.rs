//! Binary codec for wire message serialization.
//!
//! Every [`NetplayMessage`] put on a wire goes through this module, so both ends agree on
//! one bincode configuration: `standard()` with fixed-width integers, which keeps message
//! sizes independent of the values carried.
//!
//! # Examples
//!
//! ```
//! use fortress_netplay::network::codec::{encode_message, decode_message};
//! use fortress_netplay::NetplayMessage;
//!
//! let msg = NetplayMessage::ConfirmConfig;
//! let bytes = encode_message(&msg).expect("encoding should succeed");
//! let decoded = decode_message(&bytes).expect("decoding should succeed");
//! assert_eq!(msg, decoded);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::error::NetplayError;
use crate::network::messages::NetplayMessage;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Represents what operation was being performed when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a wire message.
    EncodeMessage,
    /// Decoding a wire message.
    DecodeMessage,
    /// Appending to a buffer.
    AppendToBuffer,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeMessage => write!(f, "encoding wire message"),
            Self::DecodeMessage => write!(f, "decoding wire message"),
            Self::AppendToBuffer => write!(f, "appending to buffer"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// Messages are kept as `String` because bincode errors only expose a `Display`
/// rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// Bytes were left over after a complete message was decoded.
    TrailingBytes {
        /// Bytes consumed by the message.
        consumed: usize,
        /// Bytes provided.
        provided: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::TrailingBytes { consumed, provided } => {
                write!(
                    f,
                    "trailing bytes: message used {consumed} of {provided} bytes"
                )
            },
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        Self::SerializationError {
            context: err.to_string(),
        }
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
///
/// ```
/// use fortress_netplay::network::codec::encode;
///
/// let bytes = encode(&42u32).expect("encoding should succeed");
/// assert_eq!(bytes.len(), 4);
/// ```
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value by appending to an existing `Vec<u8>`, returning the bytes written.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Decodes a value from a byte slice, returning it with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Encodes one wire message.
pub fn encode_message(msg: &NetplayMessage) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(msg, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeMessage))
}

/// Decodes one wire message that must fill `bytes` exactly.
pub fn decode_message(bytes: &[u8]) -> CodecResult<NetplayMessage> {
    let (msg, consumed) = bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeMessage))?;
    if consumed != bytes.len() {
        return Err(CodecError::TrailingBytes {
            consumed,
            provided: bytes.len(),
        });
    }
    Ok(msg)
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
    use crate::consensus::RngState;
    use crate::frame_info::IndexedFrame;

    #[test]
    fn test_message_roundtrip() {
        let original = NetplayMessage::PlayerInputs {
            start: IndexedFrame::new(120, 6),
            inputs: vec![0x0001, 0x0206, 0x0000],
        };
        let bytes = encode_message(&original).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), original);
    }

    #[test]
    fn test_fixed_int_encoding() {
        assert_eq!(encode(&1u32).unwrap().len(), 4);
        assert_eq!(encode(&u32::MAX).unwrap().len(), 4);
    }

    #[test]
    fn test_encode_append() {
        let mut buffer = Vec::new();
        let len1 = encode_append(&42u32, &mut buffer).unwrap();
        let len2 = encode_append(&"test", &mut buffer).unwrap();
        assert_eq!(buffer.len(), len1 + len2);
        let (first, used): (u32, _) = decode(&buffer).unwrap();
        assert_eq!(first, 42);
        assert_eq!(used, len1);
    }

    #[test]
    fn test_decode_invalid_data() {
        let result = decode_message(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(CodecError::DecodeError { .. })));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = encode_message(&NetplayMessage::ConfirmConfig).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_message(&bytes),
            Err(CodecError::TrailingBytes { .. })
        ));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let msg = NetplayMessage::RngState(RngState::new(4, vec![7; 32]));
        assert_eq!(encode_message(&msg).unwrap(), encode_message(&msg).unwrap());
    }

    #[test]
    fn test_codec_error_converts_to_serialization_error() {
        let err: NetplayError = CodecError::decode("eof", CodecOperation::DecodeMessage).into();
        assert!(matches!(err, NetplayError::SerializationError { .. }));
        assert!(err.to_string().contains("eof"));
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::TrailingBytes {
            consumed: 3,
            provided: 5,
        };
        assert!(err.to_string().contains("3 of 5"));
    }
}
