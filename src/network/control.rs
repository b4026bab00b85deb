//! Messages from the controlling process (launcher / UI) to the session.
//!
//! The orchestrator delivers the role, the remote address, controller mappings and the
//! negotiated configuration through [`ControlMessage`]s, handed to the session with
//! [`NetplaySession::handle_control`](crate::NetplaySession::handle_control).

use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NetplayError;
use crate::sessions::config::{NetplayConfig, SpectateConfig};
use crate::ClientMode;

/// Milliseconds per frame at 60 fps.
const FRAME_MILLIS: f64 = 1000.0 / 60.0;

/// Inbound message from the controlling process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Role and match flags. Accepted once.
    ClientMode(ClientMode),
    /// Remote address to connect to, or local address to listen on. Accepted once.
    IpAddrPort(IpAddrPort),
    /// Controller mappings for the input layer.
    ControllerMappings(ControllerMappings),
    /// Match configuration for host, client, broadcast and offline roles.
    NetplayConfig(NetplayConfig),
    /// Configuration for a spectator, relayed from the broadcaster.
    SpectateConfig(SpectateConfig),
    /// The orchestrator wants the session to stop and show `text`.
    ErrorMessage {
        /// Human readable description.
        text: String,
    },
}

impl ControlMessage {
    /// Variant name, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ClientMode(_) => "ClientMode",
            Self::IpAddrPort(_) => "IpAddrPort",
            Self::ControllerMappings(_) => "ControllerMappings",
            Self::NetplayConfig(_) => "NetplayConfig",
            Self::SpectateConfig(_) => "SpectateConfig",
            Self::ErrorMessage { .. } => "ErrorMessage",
        }
    }
}

/// Host name or address plus port.
///
/// An empty `addr` means "any local interface" when listening.
///
/// ```
/// use fortress_netplay::IpAddrPort;
///
/// let target: IpAddrPort = "192.168.1.20:3939".parse().unwrap();
/// assert_eq!(target.addr, "192.168.1.20");
/// assert_eq!(target.port, 3939);
/// assert_eq!(target.to_string(), "192.168.1.20:3939");
///
/// let v6: IpAddrPort = "[::1]:3939".parse().unwrap();
/// assert_eq!(v6.addr, "::1");
/// assert_eq!(v6.to_string(), "[::1]:3939");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IpAddrPort {
    /// Host name or literal address, without brackets.
    pub addr: String,
    /// Port number.
    pub port: u16,
}

impl IpAddrPort {
    /// Creates an address.
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }

    /// Any local interface on `port`.
    #[must_use]
    pub fn any(port: u16) -> Self {
        Self::new("", port)
    }

    /// The same host on a different port.
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.addr.clone(), port)
    }

    /// `true` if no host is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addr.is_empty()
    }

    /// Resolves to socket addresses. An empty host resolves to the IPv4 wildcard.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, NetplayError> {
        let host = if self.addr.is_empty() {
            "0.0.0.0"
        } else {
            self.addr.as_str()
        };
        let resolved: Vec<SocketAddr> = (host, self.port)
            .to_socket_addrs()
            .map_err(|e| NetplayError::SocketError {
                context: format!("failed to resolve {self}: {e}"),
            })?
            .collect();
        if resolved.is_empty() {
            return Err(NetplayError::SocketError {
                context: format!("{self} resolved to no addresses"),
            });
        }
        Ok(resolved)
    }
}

impl From<SocketAddr> for IpAddrPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for IpAddrPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.contains(':') {
            write!(f, "[{}]:{}", self.addr, self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

impl FromStr for IpAddrPort {
    type Err = NetplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetplayError::InvalidRequest {
            info: format!("invalid address '{s}', expected host:port"),
        };
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port = port
            .parse::<u16>()
            .map_err(|e| NetplayError::InvalidRequest {
                info: format!("invalid port in '{s}': {e}"),
            })?;
        Ok(Self::new(host, port))
    }
}

/// Opaque controller mapping blobs, keyed by controller name.
///
/// The session only stores these for the input layer; it never interprets them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerMappings {
    /// Mapping blob per controller.
    pub mappings: BTreeMap<String, Vec<u8>>,
}

impl ControllerMappings {
    /// Creates an empty mapping set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the mapping for `name`.
    pub fn insert(&mut self, name: impl Into<String>, mapping: Vec<u8>) {
        self.mappings.insert(name.into(), mapping);
    }

    /// Mapping for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.mappings.get(name).map(Vec::as_slice)
    }

    /// Number of mapped controllers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// `true` if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Input delay, in frames, that hides a round trip of `latency_ms` at 60 fps.
///
/// ```
/// use fortress_netplay::compute_delay;
///
/// assert_eq!(compute_delay(0.0), 0);
/// assert_eq!(compute_delay(16.0), 1);
/// assert_eq!(compute_delay(50.0), 3);
/// ```
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn compute_delay(latency_ms: f64) -> u8 {
    if !latency_ms.is_finite() || latency_ms <= 0.0 {
        return 0;
    }
    (latency_ms / FRAME_MILLIS).ceil().min(f64::from(u8::MAX - 1)) as u8
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

    // ==========================================
    // IpAddrPort Tests
    // ==========================================

    #[test]
    fn parse_and_display_v4() {
        let addr: IpAddrPort = "example.org:3939".parse().unwrap();
        assert_eq!(addr, IpAddrPort::new("example.org", 3939));
        assert_eq!(addr.to_string(), "example.org:3939");
    }

    #[test]
    fn parse_bracketed_v6() {
        let addr: IpAddrPort = "[fe80::1]:80".parse().unwrap();
        assert_eq!(addr.addr, "fe80::1");
        assert_eq!(addr.port, 80);
    }

    #[test]
    fn parse_rejects_missing_port() {
        assert!("localhost".parse::<IpAddrPort>().is_err());
        assert!("localhost:notaport".parse::<IpAddrPort>().is_err());
        assert!("localhost:70000".parse::<IpAddrPort>().is_err());
    }

    #[test]
    fn empty_host_means_any() {
        let any = IpAddrPort::any(0);
        assert!(any.is_empty());
        let resolved = any.resolve().unwrap();
        assert!(resolved[0].ip().is_unspecified());
    }

    #[test]
    fn resolve_literal() {
        let resolved = IpAddrPort::new("127.0.0.1", 4000).resolve().unwrap();
        assert_eq!(resolved[0], "127.0.0.1:4000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn from_socket_addr_keeps_port() {
        let sock: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        assert_eq!(IpAddrPort::from(sock), IpAddrPort::new("10.0.0.2", 5000));
        assert_eq!(IpAddrPort::from(sock).with_port(6000).port, 6000);
    }

    // ==========================================
    // compute_delay Tests
    // ==========================================

    #[test]
    fn delay_rounds_up_to_whole_frames() {
        assert_eq!(compute_delay(16.7), 2);
        assert_eq!(compute_delay(100.0), 6);
        assert_eq!(compute_delay(-5.0), 0);
        assert_eq!(compute_delay(f64::NAN), 0);
    }

    #[test]
    fn delay_never_reaches_invalid_marker() {
        assert_eq!(compute_delay(1.0e9), 0xFE);
    }

    #[test]
    fn controller_mappings_store_blobs() {
        let mut mappings = ControllerMappings::new();
        assert!(mappings.is_empty());
        mappings.insert("pad", vec![1, 2, 3]);
        assert_eq!(mappings.get("pad"), Some(&[1_u8, 2, 3][..]));
        assert_eq!(mappings.len(), 1);
    }
}
