use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{SdpType, TransportError};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no active room")]
    NoActiveRoom,

    #[error("connection info unavailable: local description not produced yet")]
    ConnectionInfoUnavailable,

    #[error("invalid handshake payload: {0}")]
    InvalidHandshakePayload(String),

    #[error("not in a room")]
    NotInRoom,

    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("channel not established for peer {0}")]
    ChannelNotEstablished(PeerId),

    #[error("channel not open for peer {0}")]
    ChannelNotOpen(PeerId),

    #[error("unexpected {kind} while acting as {role}")]
    UnexpectedHandshake { role: Role, kind: SdpType },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("room closed before the handshake completed")]
    RoomClosed,

    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Only lower-level transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::TransportFailure(_))
    }
}

const ROOM_ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ROOM_ID_LEN: usize = 8;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Synthetic peer id a Guest uses for its upstream peer, and the Host for its
/// own outward-facing connection.
pub const HOST_PEER_ID: &str = "host";

/// Room identifier shared by a Host and its Guests
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id = (0..ROOM_ID_LEN)
            .map(|_| ROOM_ID_CHARS[rng.random_range(0..ROOM_ID_CHARS.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Peer identifier ("host" or "peer_" + 8 hex when generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        let value: u32 = rand::rng().random();
        let mut id = String::with_capacity(13);
        id.push_str("peer_");
        for i in 0..8 {
            let nibble = ((value >> (28 - i * 4)) & 0xF) as usize;
            id.push(HEX_CHARS[nibble] as char);
        }
        Self(id)
    }

    pub fn host() -> Self {
        Self(HOST_PEER_ID.to_string())
    }

    pub fn is_host(&self) -> bool {
        self.0 == HOST_PEER_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Guest => f.write_str("guest"),
        }
    }
}

/// The single active room of a manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub role: Role,
}

/// Per-peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_generate_has_correct_length() {
        let id = RoomId::generate();
        assert_eq!(id.as_str().len(), 8);
    }

    #[test]
    fn room_id_generate_uses_valid_chars() {
        let id = RoomId::generate();
        for c in id.as_str().bytes() {
            assert!(ROOM_ID_CHARS.contains(&c), "Invalid char: {}", c as char);
        }
    }

    #[test]
    fn peer_id_generate_has_correct_format() {
        let peer_id = PeerId::generate();
        assert!(peer_id.as_str().starts_with("peer_"));
        assert_eq!(peer_id.as_str().len(), 13);
        assert!(!peer_id.is_host());
    }

    #[test]
    fn host_peer_id() {
        assert!(PeerId::host().is_host());
        assert_eq!(PeerId::from("host"), PeerId::host());
    }

    #[test]
    fn room_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&RoomId::from("r1")).unwrap();
        assert_eq!(json, "\"r1\"");
        let back: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "r1");
    }

    #[test]
    fn peer_id_display() {
        assert_eq!(format!("{}", PeerId::from("peer_abcd1234")), "peer_abcd1234");
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(SessionError::TransportFailure(TransportError::Closed).is_retryable());
        assert!(!SessionError::NotInRoom.is_retryable());
        assert!(!SessionError::RoomClosed.is_retryable());
        assert!(!SessionError::ChannelNotOpen(PeerId::host()).is_retryable());
    }

    #[test]
    fn unexpected_handshake_message() {
        let err = SessionError::UnexpectedHandshake {
            role: Role::Guest,
            kind: SdpType::Offer,
        };
        assert_eq!(err.to_string(), "unexpected offer while acting as guest");
    }
}
