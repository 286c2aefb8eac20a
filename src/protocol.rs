//! Wire formats: the out-of-band handshake payload and the channel message envelope

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{RoomId, SessionError};
use crate::transport::{IceCandidate, SdpType, SessionDescription};

/// Offer or answer plus the candidates known when it was encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
    pub room_id: RoomId,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
}

impl HandshakePayload {
    pub fn new(desc: SessionDescription, room_id: RoomId, candidates: Vec<IceCandidate>) -> Self {
        Self {
            kind: desc.sdp_type,
            sdp: desc.sdp,
            room_id,
            candidates,
        }
    }

    pub fn description(&self) -> SessionDescription {
        SessionDescription {
            sdp_type: self.kind,
            sdp: self.sdp.clone(),
        }
    }

    /// Serialize to compact JSON and wrap it in base64.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("HandshakePayload serialization should never fail");
        BASE64.encode(json)
    }

    pub fn decode(encoded: &str) -> Result<Self, SessionError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| SessionError::InvalidHandshakePayload(format!("not base64: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SessionError::InvalidHandshakePayload(e.to_string()))
    }
}

/// Application message carried over a channel; the payload is never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    pub fn to_text(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::InvalidMessage(e.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text).map_err(|e| SessionError::InvalidMessage(e.to_string()))
    }
}
