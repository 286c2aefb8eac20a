//! Transport provider seam: the peer connection engine the session layer drives

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::PeerId;

/// Failures reported by a transport provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{0}")]
    Failed(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// NAT traversal server descriptor (STUN/TURN)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Configuration handed to the provider for every new connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Network candidate in the browser `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

/// Low-level connectivity state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectivityState::Connected | ConnectivityState::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Callbacks a transport reports for one connection
pub enum TransportEvent {
    /// A local candidate was discovered; `None` means gathering completed.
    Candidate(Option<IceCandidate>),
    ConnectivityChange(ConnectivityState),
    /// The remote side announced a channel on this connection.
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelClose,
    ChannelError(String),
    ChannelMessage(String),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Candidate(c) => f.debug_tuple("Candidate").field(c).finish(),
            Self::ConnectivityChange(s) => f.debug_tuple("ConnectivityChange").field(s).finish(),
            Self::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.label()).finish(),
            Self::ChannelOpen => f.write_str("ChannelOpen"),
            Self::ChannelClose => f.write_str("ChannelClose"),
            Self::ChannelError(e) => f.debug_tuple("ChannelError").field(e).finish(),
            Self::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
        }
    }
}

/// Transport event tagged with the connection it originated from
#[derive(Debug)]
pub(crate) struct TaggedEvent {
    pub peer_id: PeerId,
    pub connection_id: u64,
    pub event: TransportEvent,
}

/// Where a transport delivers the callbacks of a single connection.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    peer_id: PeerId,
    connection_id: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl TransportEventSink {
    pub(crate) fn new(
        peer_id: PeerId,
        connection_id: u64,
        tx: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        Self {
            peer_id,
            connection_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Returns false once the owning manager has shut down.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                peer_id: self.peer_id.clone(),
                connection_id: self.connection_id,
                event,
            })
            .is_ok()
    }
}

/// Creates one transport connection per peer
#[async_trait]
pub trait TransportProvider: Send + Sync + 'static {
    async fn new_connection(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// A single peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Open an ordered, reliable channel on this connection.
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Applying the local description starts candidate gathering.
    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Message channel established atop a peer connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    async fn send(&self, text: &str) -> Result<(), TransportError>;

    async fn close(&self);
}
