use crate::retry::RetryPolicy;
use crate::session::PeerId;
use crate::transport::{IceServer, TransportConfig};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "messages";
pub const DEFAULT_COMMAND_BUFFER: usize = 1024;

/// Connection manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Handed to the transport provider for every new connection.
    pub transport: TransportConfig,
    /// Applied to room operations and to every per-peer send.
    pub retry: RetryPolicy,
    pub channel_label: String,
    /// Peer id attached to the local echo of sent messages.
    pub local_peer_id: PeerId,
    pub command_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            },
            retry: RetryPolicy::default(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            local_peer_id: PeerId::generate(),
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}

impl ManagerConfig {
    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServer>) -> Self {
        self.transport.ice_servers = ice_servers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_local_peer_id(mut self, peer_id: impl Into<PeerId>) -> Self {
        self.local_peer_id = peer_id.into();
        self
    }
}
