use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::types::{ConnectionState, PeerId};
use crate::transport::{ConnectivityState, DataChannel, IceCandidate, PeerTransport, SessionDescription};

pub(crate) struct PeerEntry {
    /// Generation of the transport connection; callbacks from older ones are dropped.
    pub connection_id: u64,
    pub transport: Arc<dyn PeerTransport>,
    pub channel: Option<Arc<dyn DataChannel>>,
    pub state: ConnectionState,
    pub network_state: Option<ConnectivityState>,
    pub local_description: Option<SessionDescription>,
    pub joined: bool,
}

impl PeerEntry {
    pub fn new(connection_id: u64, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            connection_id,
            transport,
            channel: None,
            state: ConnectionState::Connecting,
            network_state: None,
            local_description: None,
            joined: false,
        }
    }

    pub async fn close(&self) {
        if let Some(channel) = &self.channel {
            channel.close().await;
        }
        self.transport.close().await;
    }
}

/// Peer entries plus the candidates each of their connections discovered
#[derive(Default)]
pub(crate) struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerEntry>,
    candidates: HashMap<PeerId, Vec<IceCandidate>>,
}

impl PeerRegistry {
    /// Register `entry`, returning the entry it replaced.
    pub fn insert(&mut self, peer_id: PeerId, entry: PeerEntry) -> Option<PeerEntry> {
        self.candidates.remove(&peer_id);
        self.peers.insert(peer_id, entry)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    /// The entry for `peer_id`, only if it still belongs to `connection_id`.
    pub fn current(&mut self, peer_id: &PeerId, connection_id: u64) -> Option<&mut PeerEntry> {
        self.peers
            .get_mut(peer_id)
            .filter(|entry| entry.connection_id == connection_id)
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerEntry> {
        self.candidates.remove(peer_id);
        self.peers.remove(peer_id)
    }

    /// Remove every entry and clear the candidate buffer.
    pub fn drain(&mut self) -> Vec<(PeerId, PeerEntry)> {
        self.candidates.clear();
        std::mem::take(&mut self.peers).into_iter().collect()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn channels(&self) -> Vec<(PeerId, Option<Arc<dyn DataChannel>>)> {
        self.peers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.channel.clone()))
            .collect()
    }

    pub fn push_candidate(&mut self, peer_id: &PeerId, candidate: IceCandidate) {
        self.candidates
            .entry(peer_id.clone())
            .or_default()
            .push(candidate);
    }

    pub fn candidates(&self, peer_id: &PeerId) -> Vec<IceCandidate> {
        self.candidates.get(peer_id).cloned().unwrap_or_default()
    }
}
