//! In-process loopback transport.
//!
//! Every connection is an endpoint on a shared [`MemoryNetwork`]. The session
//! description carries the endpoint id, so applying a remote description pairs
//! two endpoints. A pair links once both sides hold each other's description and
//! have received at least one remote candidate; linking mirrors the channels
//! each side created and opens them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tracing::debug;

use super::{
    ChannelState, ConnectivityState, DataChannel, IceCandidate, PeerTransport, SdpType,
    SessionDescription, TransportConfig, TransportError, TransportEvent, TransportEventSink,
    TransportProvider,
};

const SDP_PREFIX: &str = "pairlink-memory";
const BASE_PORT: u64 = 50000;

struct Endpoint {
    events: TransportEventSink,
    channels: Vec<Arc<MemoryChannel>>,
    has_local: bool,
    remote: Option<u64>,
    remote_candidate: bool,
    linked: bool,
    closed: bool,
}

#[derive(Default)]
struct Network {
    next_id: u64,
    connections_opened: usize,
    endpoints: HashMap<u64, Endpoint>,
}

/// Shared loopback network; clone it to hand the same network to several managers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Network>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of connections created on this network.
    pub fn connections_opened(&self) -> usize {
        lock(&self.inner).connections_opened
    }
}

#[async_trait]
impl TransportProvider for MemoryNetwork {
    async fn new_connection(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut net = lock(&self.inner);
        net.next_id += 1;
        net.connections_opened += 1;
        let id = net.next_id;

        debug!(
            "memory endpoint {} opened for {} ({} ice servers ignored)",
            id,
            events.peer_id(),
            config.ice_servers.len()
        );

        net.endpoints.insert(
            id,
            Endpoint {
                events,
                channels: Vec::new(),
                has_local: false,
                remote: None,
                remote_candidate: false,
                linked: false,
                closed: false,
            },
        );

        Ok(Arc::new(MemoryConnection {
            id,
            network: self.inner.clone(),
        }))
    }
}

fn lock(network: &Mutex<Network>) -> MutexGuard<'_, Network> {
    network.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn describe(id: u64, sdp_type: SdpType) -> SessionDescription {
    SessionDescription {
        sdp_type,
        sdp: format!("{} {} {}", SDP_PREFIX, sdp_type, id),
    }
}

fn endpoint_of(desc: &SessionDescription) -> Option<u64> {
    let mut parts = desc.sdp.split_whitespace();
    if parts.next()? != SDP_PREFIX {
        return None;
    }
    let _kind = parts.next()?;
    parts.next()?.parse().ok()
}

struct MemoryConnection {
    id: u64,
    network: Arc<Mutex<Network>>,
}

impl MemoryConnection {
    fn with_endpoint<T>(
        &self,
        f: impl FnOnce(&mut Network, u64) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut net = lock(&self.network);
        if !net.endpoints.get(&self.id).is_some_and(|e| !e.closed) {
            return Err(TransportError::Closed);
        }
        f(&mut net, self.id)
    }
}

#[async_trait]
impl PeerTransport for MemoryConnection {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.with_endpoint(|net, id| {
            let endpoint = net.endpoints.get_mut(&id).ok_or(TransportError::Closed)?;
            if endpoint.linked {
                return Err(TransportError::failed(
                    "channels must be created before the connection links",
                ));
            }
            let channel = MemoryChannel::new(label, endpoint.events.clone());
            endpoint.channels.push(channel.clone());
            Ok(channel as Arc<dyn DataChannel>)
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.with_endpoint(|_, id| Ok(describe(id, SdpType::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.with_endpoint(|net, id| match net.endpoints.get(&id) {
            Some(endpoint) if endpoint.remote.is_some() => Ok(describe(id, SdpType::Answer)),
            _ => Err(TransportError::failed("no remote offer applied")),
        })
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.with_endpoint(|net, id| {
            if endpoint_of(&desc) != Some(id) {
                return Err(TransportError::failed("description belongs to another endpoint"));
            }
            let endpoint = net.endpoints.get_mut(&id).ok_or(TransportError::Closed)?;
            endpoint.has_local = true;

            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    id,
                    BASE_PORT + id
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            };
            endpoint.events.emit(TransportEvent::Candidate(Some(candidate)));
            endpoint.events.emit(TransportEvent::Candidate(None));

            try_link(net, id);
            Ok(())
        })
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.with_endpoint(|net, id| {
            let remote = endpoint_of(&desc)
                .filter(|remote| net.endpoints.contains_key(remote))
                .ok_or_else(|| TransportError::failed("unknown remote endpoint"))?;
            if remote == id {
                return Err(TransportError::failed("cannot connect an endpoint to itself"));
            }
            if let Some(endpoint) = net.endpoints.get_mut(&id) {
                endpoint.remote = Some(remote);
            }
            try_link(net, id);
            Ok(())
        })
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::failed("malformed candidate"));
        }
        self.with_endpoint(|net, id| {
            if let Some(endpoint) = net.endpoints.get_mut(&id) {
                endpoint.remote_candidate = true;
            }
            try_link(net, id);
            Ok(())
        })
    }

    async fn close(&self) {
        let mut net = lock(&self.network);
        let Some(endpoint) = net.endpoints.get_mut(&self.id) else {
            return;
        };
        if endpoint.closed {
            return;
        }
        endpoint.closed = true;
        let channels = std::mem::take(&mut endpoint.channels);
        let remote = endpoint.remote.filter(|_| endpoint.linked);

        for channel in channels {
            channel.shutdown();
        }

        if let Some(remote) = remote.and_then(|r| net.endpoints.get(&r)) {
            remote
                .events
                .emit(TransportEvent::ConnectivityChange(ConnectivityState::Disconnected));
        }
        debug!("memory endpoint {} closed", self.id);
    }
}

fn ready_to_link(net: &Network, id: u64) -> Option<u64> {
    let a = net.endpoints.get(&id)?;
    let remote = a.remote?;
    let b = net.endpoints.get(&remote)?;
    let ready = |e: &Endpoint| e.has_local && e.remote_candidate && !e.linked && !e.closed;
    (b.remote == Some(id) && ready(a) && ready(b)).then_some(remote)
}

fn try_link(net: &mut Network, id: u64) {
    let Some(remote) = ready_to_link(net, id) else {
        return;
    };

    mirror_channels(net, id, remote);
    mirror_channels(net, remote, id);

    for endpoint_id in [id, remote] {
        if let Some(endpoint) = net.endpoints.get_mut(&endpoint_id) {
            endpoint.linked = true;
            endpoint
                .events
                .emit(TransportEvent::ConnectivityChange(ConnectivityState::Connected));
        }
    }

    // Mirrors are appended to both sides, so each endpoint holds every open channel.
    for endpoint_id in [id, remote] {
        if let Some(endpoint) = net.endpoints.get(&endpoint_id) {
            for channel in &endpoint.channels {
                channel.open();
            }
        }
    }

    debug!("memory endpoints {} and {} linked", id, remote);
}

fn mirror_channels(net: &mut Network, from: u64, to: u64) {
    let originals: Vec<Arc<MemoryChannel>> = match net.endpoints.get(&from) {
        Some(endpoint) => endpoint
            .channels
            .iter()
            .filter(|c| c.peer().is_none())
            .cloned()
            .collect(),
        None => return,
    };
    let Some(target) = net.endpoints.get_mut(&to) else {
        return;
    };

    for original in originals {
        let mirror = MemoryChannel::new(original.label(), target.events.clone());
        original.pair(&mirror);
        mirror.pair(&original);
        target
            .events
            .emit(TransportEvent::DataChannel(mirror.clone()));
        target.channels.push(mirror);
    }
}

struct MemoryChannel {
    label: String,
    events: TransportEventSink,
    state: Mutex<ChannelState>,
    peer: Mutex<Option<Weak<MemoryChannel>>>,
}

impl MemoryChannel {
    fn new(label: &str, events: TransportEventSink) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            events,
            state: Mutex::new(ChannelState::Connecting),
            peer: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn peer(&self) -> Option<Arc<MemoryChannel>> {
        self.peer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn pair(&self, other: &Arc<MemoryChannel>) {
        *self.peer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(Arc::downgrade(other));
    }

    fn open(&self) {
        let mut state = self.state();
        if *state == ChannelState::Connecting {
            *state = ChannelState::Open;
            self.events.emit(TransportEvent::ChannelOpen);
        }
    }

    /// Close this side only, reporting it locally. Returns whether it was open.
    fn close_local(&self) -> bool {
        let mut state = self.state();
        let was_open = *state == ChannelState::Open;
        if *state != ChannelState::Closed {
            *state = ChannelState::Closed;
            self.events.emit(TransportEvent::ChannelClose);
        }
        was_open
    }

    fn shutdown(&self) {
        if self.close_local() {
            if let Some(peer) = self.peer() {
                peer.close_local();
            }
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        *self.state()
    }

    async fn send(&self, text: &str) -> Result<(), TransportError> {
        if *self.state() != ChannelState::Open {
            return Err(TransportError::Closed);
        }
        let peer = self.peer().ok_or(TransportError::Closed)?;
        if peer.ready_state() != ChannelState::Open {
            return Err(TransportError::Closed);
        }
        if !peer.events.emit(TransportEvent::ChannelMessage(text.to_string())) {
            return Err(TransportError::failed("remote manager is gone"));
        }
        Ok(())
    }

    async fn close(&self) {
        self.shutdown();
    }
}
