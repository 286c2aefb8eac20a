#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pairlink::transport::memory::MemoryNetwork;
use pairlink::transport::{
    ChannelState, DataChannel, IceCandidate, PeerTransport, SdpType, SessionDescription,
    TransportConfig, TransportError, TransportEvent, TransportEventSink, TransportProvider,
};
use pairlink::{Event, ManagerConfig, PeerId, RetryPolicy};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with a fast retry so failing attempts don't slow the tests down.
pub fn test_config(local: &str) -> ManagerConfig {
    ManagerConfig::default()
        .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
        .with_local_peer_id(local)
}

/// Wait for the first event accepted by `pick`, panicking after [`EVENT_TIMEOUT`].
pub async fn wait_for<T>(
    events: &async_channel::Receiver<Event>,
    mut pick: impl FnMut(&Event) -> Option<T>,
) -> T {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Drain whatever has been published so far.
pub fn drain(events: &async_channel::Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Memory network that refuses the first `failures` connections.
pub struct FlakyProvider {
    inner: MemoryNetwork,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyProvider {
    pub fn new(failures: usize) -> Arc<Self> {
        Self::on(MemoryNetwork::new(), failures)
    }

    /// Same, but connections that get through join `network`.
    pub fn on(network: MemoryNetwork, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: network,
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportProvider for FlakyProvider {
    async fn new_connection(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::failed(format!("connection {} refused", call)));
        }
        self.inner.new_connection(config, events).await
    }
}

/// Provider whose channels are open from the start and record what they send.
///
/// Channels of peers listed in `failing` reject every send. With `gathering`
/// off, local descriptions never report gathering completion.
#[derive(Default)]
pub struct StubProvider {
    failing: HashSet<PeerId>,
    silent: bool,
    pub sent: Arc<Mutex<HashMap<PeerId, Vec<String>>>>,
    pub attempts: Arc<Mutex<HashMap<PeerId, usize>>>,
    pub sinks: Mutex<Vec<TransportEventSink>>,
}

impl StubProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_for(peers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing: peers.iter().map(|p| PeerId::from(*p)).collect(),
            ..Self::default()
        })
    }

    /// Never finishes candidate gathering.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            silent: true,
            ..Self::default()
        })
    }

    pub fn sent_to(&self, peer: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .get(&PeerId::from(peer))
            .cloned()
            .unwrap_or_default()
    }

    pub fn attempts_for(&self, peer: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(&PeerId::from(peer))
            .copied()
            .unwrap_or_default()
    }

    /// Most recent sink handed out for `peer`.
    pub fn sink_for(&self, peer: &str) -> TransportEventSink {
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.peer_id().as_str() == peer)
            .cloned()
            .expect("no connection for peer")
    }
}

#[async_trait]
impl TransportProvider for StubProvider {
    async fn new_connection(
        &self,
        _config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        self.sinks.lock().unwrap().push(events.clone());
        let peer_id = events.peer_id().clone();
        Ok(Arc::new(StubConnection {
            fail_sends: self.failing.contains(&peer_id),
            silent: self.silent,
            peer_id,
            events,
            sent: self.sent.clone(),
            attempts: self.attempts.clone(),
        }))
    }
}

struct StubConnection {
    peer_id: PeerId,
    events: TransportEventSink,
    fail_sends: bool,
    silent: bool,
    sent: Arc<Mutex<HashMap<PeerId, Vec<String>>>>,
    attempts: Arc<Mutex<HashMap<PeerId, usize>>>,
}

#[async_trait]
impl PeerTransport for StubConnection {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        Ok(Arc::new(StubChannel {
            label: label.to_string(),
            peer_id: self.peer_id.clone(),
            fail_sends: self.fail_sends,
            sent: self.sent.clone(),
            attempts: self.attempts.clone(),
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: format!("stub offer {}", self.peer_id),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: format!("stub answer {}", self.peer_id),
        })
    }

    async fn set_local_description(
        &self,
        _desc: SessionDescription,
    ) -> Result<(), TransportError> {
        if !self.silent {
            self.events.emit(TransportEvent::Candidate(Some(IceCandidate {
                candidate: format!("candidate:stub {}", self.peer_id),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            })));
            self.events.emit(TransportEvent::Candidate(None));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _desc: SessionDescription,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn add_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {}
}

struct StubChannel {
    label: String,
    peer_id: PeerId,
    fail_sends: bool,
    sent: Arc<Mutex<HashMap<PeerId, Vec<String>>>>,
    attempts: Arc<Mutex<HashMap<PeerId, usize>>>,
}

#[async_trait]
impl DataChannel for StubChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        ChannelState::Open
    }

    async fn send(&self, text: &str) -> Result<(), TransportError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(self.peer_id.clone())
            .or_default() += 1;
        if self.fail_sends {
            return Err(TransportError::failed(format!("{} refused", self.peer_id)));
        }
        self.sent
            .lock()
            .unwrap()
            .entry(self.peer_id.clone())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    async fn close(&self) {}
}
