//! Typed publish/subscribe for session state changes

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::warn;

use crate::protocol::Message;
use crate::session::{ConnectionState, PeerId, RoomId};
use crate::transport::{ChannelState, ConnectivityState, IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub peer_id: PeerId,
    pub state: ConnectionState,
    pub connectivity_state: Option<ConnectivityState>,
    pub channel_state: Option<ChannelState>,
}

/// Everything the manager publishes
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message { message: Message, peer_id: PeerId },
    PeerJoin(PeerId),
    PeerLeave(PeerId),
    RoomJoined(RoomId),
    RoomLeft(RoomId),
    Disconnect,
    Error(String),
    CandidateDiscovered { candidate: IceCandidate, peer_id: PeerId },
    ConnectionInfo(SessionDescription),
    ConnectionStateChange(StateChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    PeerJoin,
    PeerLeave,
    RoomJoined,
    RoomLeft,
    Disconnect,
    Error,
    CandidateDiscovered,
    ConnectionInfo,
    ConnectionStateChange,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Message { .. } => EventKind::Message,
            Event::PeerJoin(_) => EventKind::PeerJoin,
            Event::PeerLeave(_) => EventKind::PeerLeave,
            Event::RoomJoined(_) => EventKind::RoomJoined,
            Event::RoomLeft(_) => EventKind::RoomLeft,
            Event::Disconnect => EventKind::Disconnect,
            Event::Error(_) => EventKind::Error,
            Event::CandidateDiscovered { .. } => EventKind::CandidateDiscovered,
            Event::ConnectionInfo(_) => EventKind::ConnectionInfo,
            Event::ConnectionStateChange(_) => EventKind::ConnectionStateChange,
        }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

struct Listener {
    id: u64,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<Listener>,
    streams: Vec<async_channel::Sender<Event>>,
}

/// Observer registry keyed by event kind.
///
/// Handlers run synchronously on the publishing task and must not block. A
/// handler that fails or panics is logged and stays registered.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Register `handler` for every event.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Receive every event published from now on. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> async_channel::Receiver<Event> {
        let (tx, rx) = async_channel::unbounded();
        self.lock().streams.push(tx);
        rx
    }

    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let mut registry = self.lock();
            registry.streams.retain(|tx| tx.try_send(event.clone()).is_ok());
            registry
                .listeners
                .iter()
                .filter(|l| l.kind.is_none_or(|k| k == kind))
                .map(|l| l.handler.clone())
                .collect()
        };

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{:?} handler failed: {}", kind, e),
                Err(_) => warn!("{:?} handler panicked", kind),
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.push(Listener { id, kind, handler });
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Disposer returned by [`EventBus::on`]; the handler stays registered until
/// [`unsubscribe`](Self::unsubscribe) is called.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .listeners
                .retain(|l| l.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter(bus: &EventBus, kind: EventKind) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sub = bus.on(kind, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, sub)
    }

    #[test]
    fn handlers_receive_only_their_kind() {
        let bus = EventBus::new();
        let (joins, _sub) = counter(&bus, EventKind::PeerJoin);

        bus.publish(Event::PeerJoin(PeerId::host()));
        bus.publish(Event::Disconnect);

        assert_eq!(joins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_any_sees_everything() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _sub = bus.on_any(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(Event::Disconnect);
        bus.publish(Event::RoomLeft(RoomId::from("r1")));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let (count, sub) = counter(&bus, EventKind::Disconnect);

        bus.publish(Event::Disconnect);
        sub.unsubscribe();
        bus.publish(Event::Disconnect);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn failing_handler_stays_registered() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let _failing = bus.on(EventKind::Error, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err("handler error".into())
        });
        let (others, _sub) = counter(&bus, EventKind::Error);

        bus.publish(Event::Error("one".to_string()));
        bus.publish(Event::Error("two".to_string()));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(others.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_handler_stays_registered() {
        let bus = EventBus::new();
        let _panicking = bus.on(EventKind::Disconnect, |_| panic!("boom"));
        let (count, _sub) = counter(&bus, EventKind::Disconnect);

        bus.publish(Event::Disconnect);
        bus.publish(Event::Disconnect);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bus.listener_count(), 2);
    }

    #[tokio::test]
    async fn stream_subscription_receives_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        bus.publish(Event::RoomJoined(RoomId::from("r1")));

        assert_eq!(rx.recv().await.unwrap(), Event::RoomJoined(RoomId::from("r1")));
    }

    #[test]
    fn dropped_stream_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(Event::Disconnect);
        assert!(bus.lock().streams.is_empty());
    }
}
