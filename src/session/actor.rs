use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::registry::{PeerEntry, PeerRegistry};
use super::types::{ConnectionState, PeerId, Role, Room, RoomId, SessionError};
use crate::config::ManagerConfig;
use crate::events::{Event, EventBus, StateChange};
use crate::protocol::{HandshakePayload, Message};
use crate::transport::{
    ChannelState, DataChannel, IceCandidate, PeerTransport, SdpType, SessionDescription,
    TaggedEvent, TransportEvent, TransportEventSink, TransportProvider,
};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) type SendTargets = Vec<(PeerId, Option<Arc<dyn DataChannel>>)>;

/// Commands sent to the connection manager actor
pub(crate) enum ManagerCommand {
    CreateRoom {
        room_id: RoomId,
        reply: Reply<()>,
    },
    JoinRoom {
        room_id: RoomId,
        reply: oneshot::Sender<()>,
    },
    GetConnectionInfo {
        reply: Reply<String>,
    },
    ConnectWithInfo {
        payload: HandshakePayload,
        reply: Reply<String>,
    },
    HandleConnectionInfo {
        payload: HandshakePayload,
        peer_id: PeerId,
        reply: Reply<Option<String>>,
    },
    CompleteHandshake {
        payload: HandshakePayload,
        peer_id: PeerId,
        reply: Reply<()>,
    },
    HandleIceCandidate {
        candidate: IceCandidate,
        peer_id: PeerId,
        reply: Reply<()>,
    },
    CreatePeerConnection {
        peer_id: PeerId,
        reply: Reply<()>,
    },
    RemovePeer {
        peer_id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    LeaveRoom {
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    ResolveTargets {
        target: Option<PeerId>,
        reply: Reply<SendTargets>,
    },
    PeerIds {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    CurrentRoom {
        reply: oneshot::Sender<Option<Room>>,
    },
    PeerState {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<ConnectionState>>,
    },
}

/// A `create_room` parked until its connection finishes gathering candidates
struct GatheringWaiter {
    peer_id: PeerId,
    connection_id: u64,
    reply: Reply<()>,
}

/// Sole owner of the room, the peer registry and the candidate buffer.
pub(crate) struct ManagerActor {
    config: ManagerConfig,
    provider: Arc<dyn TransportProvider>,
    bus: EventBus,
    room: Option<Room>,
    registry: PeerRegistry,
    gathering: Option<GatheringWaiter>,
    next_connection_id: u64,
    command_rx: mpsc::Receiver<ManagerCommand>,
    transport_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    transport_tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl ManagerActor {
    pub fn new(
        provider: Arc<dyn TransportProvider>,
        config: ManagerConfig,
        bus: EventBus,
        command_rx: mpsc::Receiver<ManagerCommand>,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            config,
            provider,
            bus,
            room: None,
            registry: PeerRegistry::default(),
            gathering: None,
            next_connection_id: 0,
            command_rx,
            transport_rx,
            transport_tx,
        }
    }

    pub async fn run(mut self) {
        debug!("Connection manager {} started", self.config.local_peer_id);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(c) => self.handle_command(c).await,
                        None => break,
                    }
                }

                Some(evt) = self.transport_rx.recv() => {
                    self.handle_transport_event(evt);
                }
            }
        }

        self.leave_room().await;
        debug!("Connection manager {} stopped", self.config.local_peer_id);
    }

    async fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::CreateRoom { room_id, reply } => self.create_room(room_id, reply).await,

            ManagerCommand::JoinRoom { room_id, reply } => {
                self.leave_room().await;
                info!("Joined room {} as guest", room_id);
                self.room = Some(Room {
                    id: room_id,
                    role: Role::Guest,
                });
                let _ = reply.send(());
            }

            ManagerCommand::GetConnectionInfo { reply } => {
                let _ = reply.send(self.connection_info());
            }

            ManagerCommand::ConnectWithInfo { payload, reply } => {
                let result = self.connect_with_info(payload).await;
                let _ = reply.send(result);
            }

            ManagerCommand::HandleConnectionInfo {
                payload,
                peer_id,
                reply,
            } => {
                let result = self.handle_connection_info(payload, peer_id).await;
                let _ = reply.send(result);
            }

            ManagerCommand::CompleteHandshake {
                payload,
                peer_id,
                reply,
            } => {
                let result = self.complete_handshake(payload, peer_id).await;
                let _ = reply.send(result);
            }

            ManagerCommand::HandleIceCandidate {
                candidate,
                peer_id,
                reply,
            } => {
                let result = match self.registry.get(&peer_id) {
                    Some(entry) => {
                        let transport = entry.transport.clone();
                        transport
                            .add_candidate(candidate)
                            .await
                            .map_err(SessionError::from)
                    }
                    None => Err(SessionError::UnknownPeer(peer_id)),
                };
                let _ = reply.send(result);
            }

            ManagerCommand::CreatePeerConnection { peer_id, reply } => {
                let result = self.create_peer_connection(peer_id).await;
                let _ = reply.send(result);
            }

            ManagerCommand::RemovePeer { peer_id, reply } => {
                let removed = self.remove_peer(&peer_id).await;
                let _ = reply.send(removed);
            }

            ManagerCommand::LeaveRoom { reply } => {
                self.leave_room().await;
                let _ = reply.send(());
            }

            ManagerCommand::Disconnect { reply } => {
                self.leave_room().await;
                info!("Disconnected");
                self.bus.publish(Event::Disconnect);
                let _ = reply.send(());
            }

            ManagerCommand::ResolveTargets { target, reply } => {
                let _ = reply.send(self.resolve_targets(target));
            }

            ManagerCommand::PeerIds { reply } => {
                let _ = reply.send(self.registry.ids());
            }

            ManagerCommand::CurrentRoom { reply } => {
                let _ = reply.send(self.room.clone());
            }

            ManagerCommand::PeerState { peer_id, reply } => {
                let _ = reply.send(self.registry.get(&peer_id).map(|e| e.state));
            }
        }
    }

    async fn create_room(&mut self, room_id: RoomId, reply: Reply<()>) {
        self.leave_room().await;
        self.room = Some(Room {
            id: room_id.clone(),
            role: Role::Host,
        });

        let host = PeerId::host();
        match self.open_offer(&host).await {
            Ok(connection_id) => {
                info!("Room {} created, gathering candidates", room_id);
                self.gathering = Some(GatheringWaiter {
                    peer_id: host,
                    connection_id,
                    reply,
                });
            }
            Err(e) => {
                warn!("Failed to create room {}: {}", room_id, e);
                self.abort_room().await;
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Open a connection with a pre-created channel and apply a local offer.
    async fn open_offer(&mut self, peer_id: &PeerId) -> Result<u64, SessionError> {
        let (connection_id, transport) = self.open_with_channel(peer_id).await?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        if let Some(entry) = self.registry.current(peer_id, connection_id) {
            entry.local_description = Some(offer);
        }
        Ok(connection_id)
    }

    async fn open_with_channel(
        &mut self,
        peer_id: &PeerId,
    ) -> Result<(u64, Arc<dyn PeerTransport>), SessionError> {
        let (connection_id, transport) = self.open_connection(peer_id).await?;
        let channel = transport.create_channel(&self.config.channel_label).await?;
        if let Some(entry) = self.registry.current(peer_id, connection_id) {
            entry.channel = Some(channel);
        }
        Ok((connection_id, transport))
    }

    /// Create a transport connection and register its entry right away, so
    /// that callbacks fired during negotiation find it.
    async fn open_connection(
        &mut self,
        peer_id: &PeerId,
    ) -> Result<(u64, Arc<dyn PeerTransport>), SessionError> {
        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;
        let sink = TransportEventSink::new(peer_id.clone(), connection_id, self.transport_tx.clone());

        let transport = self
            .provider
            .new_connection(&self.config.transport, sink)
            .await?;

        let entry = PeerEntry::new(connection_id, transport.clone());
        if let Some(old) = self.registry.insert(peer_id.clone(), entry) {
            debug!("Replacing connection {} of {}", old.connection_id, peer_id);
            self.fail_waiter_for(peer_id);
            old.close().await;
            if old.joined {
                self.bus.publish(Event::PeerLeave(peer_id.clone()));
            }
        }
        Ok((connection_id, transport))
    }

    fn connection_info(&self) -> Result<String, SessionError> {
        let room = self.room.as_ref().ok_or(SessionError::NoActiveRoom)?;
        if self.gathering.is_some() {
            return Err(SessionError::ConnectionInfoUnavailable);
        }
        let host = PeerId::host();
        let desc = self
            .registry
            .get(&host)
            .and_then(|e| e.local_description.clone())
            .ok_or(SessionError::ConnectionInfoUnavailable)?;
        Ok(HandshakePayload::new(desc, room.id.clone(), self.registry.candidates(&host)).encode())
    }

    async fn connect_with_info(&mut self, payload: HandshakePayload) -> Result<String, SessionError> {
        let host = PeerId::host();
        let joined_same_room = matches!(
            &self.room,
            Some(Room { id, role: Role::Guest }) if *id == payload.room_id
        ) && self.registry.get(&host).is_none();
        if !joined_same_room {
            self.leave_room().await;
        }
        self.room = Some(Room {
            id: payload.room_id.clone(),
            role: Role::Guest,
        });

        match self.answer_offer(&host, &payload).await {
            Ok(answer) => {
                info!("Answered offer for room {}", payload.room_id);
                self.bus.publish(Event::ConnectionInfo(answer.clone()));
                self.bus.publish(Event::RoomJoined(payload.room_id.clone()));
                Ok(HandshakePayload::new(answer, payload.room_id, self.registry.candidates(&host)).encode())
            }
            Err(e) => {
                warn!("Failed to answer offer for room {}: {}", payload.room_id, e);
                self.abort_room().await;
                Err(e)
            }
        }
    }

    /// Apply a remote offer on a fresh connection and produce the local answer.
    async fn answer_offer(
        &mut self,
        peer_id: &PeerId,
        offer: &HandshakePayload,
    ) -> Result<SessionDescription, SessionError> {
        let (connection_id, transport) = self.open_connection(peer_id).await?;
        transport.set_remote_description(offer.description()).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        for candidate in &offer.candidates {
            transport.add_candidate(candidate.clone()).await?;
        }
        if let Some(entry) = self.registry.current(peer_id, connection_id) {
            entry.local_description = Some(answer.clone());
        }
        Ok(answer)
    }

    async fn apply_answer(
        transport: Arc<dyn PeerTransport>,
        answer: &HandshakePayload,
    ) -> Result<(), SessionError> {
        transport.set_remote_description(answer.description()).await?;
        for candidate in &answer.candidates {
            transport.add_candidate(candidate.clone()).await?;
        }
        Ok(())
    }

    async fn handle_connection_info(
        &mut self,
        payload: HandshakePayload,
        peer_id: PeerId,
    ) -> Result<Option<String>, SessionError> {
        let room = self.room.clone().ok_or(SessionError::NotInRoom)?;
        if payload.room_id != room.id {
            warn!(
                "Handshake from {} names room {}, current room is {}",
                peer_id, payload.room_id, room.id
            );
        }

        match (room.role, payload.kind) {
            (Role::Host, SdpType::Offer) => match self.answer_offer(&peer_id, &payload).await {
                Ok(answer) => {
                    info!("Answered offer from {}", peer_id);
                    self.bus.publish(Event::ConnectionInfo(answer.clone()));
                    let candidates = self.registry.candidates(&peer_id);
                    Ok(Some(HandshakePayload::new(answer, room.id, candidates).encode()))
                }
                Err(e) => {
                    warn!("Failed to answer offer from {}: {}", peer_id, e);
                    self.discard_peer(&peer_id).await;
                    Err(e)
                }
            },

            (Role::Guest, SdpType::Answer) => {
                let Some(transport) = self.registry.get(&peer_id).map(|e| e.transport.clone()) else {
                    debug!("Ignoring answer for unknown peer {}", peer_id);
                    return Ok(None);
                };
                Self::apply_answer(transport, &payload).await?;
                info!("Applied answer from {}", peer_id);
                Ok(None)
            }

            (role, kind) => Err(SessionError::UnexpectedHandshake { role, kind }),
        }
    }

    async fn complete_handshake(
        &mut self,
        payload: HandshakePayload,
        peer_id: PeerId,
    ) -> Result<(), SessionError> {
        let role = self.room.as_ref().ok_or(SessionError::NotInRoom)?.role;
        if role != Role::Host || payload.kind != SdpType::Answer {
            return Err(SessionError::UnexpectedHandshake {
                role,
                kind: payload.kind,
            });
        }

        let entry = self
            .registry
            .get(&peer_id)
            .ok_or_else(|| SessionError::UnknownPeer(peer_id.clone()))?;
        let offered = matches!(
            entry.local_description,
            Some(SessionDescription {
                sdp_type: SdpType::Offer,
                ..
            })
        );
        if !offered {
            return Err(SessionError::UnexpectedHandshake {
                role,
                kind: payload.kind,
            });
        }

        Self::apply_answer(entry.transport.clone(), &payload).await?;
        info!("Handshake with {} completed", peer_id);
        Ok(())
    }

    async fn create_peer_connection(&mut self, peer_id: PeerId) -> Result<(), SessionError> {
        if self.room.is_none() {
            return Err(SessionError::NotInRoom);
        }
        if let Err(e) = self.open_with_channel(&peer_id).await {
            warn!("Failed to create connection for {}: {}", peer_id, e);
            self.discard_peer(&peer_id).await;
            return Err(e);
        }
        info!("Created connection for {}", peer_id);
        Ok(())
    }

    fn resolve_targets(&self, target: Option<PeerId>) -> Result<SendTargets, SessionError> {
        if self.room.is_none() {
            return Err(SessionError::NotInRoom);
        }
        let Some(peer_id) = target else {
            return Ok(self.registry.channels());
        };

        let entry = self
            .registry
            .get(&peer_id)
            .ok_or_else(|| SessionError::UnknownPeer(peer_id.clone()))?;
        let channel = entry
            .channel
            .clone()
            .ok_or_else(|| SessionError::ChannelNotEstablished(peer_id.clone()))?;
        if channel.ready_state() != ChannelState::Open {
            return Err(SessionError::ChannelNotOpen(peer_id));
        }
        Ok(vec![(peer_id, Some(channel))])
    }

    async fn remove_peer(&mut self, peer_id: &PeerId) -> bool {
        let Some(entry) = self.registry.remove(peer_id) else {
            return false;
        };
        self.fail_waiter_for(peer_id);
        entry.close().await;
        info!("Peer {} removed", peer_id);
        self.bus.publish(Event::PeerLeave(peer_id.clone()));
        true
    }

    /// Drop an entry whose negotiation failed, without notifying subscribers.
    async fn discard_peer(&mut self, peer_id: &PeerId) {
        if let Some(entry) = self.registry.remove(peer_id) {
            entry.close().await;
        }
    }

    fn fail_waiter_for(&mut self, peer_id: &PeerId) {
        if self.gathering.as_ref().is_some_and(|w| w.peer_id == *peer_id) {
            if let Some(waiter) = self.gathering.take() {
                let _ = waiter.reply.send(Err(SessionError::RoomClosed));
            }
        }
    }

    async fn leave_room(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        if let Some(waiter) = self.gathering.take() {
            let _ = waiter.reply.send(Err(SessionError::RoomClosed));
        }

        for (peer_id, entry) in self.registry.drain() {
            entry.close().await;
            self.bus.publish(Event::PeerLeave(peer_id));
        }

        info!("Left room {}", room.id);
        self.bus.publish(Event::RoomLeft(room.id));
    }

    /// Return to idle after a failed room operation; nothing was announced yet.
    async fn abort_room(&mut self) {
        for (_, entry) in self.registry.drain() {
            entry.close().await;
        }
        self.gathering = None;
        self.room = None;
    }

    fn handle_transport_event(&mut self, tagged: TaggedEvent) {
        let TaggedEvent {
            peer_id,
            connection_id,
            event,
        } = tagged;

        let Some(entry) = self.registry.current(&peer_id, connection_id) else {
            debug!(
                "Dropping {:?} from stale connection {} of {}",
                event, connection_id, peer_id
            );
            return;
        };

        match event {
            TransportEvent::Candidate(Some(candidate)) => {
                self.registry.push_candidate(&peer_id, candidate.clone());
                self.bus
                    .publish(Event::CandidateDiscovered { candidate, peer_id });
            }

            TransportEvent::Candidate(None) => {
                let offer = entry.local_description.clone();
                debug!("Candidate gathering complete for {}", peer_id);

                let waiting = self
                    .gathering
                    .as_ref()
                    .is_some_and(|w| w.peer_id == peer_id && w.connection_id == connection_id);
                if !waiting {
                    return;
                }
                let (Some(waiter), Some(room)) = (self.gathering.take(), self.room.as_ref()) else {
                    return;
                };
                if let Some(offer) = offer {
                    self.bus.publish(Event::ConnectionInfo(offer));
                }
                info!("Room {} ready", room.id);
                self.bus.publish(Event::RoomJoined(room.id.clone()));
                let _ = waiter.reply.send(Ok(()));
            }

            TransportEvent::ConnectivityChange(state) => {
                entry.network_state = Some(state);
                debug!("Connectivity of {} is now {:?}", peer_id, state);
                if state.is_connected() {
                    entry.state = ConnectionState::Connected;
                    let change = StateChange {
                        peer_id,
                        state: ConnectionState::Connected,
                        connectivity_state: Some(state),
                        channel_state: entry.channel.as_ref().map(|c| c.ready_state()),
                    };
                    self.bus.publish(Event::ConnectionStateChange(change));
                }
            }

            TransportEvent::DataChannel(channel) => {
                if entry.channel.is_none() {
                    debug!("Adopted channel '{}' announced by {}", channel.label(), peer_id);
                    entry.channel = Some(channel);
                } else {
                    debug!("Ignoring extra channel '{}' from {}", channel.label(), peer_id);
                }
            }

            TransportEvent::ChannelOpen => {
                entry.state = ConnectionState::Connected;
                let first_open = !entry.joined;
                entry.joined = true;
                let change = StateChange {
                    peer_id: peer_id.clone(),
                    state: ConnectionState::Connected,
                    connectivity_state: entry.network_state,
                    channel_state: Some(ChannelState::Open),
                };
                if first_open {
                    info!("Peer {} joined", peer_id);
                    self.bus.publish(Event::PeerJoin(peer_id));
                }
                self.bus.publish(Event::ConnectionStateChange(change));
            }

            TransportEvent::ChannelClose => {
                entry.state = ConnectionState::Disconnected;
                info!("Channel to {} closed", peer_id);
                self.bus
                    .publish(Event::ConnectionStateChange(StateChange {
                        peer_id,
                        state: ConnectionState::Disconnected,
                        connectivity_state: entry.network_state,
                        channel_state: Some(ChannelState::Closed),
                    }));
            }

            TransportEvent::ChannelError(reason) => {
                warn!("Channel error from {}: {}", peer_id, reason);
                if matches!(
                    entry.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    entry.state = ConnectionState::Error;
                    self.bus
                        .publish(Event::ConnectionStateChange(StateChange {
                            peer_id: peer_id.clone(),
                            state: ConnectionState::Error,
                            connectivity_state: entry.network_state,
                            channel_state: entry.channel.as_ref().map(|c| c.ready_state()),
                        }));
                }
                self.bus
                    .publish(Event::Error(format!("peer {}: {}", peer_id, reason)));
            }

            TransportEvent::ChannelMessage(text) => match Message::from_text(&text) {
                Ok(message) => self.bus.publish(Event::Message { message, peer_id }),
                Err(e) => {
                    warn!("Undecodable message from {}: {}", peer_id, e);
                    self.bus
                        .publish(Event::Error(format!("peer {}: {}", peer_id, e)));
                }
            },
        }
    }
}
