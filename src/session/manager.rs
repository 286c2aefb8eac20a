use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::actor::{ManagerActor, ManagerCommand, Reply};
use super::types::{ConnectionState, PeerId, Role, RoomId, SessionError};
use crate::config::ManagerConfig;
use crate::events::{Event, EventBus};
use crate::protocol::{HandshakePayload, Message};
use crate::retry::RetryPolicy;
use crate::transport::{ChannelState, DataChannel, IceCandidate, SdpType, TransportProvider};

/// Handle to a connection manager actor.
///
/// Cloning the handle shares the same manager. The actor stops, leaving its
/// room, once every handle has been dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    tx: mpsc::Sender<ManagerCommand>,
    bus: EventBus,
    retry: RetryPolicy,
    local_peer_id: PeerId,
}

impl ConnectionManager {
    /// Spawn the manager actor on the current tokio runtime.
    pub fn new(provider: Arc<dyn TransportProvider>, config: ManagerConfig) -> Self {
        let (tx, rx) = mpsc::channel::<ManagerCommand>(config.command_buffer.max(1));
        let bus = EventBus::new();
        let retry = config.retry;
        let local_peer_id = config.local_peer_id.clone();

        tokio::spawn(ManagerActor::new(provider, config, bus.clone(), rx).run());

        Self {
            tx,
            bus,
            retry,
            local_peer_id,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Create a room as Host and wait until the offer carries every local candidate.
    pub async fn create_room(&self, room_id: impl Into<RoomId>) -> Result<(), SessionError> {
        let room_id = room_id.into();
        let result = self
            .retry
            .run_if(
                |_| {
                    let room_id = room_id.clone();
                    self.call(|reply| ManagerCommand::CreateRoom { room_id, reply })
                },
                SessionError::is_retryable,
            )
            .await;
        self.report(result, "create room")
    }

    /// Record a Guest room; the connection itself is made by [`connect_with_info`](Self::connect_with_info).
    pub async fn join_room(&self, room_id: impl Into<RoomId>) -> Result<(), SessionError> {
        let room_id = room_id.into();
        self.query(|reply| ManagerCommand::JoinRoom { room_id, reply })
            .await
    }

    /// Encoded handshake payload of the local `"host"` connection.
    pub async fn get_connection_info(&self) -> Result<String, SessionError> {
        self.call(|reply| ManagerCommand::GetConnectionInfo { reply })
            .await
    }

    /// Accept a Host's offer as Guest. Returns the encoded answer.
    pub async fn connect_with_info(&self, encoded: &str) -> Result<String, SessionError> {
        let payload = match HandshakePayload::decode(encoded) {
            Ok(payload) if payload.kind == SdpType::Offer => payload,
            Ok(payload) => {
                let e = SessionError::InvalidHandshakePayload(format!(
                    "expected an offer, got an {}",
                    payload.kind
                ));
                return self.report(Err(e), "connect");
            }
            Err(e) => return self.report(Err(e), "connect"),
        };

        let result = self
            .retry
            .run_if(
                |_| {
                    let payload = payload.clone();
                    self.call(|reply| ManagerCommand::ConnectWithInfo { payload, reply })
                },
                SessionError::is_retryable,
            )
            .await;
        self.report(result, "connect")
    }

    /// Host: answer an offer from an additional peer, returning the encoded answer.
    /// Guest: apply the answer of the given peer; returns `None`.
    pub async fn handle_connection_info(
        &self,
        info: &str,
        peer_id: impl Into<PeerId>,
    ) -> Result<Option<String>, SessionError> {
        let payload = HandshakePayload::decode(info)?;
        let peer_id = peer_id.into();
        self.call(|reply| ManagerCommand::HandleConnectionInfo {
            payload,
            peer_id,
            reply,
        })
        .await
    }

    /// Host: apply a Guest's answer to the offer made for `peer_id`.
    pub async fn complete_handshake(
        &self,
        info: &str,
        peer_id: impl Into<PeerId>,
    ) -> Result<(), SessionError> {
        let payload = HandshakePayload::decode(info)?;
        let peer_id = peer_id.into();
        self.call(|reply| ManagerCommand::CompleteHandshake {
            payload,
            peer_id,
            reply,
        })
        .await
    }

    pub async fn handle_ice_candidate(
        &self,
        candidate: IceCandidate,
        peer_id: impl Into<PeerId>,
    ) -> Result<(), SessionError> {
        let peer_id = peer_id.into();
        self.call(|reply| ManagerCommand::HandleIceCandidate {
            candidate,
            peer_id,
            reply,
        })
        .await
    }

    /// Register an outbound connection with its channel; the handshake for it
    /// is completed out-of-band.
    pub async fn create_peer_connection(
        &self,
        peer_id: impl Into<PeerId>,
    ) -> Result<(), SessionError> {
        let peer_id = peer_id.into();
        self.call(|reply| ManagerCommand::CreatePeerConnection { peer_id, reply })
            .await
    }

    /// Close and forget one peer. Returns whether it was known.
    pub async fn remove_peer(&self, peer_id: impl Into<PeerId>) -> Result<bool, SessionError> {
        let peer_id = peer_id.into();
        self.query(|reply| ManagerCommand::RemovePeer { peer_id, reply })
            .await
    }

    pub async fn leave_room(&self) -> Result<(), SessionError> {
        self.query(|reply| ManagerCommand::LeaveRoom { reply }).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.query(|reply| ManagerCommand::Disconnect { reply }).await
    }

    /// Send to `target`, or to every known peer when `None`.
    ///
    /// A broadcast sends to all peers concurrently and waits for every send;
    /// the first failure to complete is returned while the other sends still
    /// run to completion.
    pub async fn send_message(
        &self,
        message: Message,
        target: Option<PeerId>,
    ) -> Result<(), SessionError> {
        let text = message.to_text()?;
        let targets = self
            .call(|reply| ManagerCommand::ResolveTargets { target, reply })
            .await?;

        let mut sends: FuturesUnordered<_> = targets
            .into_iter()
            .map(|(peer_id, channel)| {
                let text = text.clone();
                let retry = self.retry;
                tokio::spawn(async move {
                    retry
                        .run_if(
                            |_| send_to(&peer_id, channel.clone(), &text),
                            SessionError::is_retryable,
                        )
                        .await
                })
            })
            .collect();

        let mut first_error = None;
        while let Some(joined) = sends.next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(SessionError::Internal(format!("send task failed: {}", e)))
            });
            if let Err(e) = result {
                warn!("Send failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.bus.publish(Event::Message {
            message,
            peer_id: self.local_peer_id.clone(),
        });
        Ok(())
    }

    pub async fn get_peer_ids(&self) -> Result<Vec<PeerId>, SessionError> {
        self.query(|reply| ManagerCommand::PeerIds { reply }).await
    }

    pub async fn get_current_room(&self) -> Result<Option<RoomId>, SessionError> {
        let room = self.query(|reply| ManagerCommand::CurrentRoom { reply }).await?;
        Ok(room.map(|r| r.id))
    }

    pub async fn current_role(&self) -> Result<Option<Role>, SessionError> {
        let room = self.query(|reply| ManagerCommand::CurrentRoom { reply }).await?;
        Ok(room.map(|r| r.role))
    }

    pub async fn peer_state(
        &self,
        peer_id: impl Into<PeerId>,
    ) -> Result<Option<ConnectionState>, SessionError> {
        let peer_id = peer_id.into();
        self.query(|reply| ManagerCommand::PeerState { peer_id, reply })
            .await
    }

    /// Whether the `"host"` peer is connected.
    pub async fn is_connected(&self) -> Result<bool, SessionError> {
        self.is_peer_connected(PeerId::host()).await
    }

    pub async fn is_peer_connected(&self, peer_id: impl Into<PeerId>) -> Result<bool, SessionError> {
        let state = self.peer_state(peer_id).await?;
        Ok(state == Some(ConnectionState::Connected))
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| actor_gone())?;
        reply_rx.await.map_err(|_| actor_gone())
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> ManagerCommand,
    ) -> Result<T, SessionError> {
        self.query(make).await?
    }

    fn report<T>(&self, result: Result<T, SessionError>, operation: &str) -> Result<T, SessionError> {
        if let Err(e) = &result {
            error!("Failed to {}: {}", operation, e);
            self.bus.publish(Event::Error(e.to_string()));
        }
        result
    }
}

fn actor_gone() -> SessionError {
    SessionError::Internal("actor channel closed".to_string())
}

async fn send_to(
    peer_id: &PeerId,
    channel: Option<Arc<dyn DataChannel>>,
    text: &str,
) -> Result<(), SessionError> {
    let channel = channel.ok_or_else(|| SessionError::ChannelNotEstablished(peer_id.clone()))?;
    if channel.ready_state() != ChannelState::Open {
        return Err(SessionError::ChannelNotOpen(peer_id.clone()));
    }
    channel.send(text).await?;
    debug!("Sent {} bytes to {}", text.len(), peer_id);
    Ok(())
}
