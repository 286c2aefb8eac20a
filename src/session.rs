//! Room lifecycle, peer registry and handshake orchestration

mod actor;
mod manager;
mod registry;
mod types;

pub use manager::ConnectionManager;
pub use types::{ConnectionState, HOST_PEER_ID, PeerId, Role, Room, RoomId, SessionError};
