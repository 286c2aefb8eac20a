//! Serverless peer-to-peer sessions established through out-of-band handshakes

pub mod config;
pub mod events;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod transport;

pub use config::ManagerConfig;
pub use events::{Event, EventBus, EventKind, StateChange, Subscription};
pub use protocol::{HandshakePayload, Message};
pub use retry::RetryPolicy;
pub use session::{ConnectionManager, ConnectionState, PeerId, Role, RoomId, SessionError};
