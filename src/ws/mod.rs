//! WebSocket 连接与 Hub / WebSocket connections and hub

pub mod connection;
pub mod hub;
pub mod inbound;
pub mod session;

pub use connection::{CloseKind, Connection, ConnectionState, ConnectionTiming, FrameSink, WriteExit};
pub use hub::{Hub, HubStats, NoopPresence, PresenceWriter};
pub use inbound::{InboundAction, InboundHandler};
