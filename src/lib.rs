//! Length-prefixed packet transport over TCP.
//!
//! A [`Server`] accepts streams and hands out server-owned [`Connection`]s; a
//! client builds its own [`Connection`] and opens it. Either side writes
//! [`Packet`]s and subscribes to the received/sent notifications of a
//! connection.

pub mod network;
pub mod service;

pub use network::{
    Connection, ConnectionId, ConnectionRegistry, Packet, ReceivedEvent, SentEvent,
    LENGTH_PREFIX_SIZE,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ConnectedEvent, ConnectionConfig,
    LogConfig, PacketwireConfig, Server, ServerConfig,
};
