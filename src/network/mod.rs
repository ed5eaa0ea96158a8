//! Network Module Implementation
//!
//! This module provides the packet transport: exact-size transfers over byte
//! streams, the length-prefixed framing, connections and the registry a
//! server keeps them in.
//!
//! # Architecture
//!
//! The network module is built on tokio's async I/O primitives and consists of:
//! - Transfer operations that keep reissuing partial reads/writes until a
//!   buffer is complete
//! - Packet framing (`u32` big-endian length prefix + payload)
//! - Connections running one read pump task and one writer task each
//! - A concurrent registry of server-owned connections
//!
//! # Components
//!
//! - `ReadOperation` / `WriteOperation`: exact-size transfers
//! - `Packet`: the message envelope and its wire format
//! - `Connection`: one stream, its read pump, its write queue and its
//!   received/sent notifications
//! - `Notifier`: fan-out of events to bounded subscriptions; a slow
//!   subscriber holds the publisher back rather than missing events
//! - `ConnectionRegistry`: live connections owned by a server

pub use connection::{Connection, ConnectionId};
pub use event::{ReceivedEvent, SentEvent};
pub use packet::{Packet, LENGTH_PREFIX_SIZE};
pub use registry::ConnectionRegistry;
pub use transfer::{ReadOperation, TransferOutcome, WriteOperation};

mod connection;
mod event;
pub(crate) mod notify;
mod packet;
mod registry;
pub mod transfer;
