use std::sync::Arc;

use crate::network::{ConnectionId, Packet};
use crate::AppError;

/// Published once per packet read off a connection, or once when the read
/// pump halts on a fault.
///
/// On a fault, `packet` holds whatever bytes of the interrupted frame had
/// already arrived, and no further events follow on that connection.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub connection_id: ConnectionId,
    pub packet: Packet,
    pub fault: Option<Arc<AppError>>,
}

impl ReceivedEvent {
    pub(crate) fn delivered(connection_id: ConnectionId, packet: Packet) -> Self {
        ReceivedEvent {
            connection_id,
            packet,
            fault: None,
        }
    }

    pub(crate) fn faulted(connection_id: ConnectionId, partial: Packet, fault: AppError) -> Self {
        ReceivedEvent {
            connection_id,
            packet: partial,
            fault: Some(Arc::new(fault)),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.fault.is_none()
    }
}

/// Published once per packet handed to `Connection::write`.
#[derive(Debug, Clone)]
pub struct SentEvent {
    pub connection_id: ConnectionId,
    pub packet: Packet,
    pub fault: Option<Arc<AppError>>,
}

impl SentEvent {
    pub(crate) fn new(connection_id: ConnectionId, packet: Packet, fault: Option<AppError>) -> Self {
        SentEvent {
            connection_id,
            packet,
            fault: fault.map(Arc::new),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.fault.is_none()
    }
}
