//! Point-to-point message transport between coordinators.
//!
//! Sends are best effort and never block the coordinator loop. Inbound
//! messages and connection lifecycle changes arrive as [`TransportEvent`]s
//! on an unbounded channel that the coordinator drains.

pub mod memory;
pub mod tcp;

use thiserror::Error;
use tokio::sync::mpsc;

use shardgrid_core::NodeAddress;

use crate::gossip::GossipMessage;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// Sender half of a coordinator's transport event queue.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half of a coordinator's transport event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Notifications delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection to the peer has been established.
    Associated(NodeAddress),
    /// The connection to the peer has been lost.
    Disassociated(NodeAddress),
    /// A gossip message arrived.
    Received {
        from: NodeAddress,
        message: GossipMessage,
    },
}

/// Errors surfaced by a transport send.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeAddress),

    #[error("transport is closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Best-effort delivery of gossip to a named peer.
pub trait Transport: Send + Sync + 'static {
    /// Queue `message` for `to`. Must not block.
    fn send(&self, to: &NodeAddress, message: GossipMessage) -> Result<(), TransportError>;
}

/// Create a fresh transport event queue.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
