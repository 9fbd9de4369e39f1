//! In-process transport.
//!
//! A `MemoryNetwork` is a shared registry of node event queues. Every
//! node that joins gets a `MemoryTransport` for sending and the receiver
//! for its own events. Links can be cut and healed to exercise the
//! disconnect paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::trace;

use shardgrid_core::NodeAddress;

use super::{event_channel, EventReceiver, EventSender, Transport, TransportError, TransportEvent};
use crate::gossip::GossipMessage;

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeAddress, EventSender>,
    /// Cut links, stored with the smaller address first.
    cut: HashSet<(NodeAddress, NodeAddress)>,
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address` and return its transport and event queue.
    ///
    /// Joining again replaces the previous registration.
    pub fn join(&self, address: NodeAddress) -> (MemoryTransport, EventReceiver) {
        let (tx, rx) = event_channel();
        self.state
            .lock()
            .expect("memory network lock")
            .nodes
            .insert(address.clone(), tx);

        let transport = MemoryTransport {
            local: address,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Remove `address`; every other node sees it disassociate.
    pub fn leave(&self, address: &NodeAddress) {
        let mut state = self.state.lock().expect("memory network lock");
        if state.nodes.remove(address).is_none() {
            return;
        }
        for tx in state.nodes.values() {
            let _ = tx.send(TransportEvent::Disassociated(address.clone()));
        }
    }

    /// Cut the link between `a` and `b`, notifying both sides.
    pub fn cut(&self, a: &NodeAddress, b: &NodeAddress) {
        let mut state = self.state.lock().expect("memory network lock");
        if !state.cut.insert(link(a, b)) {
            return;
        }
        if let Some(tx) = state.nodes.get(a) {
            let _ = tx.send(TransportEvent::Disassociated(b.clone()));
        }
        if let Some(tx) = state.nodes.get(b) {
            let _ = tx.send(TransportEvent::Disassociated(a.clone()));
        }
    }

    /// Restore a cut link, notifying both sides.
    pub fn heal(&self, a: &NodeAddress, b: &NodeAddress) {
        let mut state = self.state.lock().expect("memory network lock");
        if !state.cut.remove(&link(a, b)) {
            return;
        }
        if let Some(tx) = state.nodes.get(a) {
            let _ = tx.send(TransportEvent::Associated(b.clone()));
        }
        if let Some(tx) = state.nodes.get(b) {
            let _ = tx.send(TransportEvent::Associated(a.clone()));
        }
    }

    fn deliver(
        &self,
        from: &NodeAddress,
        to: &NodeAddress,
        message: GossipMessage,
    ) -> Result<(), TransportError> {
        let state = self.state.lock().expect("memory network lock");
        if state.cut.contains(&link(from, to)) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        let tx = state
            .nodes
            .get(to)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
        trace!(%from, %to, "delivering in-memory gossip");
        tx.send(TransportEvent::Received {
            from: from.clone(),
            message,
        })
        .map_err(|_| TransportError::Unreachable(to.clone()))
    }
}

/// One node's handle onto a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    local: NodeAddress,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn local_address(&self) -> &NodeAddress {
        &self.local
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: &NodeAddress, message: GossipMessage) -> Result<(), TransportError> {
        self.network.deliver(&self.local, to, message)
    }
}

fn link(a: &NodeAddress, b: &NodeAddress) -> (NodeAddress, NodeAddress) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}
