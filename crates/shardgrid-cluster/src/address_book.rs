//! Address book: per-peer connectivity and last known phases.
//!
//! Holds one entry for every node of the static topology, this node
//! included. Entries are never removed; a disconnected peer keeps its last
//! known phases so barrier checks still see them.

use std::collections::HashMap;

use tracing::debug;

use shardgrid_core::{ClusterPhase, EntityGroupPhase, NodeAddress};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::phase::PhaseReport;

/// What this node knows about one cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub address: NodeAddress,
    pub is_self: bool,
    pub connected: bool,
    pub report: PhaseReport,
}

/// View of every node in the cluster.
#[derive(Debug, Clone)]
pub struct AddressBook {
    peers: Vec<PeerState>,
    index: HashMap<NodeAddress, usize>,
    self_index: usize,
    group_count: usize,
}

impl AddressBook {
    /// Build the book for `nodes`, which must include `self_address`.
    ///
    /// This node starts connected; everyone else starts disconnected at the
    /// initial phases.
    pub fn new(
        self_address: &NodeAddress,
        nodes: &[NodeAddress],
        group_count: usize,
    ) -> CoordinatorResult<Self> {
        let mut peers = Vec::with_capacity(nodes.len());
        let mut index = HashMap::with_capacity(nodes.len());

        for node in nodes {
            if index.contains_key(node) {
                continue;
            }
            let is_self = node == self_address;
            index.insert(node.clone(), peers.len());
            peers.push(PeerState {
                address: node.clone(),
                is_self,
                connected: is_self,
                report: PhaseReport::initial(group_count),
            });
        }

        let self_index = *index
            .get(self_address)
            .ok_or_else(|| CoordinatorError::UnknownNode(self_address.clone()))?;

        Ok(Self {
            peers,
            index,
            self_index,
            group_count,
        })
    }

    pub fn self_address(&self) -> &NodeAddress {
        &self.peers[self.self_index].address
    }

    pub fn is_self(&self, address: &NodeAddress) -> bool {
        self.self_address() == address
    }

    /// Number of nodes in the cluster, this node included.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.group_count
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.index.contains_key(address)
    }

    pub fn get(&self, address: &NodeAddress) -> Option<&PeerState> {
        self.index.get(address).map(|&i| &self.peers[i])
    }

    pub fn is_connected(&self, address: &NodeAddress) -> bool {
        self.get(address).is_some_and(|p| p.connected)
    }

    /// Every node, this one included, in topology order.
    pub fn peers(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.iter()
    }

    /// Remote peers currently marked connected.
    pub fn connected_remotes(&self) -> Vec<NodeAddress> {
        self.peers
            .iter()
            .filter(|p| !p.is_self && p.connected)
            .map(|p| p.address.clone())
            .collect()
    }

    /// Remote peers currently marked disconnected.
    pub fn disconnected_remotes(&self) -> Vec<NodeAddress> {
        self.peers
            .iter()
            .filter(|p| !p.is_self && !p.connected)
            .map(|p| p.address.clone())
            .collect()
    }

    /// Connected nodes, this one included.
    pub fn connected_count(&self) -> usize {
        self.peers.iter().filter(|p| p.connected).count()
    }

    /// Mark a peer connected. Returns true if it was not connected before.
    pub fn mark_connected(&mut self, address: &NodeAddress) -> bool {
        match self.index.get(address) {
            Some(&i) if !self.peers[i].connected => {
                self.peers[i].connected = true;
                debug!(peer = %address, "peer marked connected");
                true
            }
            _ => false,
        }
    }

    /// Mark a peer disconnected, keeping its last known phases.
    ///
    /// Returns true if it was connected before. This node is never
    /// disconnected from itself.
    pub fn mark_disconnected(&mut self, address: &NodeAddress) -> bool {
        match self.index.get(address) {
            Some(&i) if !self.peers[i].is_self && self.peers[i].connected => {
                self.peers[i].connected = false;
                debug!(peer = %address, "peer marked disconnected");
                true
            }
            _ => false,
        }
    }

    /// Fold a peer's report into its entry without ever regressing.
    ///
    /// Returns whether the stored report changed.
    pub fn merge_report(
        &mut self,
        address: &NodeAddress,
        report: &PhaseReport,
    ) -> CoordinatorResult<bool> {
        let &i = self
            .index
            .get(address)
            .ok_or_else(|| CoordinatorError::UnknownNode(address.clone()))?;
        self.check_group_count(address, report)?;
        Ok(self.peers[i].report.merge(report))
    }

    /// Reject a report whose group vector has the wrong length.
    pub fn check_group_count(
        &self,
        address: &NodeAddress,
        report: &PhaseReport,
    ) -> CoordinatorResult<()> {
        if report.group_phases.len() != self.group_count {
            return Err(CoordinatorError::GroupCountMismatch {
                peer: address.clone(),
                got: report.group_phases.len(),
                expected: self.group_count,
            });
        }
        Ok(())
    }

    /// Refresh this node's own entry.
    pub fn set_self_report(&mut self, report: &PhaseReport) {
        let entry = &mut self.peers[self.self_index].report;
        debug_assert_eq!(entry.group_phases.len(), report.group_phases.len());
        entry.merge(report);
    }

    /// Whether every known node reports at least `phase` for `group`.
    pub fn all_report_at_least(&self, group: usize, phase: EntityGroupPhase) -> bool {
        self.peers
            .iter()
            .all(|p| p.report.group_phases.get(group).is_some_and(|g| *g >= phase))
    }

    /// Highest cluster phase any node has reported as its local phase.
    pub fn max_local_phase(&self) -> ClusterPhase {
        self.peers
            .iter()
            .map(|p| p.report.local_phase)
            .max()
            .unwrap_or(ClusterPhase::Connecting)
    }
}
