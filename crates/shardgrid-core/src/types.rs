//! Domain types shared by the coordinator, its transports, and the daemon.
//!
//! Phases travel on the wire as their ordinal (`u8`), so both phase enums
//! serialize through `u8` and reject out-of-range values on the way in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PhaseError;

// ── Phases ─────────────────────────────────────────────────────────

/// Node-level lifecycle phase.
///
/// Ordered: a node only ever moves forward through these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ClusterPhase {
    Connecting,
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl ClusterPhase {
    /// Every phase in lifecycle order.
    pub const ALL: [ClusterPhase; 5] = [
        ClusterPhase::Connecting,
        ClusterPhase::Starting,
        ClusterPhase::Running,
        ClusterPhase::Stopping,
        ClusterPhase::Terminated,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterPhase::Connecting => "connecting",
            ClusterPhase::Starting => "starting",
            ClusterPhase::Running => "running",
            ClusterPhase::Stopping => "stopping",
            ClusterPhase::Terminated => "terminated",
        }
    }
}

impl TryFrom<u8> for ClusterPhase {
    type Error = PhaseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ClusterPhase::ALL
            .get(value as usize)
            .copied()
            .ok_or(PhaseError::InvalidOrdinal {
                kind: "cluster",
                value,
            })
    }
}

impl From<ClusterPhase> for u8 {
    fn from(phase: ClusterPhase) -> u8 {
        phase.ordinal()
    }
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of one entity shard group on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EntityGroupPhase {
    Pending,
    Created,
    Running,
    Stopped,
    Terminated,
}

impl EntityGroupPhase {
    /// Every phase in lifecycle order.
    pub const ALL: [EntityGroupPhase; 5] = [
        EntityGroupPhase::Pending,
        EntityGroupPhase::Created,
        EntityGroupPhase::Running,
        EntityGroupPhase::Stopped,
        EntityGroupPhase::Terminated,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// The phase that follows this one, or `None` for `Terminated`.
    pub fn next(self) -> Option<EntityGroupPhase> {
        EntityGroupPhase::ALL.get(self as usize + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityGroupPhase::Pending => "pending",
            EntityGroupPhase::Created => "created",
            EntityGroupPhase::Running => "running",
            EntityGroupPhase::Stopped => "stopped",
            EntityGroupPhase::Terminated => "terminated",
        }
    }
}

impl TryFrom<u8> for EntityGroupPhase {
    type Error = PhaseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        EntityGroupPhase::ALL
            .get(value as usize)
            .copied()
            .ok_or(PhaseError::InvalidOrdinal {
                kind: "entity group",
                value,
            })
    }
}

impl From<EntityGroupPhase> for u8 {
    fn from(phase: EntityGroupPhase) -> u8 {
        phase.ordinal()
    }
}

impl fmt::Display for EntityGroupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Addresses ──────────────────────────────────────────────────────

/// Address of a cluster node (`host:port`).
///
/// Serialized as the `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PhaseError::InvalidAddress(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(NodeAddress::new(host, port))
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = PhaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddress> for String {
    fn from(addr: NodeAddress) -> String {
        addr.to_string()
    }
}

// ── Shards ─────────────────────────────────────────────────────────

/// Everything a workload runtime needs to instantiate one shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardSpec {
    /// Workload kind this shard runs.
    pub kind: String,
    /// Index of this shard among the kind's owning nodes.
    pub shard_index: usize,
    /// Total number of shards for the kind.
    pub shard_count: usize,
    /// Node that owns this shard.
    pub node: NodeAddress,
}

impl fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}/{}", self.kind, self.shard_index, self.shard_count)
    }
}
