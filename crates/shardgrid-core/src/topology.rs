//! Static topology resolution.
//!
//! Expands the configured node sets into concrete addresses and answers
//! ownership questions: which shard index a node holds for a workload
//! kind, and which shards a node runs for each declared group. Resolved
//! once at startup and read-only afterwards.

use std::collections::{HashMap, HashSet};

use crate::config::ClusterConfig;
use crate::error::{TopologyError, TopologyResult};
use crate::types::{NodeAddress, ShardSpec};

/// A resolved node set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSet {
    pub name: String,
    pub nodes: Vec<NodeAddress>,
    pub workload_kinds: Vec<String>,
}

/// A declared entity shard group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityGroup {
    pub name: String,
    pub workload_kinds: Vec<String>,
}

/// Shards a single node runs, per group, in group declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardGroupMembership {
    pub groups: Vec<Vec<ShardSpec>>,
}

impl ShardGroupMembership {
    pub fn group(&self, index: usize) -> &[ShardSpec] {
        self.groups.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of locally owned shards across all groups.
    pub fn shard_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }
}

/// The immutable cluster layout.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    node_sets: Vec<NodeSet>,
    groups: Vec<EntityGroup>,
    /// workload kind → index into `node_sets`.
    kind_owner: HashMap<String, usize>,
    /// All nodes, node sets in declared order.
    all_nodes: Vec<NodeAddress>,
}

impl ClusterTopology {
    /// Resolve the topology declared in `config`.
    pub fn from_config(config: &ClusterConfig) -> TopologyResult<Self> {
        let mut node_sets = Vec::with_capacity(config.node_sets.len());
        let mut all_nodes = Vec::new();
        let mut seen_nodes = HashSet::new();
        let mut kind_owner: HashMap<String, usize> = HashMap::new();

        for (set_index, set) in config.node_sets.iter().enumerate() {
            if set.count == 0 {
                return Err(TopologyError::EmptyNodeSet(set.name.clone()));
            }

            let nodes = expand_nodes(&set.name, &set.host, set.port, set.count)?;
            for node in &nodes {
                if !seen_nodes.insert(node.clone()) {
                    return Err(TopologyError::DuplicateNode(node.to_string()));
                }
            }
            all_nodes.extend(nodes.iter().cloned());

            for kind in &set.workload_kinds {
                if let Some(&first) = kind_owner.get(kind) {
                    return Err(TopologyError::AmbiguousOwnership {
                        kind: kind.clone(),
                        first: config.node_sets[first].name.clone(),
                        second: set.name.clone(),
                    });
                }
                kind_owner.insert(kind.clone(), set_index);
            }

            node_sets.push(NodeSet {
                name: set.name.clone(),
                nodes,
                workload_kinds: set.workload_kinds.clone(),
            });
        }

        let mut groups = Vec::with_capacity(config.groups.len());
        let mut group_names = HashSet::new();
        let mut grouped_kinds = HashSet::new();
        for group in &config.groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(TopologyError::DuplicateGroup(group.name.clone()));
            }
            for kind in &group.workload_kinds {
                if !kind_owner.contains_key(kind) {
                    return Err(TopologyError::UnknownKind {
                        group: group.name.clone(),
                        kind: kind.clone(),
                    });
                }
                if !grouped_kinds.insert(kind.as_str()) {
                    return Err(TopologyError::KindInMultipleGroups(kind.clone()));
                }
            }
            groups.push(EntityGroup {
                name: group.name.clone(),
                workload_kinds: group.workload_kinds.clone(),
            });
        }

        Ok(Self {
            node_sets,
            groups,
            kind_owner,
            all_nodes,
        })
    }

    pub fn all_nodes(&self) -> &[NodeAddress] {
        &self.all_nodes
    }

    pub fn node_count(&self) -> usize {
        self.all_nodes.len()
    }

    pub fn contains(&self, node: &NodeAddress) -> bool {
        self.all_nodes.contains(node)
    }

    pub fn node_sets(&self) -> &[NodeSet] {
        &self.node_sets
    }

    pub fn groups(&self) -> &[EntityGroup] {
        &self.groups
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Nodes that own shards of `kind`, in shard index order.
    pub fn owning_nodes(&self, kind: &str) -> Option<&[NodeAddress]> {
        self.kind_owner
            .get(kind)
            .map(|&idx| self.node_sets[idx].nodes.as_slice())
    }

    /// The shard index `node` owns for `kind`, if it owns one.
    pub fn resolve_owned_shard_index(&self, kind: &str, node: &NodeAddress) -> Option<usize> {
        self.owning_nodes(kind)?.iter().position(|n| n == node)
    }

    /// Shards of `group` owned by `node`, in the group's declared kind order.
    pub fn owned_kinds_for_group(&self, group: usize, node: &NodeAddress) -> Vec<ShardSpec> {
        let Some(group) = self.groups.get(group) else {
            return Vec::new();
        };

        group
            .workload_kinds
            .iter()
            .filter_map(|kind| {
                let owners = self.owning_nodes(kind)?;
                let shard_index = owners.iter().position(|n| n == node)?;
                Some(ShardSpec {
                    kind: kind.clone(),
                    shard_index,
                    shard_count: owners.len(),
                    node: node.clone(),
                })
            })
            .collect()
    }

    /// Compute the per-group shard membership of `node`.
    pub fn membership(&self, node: &NodeAddress) -> TopologyResult<ShardGroupMembership> {
        if !self.contains(node) {
            return Err(TopologyError::UnknownNode(node.to_string()));
        }
        let groups = (0..self.groups.len())
            .map(|g| self.owned_kinds_for_group(g, node))
            .collect();
        Ok(ShardGroupMembership { groups })
    }
}

fn expand_nodes(set: &str, host: &str, port: u16, count: usize) -> TopologyResult<Vec<NodeAddress>> {
    (0..count)
        .map(|i| -> TopologyResult<NodeAddress> {
            if host.contains("{index}") {
                return Ok(NodeAddress::new(host.replace("{index}", &i.to_string()), port));
            }
            let port = u16::try_from(i)
                .ok()
                .and_then(|offset| port.checked_add(offset))
                .ok_or_else(|| TopologyError::PortRangeOverflow {
                    set: set.to_string(),
                    port,
                    count,
                })?;
            Ok(NodeAddress::new(host, port))
        })
        .collect()
}
