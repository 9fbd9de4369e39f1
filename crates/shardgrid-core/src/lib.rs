//! shardgrid-core: shared types for the ShardGrid cluster coordinator.
//!
//! Phase enums, node addresses, shard specs, the cluster config file
//! model, and the static topology resolver.

pub mod config;
pub mod error;
pub mod topology;
pub mod types;

pub use config::ClusterConfig;
pub use error::{ConfigError, PhaseError, TopologyError};
pub use topology::{ClusterTopology, EntityGroup, NodeSet, ShardGroupMembership};
pub use types::*;
