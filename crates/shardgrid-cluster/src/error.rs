//! Coordinator error types and process exit codes.

use std::time::Duration;

use thiserror::Error;

use shardgrid_core::{NodeAddress, TopologyError};

/// Exit status when a workload shard could not be created or reported a
/// startup failure.
pub const EXIT_SHARD_START_FAILED: i32 = 100;

/// Exit status when shards did not become ready within the readiness timeout.
pub const EXIT_SHARD_READY_TIMEOUT: i32 = 101;

/// Exit status when the cluster did not connect within the connect timeout.
pub const EXIT_CONNECT_TIMEOUT: i32 = 102;

/// Exit status for every other error.
pub const EXIT_FAILURE: i32 = 1;

/// Result type alias for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors raised by the cluster coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("node {0} is not part of the cluster topology")]
    UnknownNode(NodeAddress),

    #[error("phase report from {peer} has {got} group phases, expected {expected}")]
    GroupCountMismatch {
        peer: NodeAddress,
        got: usize,
        expected: usize,
    },

    #[error("timed out after {0:?} waiting for the cluster to connect")]
    ConnectTimeout(Duration),

    #[error("timed out after {timeout:?} waiting for phase {phase}")]
    PhaseTimeout {
        phase: shardgrid_core::ClusterPhase,
        timeout: Duration,
    },

    #[error("failed to create shard {shard}: {source}")]
    ShardCreate {
        shard: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("shard {shard} failed to start: {reason}")]
    ShardStart { shard: String, reason: String },

    #[error("shards of group `{group}` not ready after {timeout:?}: {pending:?}")]
    ReadyTimeout {
        group: String,
        timeout: Duration,
        pending: Vec<String>,
    },

    #[error("a cluster coordinator is already running in this process")]
    AlreadyRunning,

    #[error("coordinator has stopped")]
    Closed,

    #[error("group operation task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl CoordinatorError {
    /// Whether this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinatorError::ShardCreate { .. }
                | CoordinatorError::ShardStart { .. }
                | CoordinatorError::ReadyTimeout { .. }
                | CoordinatorError::TaskFailed(_)
        )
    }

    /// Process exit status a supervisor sees for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoordinatorError::ShardCreate { .. } | CoordinatorError::ShardStart { .. } => {
                EXIT_SHARD_START_FAILED
            }
            CoordinatorError::ReadyTimeout { .. } => EXIT_SHARD_READY_TIMEOUT,
            CoordinatorError::ConnectTimeout(_) => EXIT_CONNECT_TIMEOUT,
            _ => EXIT_FAILURE,
        }
    }
}
