//! Error types for configuration, topology resolution, and phase decoding.

use thiserror::Error;

/// Result type alias for config loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type alias for topology resolution.
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Errors raised while decoding phases or addresses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("invalid {kind} phase ordinal: {value}")]
    InvalidOrdinal { kind: &'static str, value: u8 },

    #[error("invalid node address (expected host:port): {0}")]
    InvalidAddress(String),
}

/// Errors that can occur while loading the cluster config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for `{field}`: {value}")]
    InvalidDuration { field: String, value: String },
}

/// Errors found while resolving the static cluster topology.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("node set `{0}` has no nodes")]
    EmptyNodeSet(String),

    #[error("node address {0} appears more than once")]
    DuplicateNode(String),

    #[error("workload kind `{kind}` is owned by both `{first}` and `{second}`")]
    AmbiguousOwnership {
        kind: String,
        first: String,
        second: String,
    },

    #[error("group `{group}` references unknown workload kind `{kind}`")]
    UnknownKind { group: String, kind: String },

    #[error("workload kind `{0}` is declared in more than one group")]
    KindInMultipleGroups(String),

    #[error("duplicate group name `{0}`")]
    DuplicateGroup(String),

    #[error("node {0} is not part of the cluster topology")]
    UnknownNode(String),

    #[error("node set `{set}` needs {count} consecutive ports from {port}, past 65535")]
    PortRangeOverflow { set: String, port: u16, count: usize },
}
