//! Cluster configuration parser.
//!
//! The whole cluster shares one TOML file: node sets, workload groups, the
//! optional cluster cookie, and coordinator timings. Durations are kept as
//! strings here and resolved with [`parse_duration`] by whoever consumes
//! them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub cluster: ClusterSection,
    pub coordinator: Option<CoordinatorConfig>,
    #[serde(default)]
    pub node_sets: Vec<NodeSetConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    pub workloads: Option<BTreeMap<String, WorkloadConfig>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Shared string that peers must present when they first connect.
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub tick_interval: Option<String>,
    pub ready_timeout: Option<String>,
    pub ready_poll_interval: Option<String>,
    pub ready_log_interval: Option<String>,
    pub stop_poll_interval: Option<String>,
    pub stop_timeout: Option<String>,
    pub connect_timeout: Option<String>,
}

/// A homogeneous set of nodes that together own some workload kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSetConfig {
    pub name: String,
    /// Host name, optionally containing `{index}`.
    ///
    /// Without the placeholder every node shares the host and node `i`
    /// listens on `port + i`.
    pub host: String,
    pub port: u16,
    pub count: usize,
    #[serde(default)]
    pub workload_kinds: Vec<String>,
}

/// A declared entity shard group, started in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub workload_kinds: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub stop_timeout: Option<String>,
    /// Warm-up delay used by the task-backed workload runtime.
    pub warmup: Option<String>,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Per-kind settings, if any were declared.
    pub fn workload(&self, kind: &str) -> Option<&WorkloadConfig> {
        self.workloads.as_ref().and_then(|w| w.get(kind))
    }

    /// Scaffold a local cluster of `nodes` processes on consecutive ports.
    pub fn scaffold(nodes: usize, base_port: u16) -> Self {
        ClusterConfig {
            cluster: ClusterSection {
                cookie: Some("local-dev".to_string()),
            },
            coordinator: Some(CoordinatorConfig {
                tick_interval: Some("5s".to_string()),
                ready_timeout: Some("5m".to_string()),
                ..Default::default()
            }),
            node_sets: vec![NodeSetConfig {
                name: "all".to_string(),
                host: "127.0.0.1".to_string(),
                port: base_port,
                count: nodes,
                workload_kinds: vec!["GlobalState".to_string(), "Session".to_string()],
            }],
            groups: vec![
                GroupConfig {
                    name: "infra".to_string(),
                    workload_kinds: vec!["GlobalState".to_string()],
                },
                GroupConfig {
                    name: "services".to_string(),
                    workload_kinds: vec!["Session".to_string()],
                },
            ],
            workloads: None,
        }
    }
}

/// Parse a duration like `250ms`, `5s`, `2m`, or `1h`.
///
/// `field` names the config key in the error.
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    let invalid = || ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    };

    let s = value.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => return Err(invalid()),
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;

    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(invalid()),
    }
}

/// Resolve an optional duration field, falling back to `default`.
pub fn duration_or(field: &str, value: Option<&str>, default: Duration) -> ConfigResult<Duration> {
    match value {
        Some(v) => parse_duration(field, v),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[cluster]
cookie = "prod-eu"

[coordinator]
tick_interval = "2s"

[[node_sets]]
name = "service"
host = "service-{index}.svc"
port = 6000
count = 1
workload_kinds = ["GlobalState"]

[[node_sets]]
name = "logic"
host = "logic-{index}.svc"
port = 6000
count = 3
workload_kinds = ["Player", "Session"]

[[groups]]
name = "infra"
workload_kinds = ["GlobalState"]

[[groups]]
name = "game"
workload_kinds = ["Player", "Session"]

[workloads.Player]
stop_timeout = "45s"
"#;

    #[test]
    fn test_parse_sample() {
        let config = ClusterConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.cluster.cookie.as_deref(), Some("prod-eu"));
        assert_eq!(config.node_sets.len(), 2);
        assert_eq!(config.groups[1].workload_kinds, vec!["Player", "Session"]);
        assert_eq!(
            config.workload("Player").and_then(|w| w.stop_timeout.as_deref()),
            Some("45s")
        );
        assert!(config.workload("Session").is_none());
    }

    #[test]
    fn test_parse_minimal() {
        let config = ClusterConfig::from_toml_str("").unwrap();
        assert!(config.cluster.cookie.is_none());
        assert!(config.node_sets.is_empty());
        assert!(config.coordinator.is_none());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.groups.len(), 2);
    }

    #[test]
    fn test_from_missing_file() {
        let err = ClusterConfig::from_file(Path::new("/nonexistent/cluster.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_scaffold_round_trips() {
        let config = ClusterConfig::scaffold(3, 7000);
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("127.0.0.1"));
        let back = ClusterConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(back.node_sets[0].count, 3);
        assert_eq!(back.groups.len(), 2);
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("t", "250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("t", "5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("t", " 5m ").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("t", "1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        for bad in ["", "5", "s", "5d", "-1s", "fast"] {
            let err = parse_duration("tick_interval", bad).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidDuration { .. }), "{bad}");
        }
    }

    #[test]
    fn duration_or_uses_default() {
        let d = duration_or("t", None, Duration::from_secs(9)).unwrap();
        assert_eq!(d, Duration::from_secs(9));
    }
}
