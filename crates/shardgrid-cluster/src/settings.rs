//! Resolved coordinator timings.

use std::collections::HashMap;
use std::time::Duration;

use shardgrid_core::config::{duration_or, parse_duration};
use shardgrid_core::error::ConfigResult;
use shardgrid_core::ClusterConfig;

/// Coordinator timings and the cluster cookie, resolved from config.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Gossip and reconnect cadence.
    pub tick_interval: Duration,
    /// Deadline for a group's shards to report ready after start.
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    /// How often readiness progress is logged while waiting.
    pub ready_log_interval: Duration,
    pub stop_poll_interval: Duration,
    /// Stop timeout for kinds without an override.
    pub default_stop_timeout: Duration,
    /// Per-kind stop timeout overrides.
    pub stop_timeouts: HashMap<String, Duration>,
    /// Optional deadline for reaching `Starting`; `None` waits forever.
    pub connect_timeout: Option<Duration>,
    pub cookie: Option<String>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5 * 60),
            ready_poll_interval: Duration::from_millis(100),
            ready_log_interval: Duration::from_secs(5),
            stop_poll_interval: Duration::from_secs(1),
            default_stop_timeout: Duration::from_secs(30),
            stop_timeouts: HashMap::new(),
            connect_timeout: None,
            cookie: None,
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &ClusterConfig) -> ConfigResult<Self> {
        let defaults = Self::default();
        let section = config.coordinator.clone().unwrap_or_default();

        let mut stop_timeouts = HashMap::new();
        if let Some(workloads) = &config.workloads {
            for (kind, workload) in workloads {
                if let Some(value) = &workload.stop_timeout {
                    let field = format!("workloads.{kind}.stop_timeout");
                    stop_timeouts.insert(kind.clone(), parse_duration(&field, value)?);
                }
            }
        }

        let connect_timeout = match &section.connect_timeout {
            Some(v) => Some(parse_duration("coordinator.connect_timeout", v)?),
            None => None,
        };

        Ok(Self {
            tick_interval: duration_or(
                "coordinator.tick_interval",
                section.tick_interval.as_deref(),
                defaults.tick_interval,
            )?,
            ready_timeout: duration_or(
                "coordinator.ready_timeout",
                section.ready_timeout.as_deref(),
                defaults.ready_timeout,
            )?,
            ready_poll_interval: duration_or(
                "coordinator.ready_poll_interval",
                section.ready_poll_interval.as_deref(),
                defaults.ready_poll_interval,
            )?,
            ready_log_interval: duration_or(
                "coordinator.ready_log_interval",
                section.ready_log_interval.as_deref(),
                defaults.ready_log_interval,
            )?,
            stop_poll_interval: duration_or(
                "coordinator.stop_poll_interval",
                section.stop_poll_interval.as_deref(),
                defaults.stop_poll_interval,
            )?,
            default_stop_timeout: duration_or(
                "coordinator.stop_timeout",
                section.stop_timeout.as_deref(),
                defaults.default_stop_timeout,
            )?,
            stop_timeouts,
            connect_timeout,
            cookie: config.cluster.cookie.clone(),
        })
    }

    /// Stop timeout for a workload kind.
    pub fn stop_timeout_for(&self, kind: &str) -> Duration {
        self.stop_timeouts
            .get(kind)
            .copied()
            .unwrap_or(self.default_stop_timeout)
    }
}
