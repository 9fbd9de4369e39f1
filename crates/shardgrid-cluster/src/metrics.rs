//! Prometheus text exposition of the coordinator status.
//!
//! Phase gauges are one-hot: every phase value is emitted, with `1` for the
//! current one and `0` for the rest.

use shardgrid_core::{ClusterPhase, EntityGroupPhase};

use crate::coordinator::ClusterStatus;

/// Render a status snapshot into Prometheus text format.
pub fn render_prometheus(status: &ClusterStatus) -> String {
    let mut out = String::new();

    out.push_str("# HELP shardgrid_cluster_phase Current cluster phase of this node.\n");
    out.push_str("# TYPE shardgrid_cluster_phase gauge\n");
    for phase in ClusterPhase::ALL {
        out.push_str(&format!(
            "shardgrid_cluster_phase{{phase=\"{}\"}} {}\n",
            phase,
            one_hot(phase == status.phase)
        ));
    }

    out.push_str("# HELP shardgrid_cluster_target_phase Highest phase asserted by any node.\n");
    out.push_str("# TYPE shardgrid_cluster_target_phase gauge\n");
    for phase in ClusterPhase::ALL {
        out.push_str(&format!(
            "shardgrid_cluster_target_phase{{phase=\"{}\"}} {}\n",
            phase,
            one_hot(phase == status.target_phase)
        ));
    }

    out.push_str("# HELP shardgrid_group_phase Current phase of each entity group on this node.\n");
    out.push_str("# TYPE shardgrid_group_phase gauge\n");
    for group in &status.groups {
        for phase in EntityGroupPhase::ALL {
            out.push_str(&format!(
                "shardgrid_group_phase{{group=\"{}\",phase=\"{}\"}} {}\n",
                group.name,
                phase,
                one_hot(phase == group.phase)
            ));
        }
    }

    out.push_str("# HELP shardgrid_expected_nodes Nodes in the cluster topology.\n");
    out.push_str("# TYPE shardgrid_expected_nodes gauge\n");
    out.push_str(&format!("shardgrid_expected_nodes {}\n", status.total_nodes));

    out.push_str("# HELP shardgrid_connected_nodes Nodes currently connected, this one included.\n");
    out.push_str("# TYPE shardgrid_connected_nodes gauge\n");
    out.push_str(&format!("shardgrid_connected_nodes {}\n", status.connected_nodes));

    out
}

fn one_hot(on: bool) -> u8 {
    if on { 1 } else { 0 }
}
