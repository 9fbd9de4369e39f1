//! shardgridd: one ShardGrid cluster node per process.
//!
//! Wires the cluster coordinator to the TCP gossip transport, a
//! task-backed workload runtime, and a small HTTP surface:
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/status` | Coordinator status as JSON |
//! | GET | `/metrics` | Prometheus exposition |
//! | POST | `/shutdown` | Begin cluster-wide shutdown |

pub mod http;
pub mod logging;
pub mod node;
pub mod workload;

pub use node::{exit_code, run_node, NodeOptions};
pub use workload::TaskRuntime;
