//! shardgrid-cluster: barrier-synchronized lifecycle coordination.
//!
//! Every node of a statically configured cluster runs one coordinator.
//! Nodes gossip their phase vectors to each other and only advance an
//! entity group once every node has caught up with it, so groups are
//! created, started, and stopped cluster-wide in lockstep.
//!
//! # Architecture
//!
//! ```text
//! Coordinator (one per process, single control loop)
//!   ├── PhaseMachine
//!   │   ├── Connecting → Starting → Running → Stopping → Terminated
//!   │   └── per group: Pending → Created → Running → Stopped → Terminated
//!   ├── AddressBook
//!   │   ├── Connectivity of every topology node
//!   │   └── Last known phases per peer (never regress)
//!   ├── Gossip
//!   │   ├── Tick → status to connected peers, hello to the rest
//!   │   └── Inbound → cookie check, merge, raise target phase
//!   ├── ShardLifecycle
//!   │   └── Create / Start + wait ready / Stop / Release on a task
//!   └── Transport
//!       ├── TcpTransport (newline-delimited JSON)
//!       └── MemoryNetwork (in-process)
//! ```

pub mod address_book;
pub mod coordinator;
pub mod error;
pub mod gossip;
pub mod metrics;
pub mod phase;
pub mod settings;
pub mod shards;
pub mod transport;

pub use address_book::{AddressBook, PeerState};
pub use coordinator::{ClusterHandle, ClusterStatus, Coordinator, GroupStatus, ProcessGuard};
pub use error::{CoordinatorError, CoordinatorResult};
pub use gossip::GossipMessage;
pub use metrics::render_prometheus;
pub use phase::{GroupAction, PhaseMachine, PhaseReport, Transition};
pub use settings::CoordinatorSettings;
pub use shards::{ShardReadiness, ShardRuntime};
pub use transport::{
    event_channel, EventReceiver, MemoryNetwork, TcpTransport, Transport, TransportEvent,
};
