//! Node runner: assembles one cluster node and drives it to termination.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use shardgrid_cluster::error::EXIT_FAILURE;
use shardgrid_cluster::{
    event_channel, Coordinator, CoordinatorError, CoordinatorSettings, ProcessGuard, TcpTransport,
};
use shardgrid_core::{ClusterConfig, ClusterPhase, ClusterTopology, NodeAddress};

use crate::workload::TaskRuntime;

/// Options for `shardgridd run`.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub config: PathBuf,
    /// This node's address as it appears in the topology.
    pub address: NodeAddress,
    /// Socket to accept gossip on. Defaults to all interfaces on the
    /// address's port.
    pub listen: Option<SocketAddr>,
    /// Socket for the HTTP status surface; disabled when unset.
    pub http: Option<SocketAddr>,
}

impl NodeOptions {
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.address.port)))
    }
}

/// Run one node until it terminates.
///
/// Coordinator failures are returned unchanged inside the `anyhow::Error`
/// so [`exit_code`] can recover them.
pub async fn run_node(options: NodeOptions) -> anyhow::Result<ClusterPhase> {
    let _guard = ProcessGuard::acquire()?;

    let config = ClusterConfig::from_file(&options.config)
        .with_context(|| format!("failed to load {}", options.config.display()))?;
    let topology = ClusterTopology::from_config(&config)?;
    let settings = CoordinatorSettings::from_config(&config)?;
    let runtime = Arc::new(TaskRuntime::from_config(&config)?);

    info!(
        node = %options.address,
        nodes = topology.node_count(),
        groups = topology.group_count(),
        "shardgrid node starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = event_channel();
    let transport = TcpTransport::new(options.address.clone(), events_tx);
    let listener = transport
        .bind(options.listen_addr(), shutdown_rx.clone())
        .await
        .with_context(|| format!("failed to bind gossip listener on {}", options.listen_addr()))?;

    let (coordinator, handle) = Coordinator::new(
        settings,
        &topology,
        options.address.clone(),
        Arc::new(transport),
        events_rx,
        runtime,
    )?;

    let http = options.http.map(|addr| {
        let handle = handle.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::http::serve(addr, handle, shutdown).await {
                error!(error = %e, "HTTP server failed");
            }
        })
    });

    // Ctrl-C starts a cluster-wide shutdown; the node exits once terminated.
    let signal_handle = handle.clone();
    let signals = tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("failed to listen for ctrl-c");
                return;
            }
            if signal_handle.shutdown_requested() {
                info!("shutdown already in progress");
            } else {
                signal_handle.request_shutdown();
            }
        }
    });

    let result = coordinator.run().await;

    signals.abort();
    let _ = shutdown_tx.send(true);
    let _ = listener.await;
    if let Some(http) = http {
        let _ = http.await;
    }

    match result {
        Ok(phase) => {
            info!(%phase, "shardgrid node stopped");
            Ok(phase)
        }
        Err(e) => Err(e.into()),
    }
}

/// Process exit status for an error returned by the daemon.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CoordinatorError>()
        .map(CoordinatorError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}
