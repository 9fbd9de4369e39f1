//! shardgridd: the ShardGrid node daemon.
//!
//! # Usage
//!
//! ```text
//! shardgridd init cluster.toml --nodes 3
//! shardgridd topology --config cluster.toml --address 127.0.0.1:7355
//! shardgridd run --config cluster.toml --address 127.0.0.1:7355 --http 127.0.0.1:8355
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::error;

use shardgrid_core::{ClusterConfig, ClusterTopology, NodeAddress};
use shardgridd::logging::{self, LogFormat};
use shardgridd::{exit_code, run_node, NodeOptions};

#[derive(Parser)]
#[command(name = "shardgridd", about = "ShardGrid cluster node daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run this node until the cluster shuts down.
    Run {
        /// Cluster config file.
        #[arg(long)]
        config: PathBuf,

        /// This node's address as listed in the topology (host:port).
        #[arg(long)]
        address: NodeAddress,

        /// Socket address to accept gossip on.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Socket address for the HTTP status endpoints.
        #[arg(long)]
        http: Option<SocketAddr>,
    },

    /// Print the resolved topology.
    Topology {
        /// Cluster config file.
        #[arg(long)]
        config: PathBuf,

        /// Also print the shards this node owns.
        #[arg(long)]
        address: Option<NodeAddress>,
    },

    /// Write a starter config file.
    Init {
        /// Where to write the config.
        path: PathBuf,

        /// Number of local nodes.
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Gossip port of the first node.
        #[arg(long, default_value = "7355")]
        base_port: u16,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let result = match cli.command {
        Command::Run {
            config,
            address,
            listen,
            http,
        } => run_node(NodeOptions {
            config,
            address,
            listen,
            http,
        })
        .await
        .map(|_| ()),
        Command::Topology { config, address } => print_topology(&config, address.as_ref()),
        Command::Init {
            path,
            nodes,
            base_port,
        } => write_scaffold(&path, nodes, base_port),
    };

    if let Err(e) = result {
        let code = exit_code(&e);
        error!(error = %format!("{e:#}"), exit_code = code, "shardgridd failed");
        std::process::exit(code);
    }
}

fn print_topology(config: &Path, address: Option<&NodeAddress>) -> anyhow::Result<()> {
    let config = ClusterConfig::from_file(config)?;
    let topology = ClusterTopology::from_config(&config)?;

    println!("nodes: {}", topology.node_count());
    for set in topology.node_sets() {
        println!("  set {} [{}]", set.name, set.workload_kinds.join(", "));
        for node in &set.nodes {
            println!("    {node}");
        }
    }

    println!("groups (start order):");
    for (i, group) in topology.groups().iter().enumerate() {
        println!("  {i}: {} [{}]", group.name, group.workload_kinds.join(", "));
    }

    if let Some(address) = address {
        let membership = topology.membership(address)?;
        println!("shards owned by {address}:");
        for (i, group) in topology.groups().iter().enumerate() {
            for shard in membership.group(i) {
                println!("  {}: {shard}", group.name);
            }
        }
    }
    Ok(())
}

fn write_scaffold(path: &Path, nodes: usize, base_port: u16) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let content = ClusterConfig::scaffold(nodes, base_port).to_toml_string()?;
    std::fs::write(path, content)?;
    println!("wrote {} ({nodes} nodes from port {base_port})", path.display());
    Ok(())
}
