//! CLI tests against the built `shardgridd` binary.

use std::process::Command;

use shardgrid_core::{ClusterConfig, ClusterTopology};

fn shardgridd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_shardgridd"))
}

#[test]
fn init_writes_loadable_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cluster.toml");

    let out = shardgridd()
        .args(["init", path.to_str().unwrap(), "--nodes", "4", "--base-port", "9100"])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let config = ClusterConfig::from_file(&path).unwrap();
    let topology = ClusterTopology::from_config(&config).unwrap();
    assert_eq!(topology.node_count(), 4);
    assert_eq!(topology.group_count(), 2);
}

#[test]
fn init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cluster.toml");
    std::fs::write(&path, "# keep me\n").unwrap();

    let out = shardgridd()
        .args(["init", path.to_str().unwrap()])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "# keep me\n");
}

#[test]
fn topology_lists_owned_shards() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cluster.toml");
    let config = ClusterConfig::scaffold(3, 9200);
    std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

    let out = shardgridd()
        .args([
            "topology",
            "--config",
            path.to_str().unwrap(),
            "--address",
            "127.0.0.1:9201",
        ])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("nodes: 3"));
    assert!(stdout.contains("0: infra [GlobalState]"));
    assert!(stdout.contains("infra: GlobalState#1/3"));
    assert!(stdout.contains("services: Session#1/3"));
}

#[test]
fn topology_rejects_unknown_address() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cluster.toml");
    std::fs::write(&path, ClusterConfig::scaffold(2, 9300).to_toml_string().unwrap()).unwrap();

    let out = shardgridd()
        .args([
            "topology",
            "--config",
            path.to_str().unwrap(),
            "--address",
            "10.9.9.9:1",
        ])
        .output()
        .unwrap();
    assert!(!out.status.success());
}

#[test]
fn run_with_missing_config_exits_generic() {
    let out = shardgridd()
        .args([
            "run",
            "--config",
            "/nonexistent/cluster.toml",
            "--address",
            "127.0.0.1:9400",
        ])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
}
