//! Task-backed workload runtime.
//!
//! Each shard is a tokio task that becomes ready after its kind's warm-up
//! delay and runs until told to stop through a `watch` channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use shardgrid_cluster::{ShardReadiness, ShardRuntime};
use shardgrid_core::config::parse_duration;
use shardgrid_core::error::ConfigResult;
use shardgrid_core::{ClusterConfig, ShardSpec};

/// Runs every shard as a lightweight tokio task.
#[derive(Debug, Default)]
pub struct TaskRuntime {
    warmups: HashMap<String, Duration>,
}

impl TaskRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read per-kind warm-up delays from `[workloads.<kind>]`.
    pub fn from_config(config: &ClusterConfig) -> ConfigResult<Self> {
        let mut warmups = HashMap::new();
        for (kind, workload) in config.workloads.iter().flatten() {
            if let Some(value) = &workload.warmup {
                let field = format!("workloads.{kind}.warmup");
                warmups.insert(kind.clone(), parse_duration(&field, value)?);
            }
        }
        Ok(Self { warmups })
    }

    pub fn with_warmup(mut self, kind: &str, warmup: Duration) -> Self {
        self.warmups.insert(kind.to_string(), warmup);
        self
    }

    fn warmup_for(&self, kind: &str) -> Duration {
        self.warmups.get(kind).copied().unwrap_or_default()
    }
}

/// Handle to one task-backed shard.
#[derive(Debug, Clone)]
pub struct TaskShard {
    spec: Arc<ShardSpec>,
    warmup: Duration,
    state: Arc<ShardState>,
}

#[derive(Debug)]
struct ShardState {
    started: AtomicBool,
    ready: AtomicBool,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl TaskShard {
    pub fn spec(&self) -> &ShardSpec {
        &self.spec
    }
}

#[async_trait]
impl ShardRuntime for TaskRuntime {
    type Handle = TaskShard;

    async fn create(&self, spec: &ShardSpec) -> anyhow::Result<TaskShard> {
        let (stop_tx, _) = watch::channel(false);
        debug!(shard = %spec, "shard created");
        Ok(TaskShard {
            spec: Arc::new(spec.clone()),
            warmup: self.warmup_for(&spec.kind),
            state: Arc::new(ShardState {
                started: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stop_tx,
            }),
        })
    }

    async fn start(&self, handle: &TaskShard) -> anyhow::Result<()> {
        if handle.state.started.swap(true, Ordering::AcqRel) {
            anyhow::bail!("shard {} already started", handle.spec);
        }
        handle.state.running.store(true, Ordering::Release);

        let shard = handle.clone();
        let mut stop_rx = shard.state.stop_tx.subscribe();
        tokio::spawn(async move {
            info!(shard = %shard.spec, warmup = ?shard.warmup, "shard starting");
            tokio::select! {
                _ = tokio::time::sleep(shard.warmup) => {
                    shard.state.ready.store(true, Ordering::Release);
                    info!(shard = %shard.spec, "shard ready");
                    let _ = stop_rx.wait_for(|stop| *stop).await;
                }
                _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => {}
            }
            shard.state.ready.store(false, Ordering::Release);
            shard.state.running.store(false, Ordering::Release);
            info!(shard = %shard.spec, "shard stopped");
        });
        Ok(())
    }

    fn poll_ready(&self, handle: &TaskShard) -> ShardReadiness {
        if handle.state.ready.load(Ordering::Acquire) {
            ShardReadiness::Ready
        } else if handle.state.started.load(Ordering::Acquire)
            && !handle.state.running.load(Ordering::Acquire)
        {
            ShardReadiness::Failed("shard exited before becoming ready".to_string())
        } else {
            ShardReadiness::Starting
        }
    }

    async fn request_stop(&self, handle: &TaskShard) -> anyhow::Result<()> {
        handle.state.stop_tx.send_replace(true);
        Ok(())
    }

    fn is_running(&self, handle: &TaskShard) -> bool {
        handle.state.running.load(Ordering::Acquire)
    }
}
