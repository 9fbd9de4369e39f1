//! Shard lifecycle adapter.
//!
//! Wraps an opaque [`ShardRuntime`] and runs the per-group operations the
//! phase machine asks for. Each operation is a self-contained `'static`
//! future so the coordinator can run it on a separate task and keep
//! handling gossip while a group starts or stops.
//!
//! Failure policy: create and start failures, and a readiness timeout, are
//! fatal. Stop failures and stop timeouts are logged and skipped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use shardgrid_core::{ShardGroupMembership, ShardSpec};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::phase::GroupAction;
use crate::settings::CoordinatorSettings;

/// Readiness as self-reported by a started shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardReadiness {
    Starting,
    Ready,
    /// The shard gave up starting.
    Failed(String),
}

/// The workload runtime the coordinator drives.
///
/// Implementations own the actual shards; the coordinator only sees
/// handles.
#[async_trait]
pub trait ShardRuntime: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// Instantiate a shard. Called once per locally owned shard.
    async fn create(&self, spec: &ShardSpec) -> anyhow::Result<Self::Handle>;

    /// Tell a created shard to start. Readiness is observed via `poll_ready`.
    async fn start(&self, handle: &Self::Handle) -> anyhow::Result<()>;

    /// Non-blocking readiness check.
    fn poll_ready(&self, handle: &Self::Handle) -> ShardReadiness;

    /// Ask a shard to stop. Completion is observed via `is_running`.
    async fn request_stop(&self, handle: &Self::Handle) -> anyhow::Result<()>;

    /// Non-blocking liveness check.
    fn is_running(&self, handle: &Self::Handle) -> bool;
}

/// A locally owned shard and its runtime handle.
#[derive(Debug, Clone)]
pub struct LocalShard<H> {
    pub spec: ShardSpec,
    pub handle: H,
}

/// Result of a completed group operation.
#[derive(Debug)]
pub enum GroupOutcome<H> {
    Created(Vec<LocalShard<H>>),
    Started,
    Stopped,
    Released,
}

/// How a single shard's stop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone)]
struct Timings {
    ready_timeout: Duration,
    ready_poll_interval: Duration,
    ready_log_interval: Duration,
    stop_poll_interval: Duration,
}

/// Drives the local shards of every group through their lifecycle.
pub struct ShardLifecycle<R: ShardRuntime> {
    runtime: Arc<R>,
    group_names: Vec<String>,
    membership: ShardGroupMembership,
    /// Handles per group, filled once the group is created.
    shards: Vec<Vec<LocalShard<R::Handle>>>,
    timings: Timings,
    settings: Arc<CoordinatorSettings>,
}

impl<R: ShardRuntime> ShardLifecycle<R> {
    pub fn new(
        runtime: Arc<R>,
        group_names: Vec<String>,
        membership: ShardGroupMembership,
        settings: Arc<CoordinatorSettings>,
    ) -> Self {
        let shards = (0..group_names.len()).map(|_| Vec::new()).collect();
        Self {
            runtime,
            group_names,
            membership,
            shards,
            timings: Timings {
                ready_timeout: settings.ready_timeout,
                ready_poll_interval: settings.ready_poll_interval,
                ready_log_interval: settings.ready_log_interval,
                stop_poll_interval: settings.stop_poll_interval,
            },
            settings,
        }
    }

    pub fn group_name(&self, group: usize) -> &str {
        self.group_names.get(group).map(String::as_str).unwrap_or("?")
    }

    /// Workload kinds this node owns in `group`.
    pub fn owned_kinds(&self, group: usize) -> Vec<&str> {
        self.membership
            .group(group)
            .iter()
            .map(|s| s.kind.as_str())
            .collect()
    }

    /// Handles currently held for `group`.
    pub fn shards(&self, group: usize) -> &[LocalShard<R::Handle>] {
        self.shards.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Build the future that performs `action` on `group`.
    pub fn operation(
        &self,
        group: usize,
        action: GroupAction,
    ) -> impl Future<Output = CoordinatorResult<GroupOutcome<R::Handle>>> + Send + use<R> {
        let runtime = self.runtime.clone();
        let name = self.group_name(group).to_string();
        let specs = self.membership.group(group).to_vec();
        let shards = self.shards(group).to_vec();
        let timings = self.timings.clone();
        let stop_timeouts: Vec<Duration> = shards
            .iter()
            .map(|s| self.settings.stop_timeout_for(&s.spec.kind))
            .collect();

        async move {
            match action {
                GroupAction::Create => create_group(runtime.as_ref(), &name, specs)
                    .await
                    .map(GroupOutcome::Created),
                GroupAction::Start => {
                    start_group(runtime.as_ref(), &name, &shards, &timings).await?;
                    Ok(GroupOutcome::Started)
                }
                GroupAction::Stop => {
                    stop_group(runtime.as_ref(), &name, &shards, &stop_timeouts, &timings).await;
                    Ok(GroupOutcome::Stopped)
                }
                GroupAction::Release => {
                    debug!(group = %name, shards = shards.len(), "releasing shard handles");
                    Ok(GroupOutcome::Released)
                }
            }
        }
    }

    /// Fold a finished operation's result into the held handles.
    pub fn apply(&mut self, group: usize, outcome: GroupOutcome<R::Handle>) {
        let Some(slot) = self.shards.get_mut(group) else {
            return;
        };
        match outcome {
            GroupOutcome::Created(created) => *slot = created,
            GroupOutcome::Released => slot.clear(),
            GroupOutcome::Started | GroupOutcome::Stopped => {}
        }
    }
}

async fn create_group<R: ShardRuntime>(
    runtime: &R,
    group: &str,
    specs: Vec<ShardSpec>,
) -> CoordinatorResult<Vec<LocalShard<R::Handle>>> {
    let mut created = Vec::with_capacity(specs.len());
    for spec in specs {
        let handle = runtime.create(&spec).await.map_err(|source| {
            error!(%group, shard = %spec, error = %source, "failed to create shard");
            CoordinatorError::ShardCreate {
                shard: spec.to_string(),
                source,
            }
        })?;
        debug!(%group, shard = %spec, "shard created");
        created.push(LocalShard { spec, handle });
    }
    info!(%group, shards = created.len(), "group shards created");
    Ok(created)
}

async fn start_group<R: ShardRuntime>(
    runtime: &R,
    group: &str,
    shards: &[LocalShard<R::Handle>],
    timings: &Timings,
) -> CoordinatorResult<()> {
    // One deadline covers the start calls and the readiness wait.
    let started = Instant::now();
    let deadline = started + timings.ready_timeout;

    for shard in shards {
        match tokio::time::timeout_at(deadline, runtime.start(&shard.handle)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(CoordinatorError::ShardStart {
                    shard: shard.spec.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                let pending: Vec<String> = shards.iter().map(|s| s.spec.to_string()).collect();
                error!(%group, shard = %shard.spec, timeout = ?timings.ready_timeout, "shard start call did not return in time");
                return Err(CoordinatorError::ReadyTimeout {
                    group: group.to_string(),
                    timeout: timings.ready_timeout,
                    pending,
                });
            }
        }
    }
    wait_ready(runtime, group, shards, timings, started, deadline).await?;
    info!(%group, shards = shards.len(), "group shards running");
    Ok(())
}

/// Poll until every shard is ready, one fails, or the deadline passes.
async fn wait_ready<R: ShardRuntime>(
    runtime: &R,
    group: &str,
    shards: &[LocalShard<R::Handle>],
    timings: &Timings,
    started: Instant,
    deadline: Instant,
) -> CoordinatorResult<()> {
    let mut last_log = started;

    loop {
        let mut pending = Vec::new();
        for shard in shards {
            match runtime.poll_ready(&shard.handle) {
                ShardReadiness::Ready => {}
                ShardReadiness::Starting => pending.push(shard.spec.to_string()),
                ShardReadiness::Failed(reason) => {
                    error!(%group, shard = %shard.spec, %reason, "shard failed to start");
                    return Err(CoordinatorError::ShardStart {
                        shard: shard.spec.to_string(),
                        reason,
                    });
                }
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            error!(%group, ?pending, timeout = ?timings.ready_timeout, "shards did not become ready in time");
            return Err(CoordinatorError::ReadyTimeout {
                group: group.to_string(),
                timeout: timings.ready_timeout,
                pending,
            });
        }
        if now.duration_since(last_log) >= timings.ready_log_interval {
            info!(
                %group,
                ready = shards.len() - pending.len(),
                total = shards.len(),
                waited = ?now.duration_since(started),
                "waiting for shards to become ready"
            );
            last_log = now;
        }

        tokio::time::sleep(timings.ready_poll_interval.min(deadline - now)).await;
    }
}

async fn stop_group<R: ShardRuntime>(
    runtime: &R,
    group: &str,
    shards: &[LocalShard<R::Handle>],
    stop_timeouts: &[Duration],
    timings: &Timings,
) {
    // Reverse creation order.
    for (shard, &timeout) in shards.iter().zip(stop_timeouts).rev() {
        match stop_shard(runtime, shard, timeout, timings.stop_poll_interval).await {
            StopOutcome::Stopped => debug!(%group, shard = %shard.spec, "shard stopped"),
            StopOutcome::TimedOut => {
                warn!(%group, shard = %shard.spec, ?timeout, "shard did not stop in time, continuing")
            }
            StopOutcome::Failed(reason) => {
                warn!(%group, shard = %shard.spec, %reason, "shard stop failed, continuing")
            }
        }
    }
    info!(%group, shards = shards.len(), "group shards stopped");
}

/// Request a stop and poll until the shard is no longer running.
pub async fn stop_shard<R: ShardRuntime>(
    runtime: &R,
    shard: &LocalShard<R::Handle>,
    timeout: Duration,
    poll_interval: Duration,
) -> StopOutcome {
    let deadline = Instant::now() + timeout;
    match tokio::time::timeout_at(deadline, runtime.request_stop(&shard.handle)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return StopOutcome::Failed(e.to_string()),
        Err(_) => return StopOutcome::TimedOut,
    }

    loop {
        if !runtime.is_running(&shard.handle) {
            return StopOutcome::Stopped;
        }
        let now = Instant::now();
        if now >= deadline {
            return StopOutcome::TimedOut;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use shardgrid_core::NodeAddress;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Behaviour {
        Healthy,
        FailCreate,
        FailReady,
        NeverReady,
        NeverStops,
        FailStop,
        HangStart,
        HangStop,
    }

    #[derive(Default)]
    struct ScriptedRuntime {
        behaviour: HashMap<String, Behaviour>,
        log: Mutex<Vec<String>>,
        stopped: Mutex<Vec<String>>,
    }

    impl ScriptedRuntime {
        fn with(kind: &str, behaviour: Behaviour) -> Self {
            let mut rt = Self::default();
            rt.behaviour.insert(kind.to_string(), behaviour);
            rt
        }

        fn behaviour(&self, kind: &str) -> Behaviour {
            self.behaviour.get(kind).copied().unwrap_or(Behaviour::Healthy)
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ShardRuntime for ScriptedRuntime {
        type Handle = String;

        async fn create(&self, spec: &ShardSpec) -> anyhow::Result<String> {
            if self.behaviour(&spec.kind) == Behaviour::FailCreate {
                anyhow::bail!("no capacity");
            }
            self.log.lock().unwrap().push(format!("create {}", spec.kind));
            Ok(spec.kind.clone())
        }

        async fn start(&self, handle: &String) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("start {handle}"));
            if self.behaviour(handle) == Behaviour::HangStart {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        fn poll_ready(&self, handle: &String) -> ShardReadiness {
            match self.behaviour(handle) {
                Behaviour::FailReady => ShardReadiness::Failed("bad config".to_string()),
                Behaviour::NeverReady => ShardReadiness::Starting,
                _ => ShardReadiness::Ready,
            }
        }

        async fn request_stop(&self, handle: &String) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("stop {handle}"));
            if self.behaviour(handle) == Behaviour::HangStop {
                std::future::pending::<()>().await;
            }
            if self.behaviour(handle) == Behaviour::FailStop {
                anyhow::bail!("already gone");
            }
            self.stopped.lock().unwrap().push(handle.clone());
            Ok(())
        }

        fn is_running(&self, handle: &String) -> bool {
            self.behaviour(handle) == Behaviour::NeverStops
                || !self.stopped.lock().unwrap().contains(handle)
        }
    }

    fn spec(kind: &str) -> ShardSpec {
        ShardSpec {
            kind: kind.to_string(),
            shard_index: 0,
            shard_count: 1,
            node: NodeAddress::new("127.0.0.1", 7000),
        }
    }

    fn fast_settings() -> Arc<CoordinatorSettings> {
        Arc::new(CoordinatorSettings {
            ready_timeout: Duration::from_millis(200),
            ready_poll_interval: Duration::from_millis(5),
            stop_poll_interval: Duration::from_millis(5),
            default_stop_timeout: Duration::from_millis(50),
            ..Default::default()
        })
    }

    fn lifecycle(runtime: ScriptedRuntime, kinds: &[&str]) -> ShardLifecycle<ScriptedRuntime> {
        let membership = ShardGroupMembership {
            groups: vec![kinds.iter().map(|k| spec(k)).collect()],
        };
        ShardLifecycle::new(
            Arc::new(runtime),
            vec!["game".to_string()],
            membership,
            fast_settings(),
        )
    }

    async fn run(
        lc: &mut ShardLifecycle<ScriptedRuntime>,
        action: GroupAction,
    ) -> CoordinatorResult<()> {
        let outcome = lc.operation(0, action).await?;
        lc.apply(0, outcome);
        Ok(())
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let mut lc = lifecycle(ScriptedRuntime::default(), &["Player", "Session"]);
        assert_eq!(lc.owned_kinds(0), vec!["Player", "Session"]);

        run(&mut lc, GroupAction::Create).await.unwrap();
        assert_eq!(lc.shards(0).len(), 2);
        run(&mut lc, GroupAction::Start).await.unwrap();
        run(&mut lc, GroupAction::Stop).await.unwrap();
        run(&mut lc, GroupAction::Release).await.unwrap();
        assert!(lc.shards(0).is_empty());

        assert_eq!(
            lc.runtime.log(),
            vec![
                "create Player",
                "create Session",
                "start Player",
                "start Session",
                "stop Session",
                "stop Player",
            ]
        );
    }

    #[tokio::test]
    async fn create_failure_is_fatal() {
        let mut lc = lifecycle(ScriptedRuntime::with("Session", Behaviour::FailCreate), &["Player", "Session"]);
        let err = run(&mut lc, GroupAction::Create).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ShardCreate { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn reported_start_failure_is_fatal() {
        let mut lc = lifecycle(ScriptedRuntime::with("Player", Behaviour::FailReady), &["Player"]);
        run(&mut lc, GroupAction::Create).await.unwrap();
        let err = run(&mut lc, GroupAction::Start).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ShardStart { .. }));
    }

    #[tokio::test]
    async fn readiness_timeout_names_pending_shards() {
        let mut lc = lifecycle(ScriptedRuntime::with("Session", Behaviour::NeverReady), &["Player", "Session"]);
        run(&mut lc, GroupAction::Create).await.unwrap();
        match run(&mut lc, GroupAction::Start).await.unwrap_err() {
            CoordinatorError::ReadyTimeout { group, pending, .. } => {
                assert_eq!(group, "game");
                assert_eq!(pending, vec!["Session#0/1".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stop_failures_are_swallowed() {
        let mut runtime = ScriptedRuntime::with("Player", Behaviour::NeverStops);
        runtime.behaviour.insert("Session".to_string(), Behaviour::FailStop);
        let mut lc = lifecycle(runtime, &["Player", "Session", "Chat"]);
        run(&mut lc, GroupAction::Create).await.unwrap();
        run(&mut lc, GroupAction::Start).await.unwrap();
        run(&mut lc, GroupAction::Stop).await.unwrap();

        // Every shard still got its stop request.
        let stops: Vec<String> = lc
            .runtime
            .log()
            .into_iter()
            .filter(|l| l.starts_with("stop"))
            .collect();
        assert_eq!(stops, vec!["stop Chat", "stop Session", "stop Player"]);
    }

    #[tokio::test]
    async fn stop_shard_outcomes() {
        let runtime = ScriptedRuntime::with("Player", Behaviour::NeverStops);
        let stuck = LocalShard { spec: spec("Player"), handle: "Player".to_string() };
        let fine = LocalShard { spec: spec("Chat"), handle: "Chat".to_string() };
        let poll = Duration::from_millis(5);

        assert_eq!(
            stop_shard(&runtime, &stuck, Duration::from_millis(30), poll).await,
            StopOutcome::TimedOut
        );
        assert_eq!(
            stop_shard(&runtime, &fine, Duration::from_millis(30), poll).await,
            StopOutcome::Stopped
        );
    }

    #[tokio::test]
    async fn hung_stop_request_times_out() {
        let runtime = ScriptedRuntime::with("Player", Behaviour::HangStop);
        let shard = LocalShard { spec: spec("Player"), handle: "Player".to_string() };

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            stop_shard(&runtime, &shard, Duration::from_millis(30), Duration::from_millis(5)),
        )
        .await
        .expect("stop_shard must honour its timeout");
        assert_eq!(outcome, StopOutcome::TimedOut);
    }

    #[tokio::test]
    async fn hung_stop_does_not_block_group() {
        let mut lc = lifecycle(ScriptedRuntime::with("Session", Behaviour::HangStop), &["Player", "Session"]);
        run(&mut lc, GroupAction::Create).await.unwrap();
        run(&mut lc, GroupAction::Start).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), run(&mut lc, GroupAction::Stop))
            .await
            .expect("stop operation must finish")
            .unwrap();
        let stops: Vec<String> = lc
            .runtime
            .log()
            .into_iter()
            .filter(|l| l.starts_with("stop"))
            .collect();
        assert_eq!(stops, vec!["stop Session", "stop Player"]);
    }

    #[tokio::test]
    async fn hung_start_hits_readiness_deadline() {
        let mut lc = lifecycle(ScriptedRuntime::with("Session", Behaviour::HangStart), &["Player", "Session"]);
        run(&mut lc, GroupAction::Create).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), run(&mut lc, GroupAction::Start))
            .await
            .expect("readiness deadline must fire")
            .unwrap_err();
        match &err {
            CoordinatorError::ReadyTimeout { group, pending, .. } => {
                assert_eq!(group, "game");
                assert!(pending.contains(&"Session#0/1".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.exit_code(), crate::error::EXIT_SHARD_READY_TIMEOUT);
    }

    #[tokio::test]
    async fn empty_group_operations_succeed() {
        let mut lc = lifecycle(ScriptedRuntime::default(), &[]);
        for action in [GroupAction::Create, GroupAction::Start, GroupAction::Stop, GroupAction::Release] {
            run(&mut lc, action).await.unwrap();
        }
        assert!(lc.runtime.log().is_empty());
    }
}
