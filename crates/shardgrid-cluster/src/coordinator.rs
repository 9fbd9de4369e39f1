//! Cluster coordinator: the single control loop.
//!
//! Every input (gossip tick, transport events, group operation
//! completions, the shutdown latch) is funneled through one `select!` loop
//! that owns the phase machine and the address book, so no state is ever
//! mutated concurrently. Shard operations run on their own tasks and hand
//! their result back through the completion queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use shardgrid_core::{ClusterPhase, ClusterTopology, EntityGroupPhase, NodeAddress};

use crate::address_book::AddressBook;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::gossip::{accept_inbound, GossipMessage, InboundOutcome};
use crate::phase::{GroupAction, PhaseMachine, Transition};
use crate::settings::CoordinatorSettings;
use crate::shards::{GroupOutcome, ShardLifecycle, ShardRuntime};
use crate::transport::{EventReceiver, Transport, TransportEvent};

const PEER_LOST_CAPACITY: usize = 64;

// ── Status ─────────────────────────────────────────────────────────

/// Phase of one entity group on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub name: String,
    #[serde(serialize_with = "by_name")]
    pub phase: EntityGroupPhase,
}

/// Point-in-time view of this node's coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub node: NodeAddress,
    #[serde(serialize_with = "by_name")]
    pub phase: ClusterPhase,
    #[serde(serialize_with = "by_name")]
    pub target_phase: ClusterPhase,
    pub groups: Vec<GroupStatus>,
    pub total_nodes: usize,
    pub connected_nodes: usize,
}

impl ClusterStatus {
    pub fn all_connected(&self) -> bool {
        self.connected_nodes == self.total_nodes
    }
}

fn by_name<S: Serializer, P: std::fmt::Display>(phase: &P, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(phase)
}

// ── Handle ─────────────────────────────────────────────────────────

/// Cheap, cloneable access to a running coordinator.
///
/// Status queries never block. The shutdown request is latched, so it may
/// be raised before the coordinator loop has started.
#[derive(Clone)]
pub struct ClusterHandle {
    status: watch::Receiver<ClusterStatus>,
    shutdown: Arc<watch::Sender<bool>>,
    peer_lost: broadcast::Sender<NodeAddress>,
}

impl ClusterHandle {
    /// Current status snapshot.
    pub fn status(&self) -> ClusterStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every published status.
    pub fn watch_status(&self) -> watch::Receiver<ClusterStatus> {
        self.status.clone()
    }

    /// Ask the cluster to shut down. Idempotent.
    pub fn request_shutdown(&self) {
        let already = self.shutdown.send_replace(true);
        if !already {
            info!("cluster shutdown requested");
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Notifications for peers whose connection was lost.
    pub fn subscribe_peer_lost(&self) -> broadcast::Receiver<NodeAddress> {
        self.peer_lost.subscribe()
    }

    /// Wait until this node's phase is at least `phase`.
    pub async fn wait_for_phase(
        &self,
        phase: ClusterPhase,
        timeout: Duration,
    ) -> CoordinatorResult<ClusterPhase> {
        let mut rx = self.status.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|s| s.phase >= phase)).await {
            Ok(Ok(status)) => Ok(status.phase),
            Ok(Err(_)) => Err(CoordinatorError::Closed),
            Err(_) => Err(CoordinatorError::PhaseTimeout { phase, timeout }),
        }
    }

    /// Wait until every node of the topology is connected.
    pub async fn wait_until_connected(&self, timeout: Duration) -> CoordinatorResult<()> {
        match self.wait_for_phase(ClusterPhase::Starting, timeout).await {
            Ok(_) => Ok(()),
            Err(CoordinatorError::PhaseTimeout { .. }) => {
                Err(CoordinatorError::ConnectTimeout(timeout))
            }
            Err(e) => Err(e),
        }
    }

    /// Wait until this node has terminated.
    pub async fn wait_terminated(&self) -> CoordinatorResult<()> {
        let mut rx = self.status.clone();
        rx.wait_for(|s| s.phase == ClusterPhase::Terminated)
            .await
            .map(|_| ())
            .map_err(|_| CoordinatorError::Closed)
    }
}

// ── Process guard ──────────────────────────────────────────────────

static COORDINATOR_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Claim on the single coordinator slot of this process.
///
/// The daemon acquires one before constructing its coordinator; a second
/// acquisition while the first is alive fails with
/// [`CoordinatorError::AlreadyRunning`].
#[derive(Debug)]
pub struct ProcessGuard {
    _claim: (),
}

impl ProcessGuard {
    pub fn acquire() -> CoordinatorResult<Self> {
        COORDINATOR_CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CoordinatorError::AlreadyRunning)?;
        Ok(Self { _claim: () })
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        COORDINATOR_CLAIMED.store(false, Ordering::Release);
    }
}

// ── Coordinator ────────────────────────────────────────────────────

struct GroupCompletion<H> {
    group: usize,
    from: EntityGroupPhase,
    result: CoordinatorResult<GroupOutcome<H>>,
}

/// Drives one node through the cluster lifecycle.
pub struct Coordinator<R: ShardRuntime> {
    settings: Arc<CoordinatorSettings>,
    machine: PhaseMachine,
    book: AddressBook,
    lifecycle: ShardLifecycle<R>,
    group_names: Vec<String>,
    transport: Arc<dyn Transport>,
    events: EventReceiver,
    completions_tx: mpsc::UnboundedSender<GroupCompletion<R::Handle>>,
    completions_rx: mpsc::UnboundedReceiver<GroupCompletion<R::Handle>>,
    status_tx: watch::Sender<ClusterStatus>,
    shutdown_rx: watch::Receiver<bool>,
    peer_lost: broadcast::Sender<NodeAddress>,
}

impl<R: ShardRuntime> Coordinator<R> {
    /// Build the coordinator for `self_address` and the handle that
    /// observes and controls it.
    pub fn new(
        settings: CoordinatorSettings,
        topology: &ClusterTopology,
        self_address: NodeAddress,
        transport: Arc<dyn Transport>,
        events: EventReceiver,
        runtime: Arc<R>,
    ) -> CoordinatorResult<(Self, ClusterHandle)> {
        let settings = Arc::new(settings);
        let membership = topology.membership(&self_address)?;
        let group_names: Vec<String> = topology.groups().iter().map(|g| g.name.clone()).collect();
        let book = AddressBook::new(&self_address, topology.all_nodes(), group_names.len())?;
        let machine = PhaseMachine::new(group_names.len());
        let lifecycle = ShardLifecycle::new(
            runtime,
            group_names.clone(),
            membership,
            settings.clone(),
        );

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (peer_lost, _) = broadcast::channel(PEER_LOST_CAPACITY);
        let initial = status_of(&self_address, &machine, &book, &group_names);
        let (status_tx, status_rx) = watch::channel(initial);

        debug!(
            node = %self_address,
            nodes = book.len(),
            groups = group_names.len(),
            local_shards = (0..group_names.len()).map(|g| lifecycle.owned_kinds(g).len()).sum::<usize>(),
            "coordinator created"
        );

        let handle = ClusterHandle {
            status: status_rx,
            shutdown: Arc::new(shutdown_tx),
            peer_lost: peer_lost.clone(),
        };
        let coordinator = Self {
            settings,
            machine,
            book,
            lifecycle,
            group_names,
            transport,
            events,
            completions_tx,
            completions_rx,
            status_tx,
            shutdown_rx,
            peer_lost,
        };
        Ok((coordinator, handle))
    }

    /// Run until this node terminates or a fatal error occurs.
    ///
    /// Returns the final phase. A fatal error halts all progression and is
    /// returned; map it to the process exit status with
    /// [`CoordinatorError::exit_code`].
    pub async fn run(mut self) -> CoordinatorResult<ClusterPhase> {
        info!(
            node = %self.book.self_address(),
            nodes = self.book.len(),
            groups = self.group_names.len(),
            "cluster coordinator starting"
        );

        let mut tick = tokio::time::interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let connect_timer = tokio::time::sleep(self.settings.connect_timeout.unwrap_or_default());
        tokio::pin!(connect_timer);
        let mut shutdown_open = true;

        if *self.shutdown_rx.borrow_and_update() {
            self.on_shutdown_requested();
        }
        self.progress();
        self.publish();

        while !self.machine.is_terminated() {
            let waiting_for_peers = self.settings.connect_timeout.is_some()
                && self.machine.local() == ClusterPhase::Connecting;

            tokio::select! {
                _ = tick.tick() => self.on_tick(),
                Some(event) = self.events.recv() => self.on_transport_event(event),
                Some(done) = self.completions_rx.recv() => self.on_group_completed(done)?,
                changed = self.shutdown_rx.changed(), if shutdown_open => match changed {
                    Ok(()) => {
                        if *self.shutdown_rx.borrow_and_update() {
                            self.on_shutdown_requested();
                        }
                    }
                    Err(_) => shutdown_open = false,
                },
                () = &mut connect_timer, if waiting_for_peers => {
                    let timeout = self.settings.connect_timeout.unwrap_or_default();
                    error!(
                        connected = self.book.connected_count(),
                        total = self.book.len(),
                        ?timeout,
                        "cluster did not connect in time"
                    );
                    return Err(CoordinatorError::ConnectTimeout(timeout));
                }
            }
        }

        info!(node = %self.book.self_address(), "node terminated");
        self.publish();
        Ok(self.machine.local())
    }

    fn on_tick(&mut self) {
        let report = self.machine.report();
        for peer in self.book.connected_remotes() {
            self.send(&peer, GossipMessage::status(report.clone()));
        }
        for peer in self.book.disconnected_remotes() {
            self.send(&peer, self.hello());
        }
        self.progress();
        self.publish();
        debug!(
            phase = %self.machine.local(),
            target = %self.machine.target(),
            connected = self.book.connected_count(),
            expected = self.book.len(),
            "gossip tick"
        );
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Associated(peer) => {
                if !self.book.is_self(&peer) && !self.book.is_connected(&peer) {
                    debug!(%peer, "peer associated, sending hello");
                    self.send(&peer, self.hello());
                }
            }
            TransportEvent::Disassociated(peer) => {
                if self.book.is_self(&peer) {
                    warn!(%peer, "transport reported this node as disassociated, ignoring");
                } else if self.book.mark_disconnected(&peer) {
                    warn!(%peer, "lost connection to peer");
                    let _ = self.peer_lost.send(peer);
                    self.publish();
                }
            }
            TransportEvent::Received { from, message } => self.on_gossip(from, message),
        }
    }

    fn on_gossip(&mut self, from: NodeAddress, message: GossipMessage) {
        let cookie = self.settings.cookie.as_deref();
        match accept_inbound(&mut self.book, &mut self.machine, cookie, &from, &message) {
            Ok(InboundOutcome::Rejected) => {
                warn!(peer = %from, "dropping first message with a mismatched cluster cookie");
            }
            Ok(InboundOutcome::Ignored) => {
                debug!(peer = %from, "ignoring gossip addressed from this node");
            }
            Ok(InboundOutcome::Accepted {
                newly_connected,
                reply,
                target_raised,
            }) => {
                if newly_connected {
                    info!(
                        peer = %from,
                        connected = self.book.connected_count(),
                        total = self.book.len(),
                        "peer connected"
                    );
                }
                if reply {
                    self.send(&from, self.hello());
                }
                if target_raised {
                    info!(target = %self.machine.target(), peer = %from, "target phase raised by peer");
                    self.sync_self();
                }
                self.progress();
                self.publish();
            }
            Err(e) => warn!(peer = %from, error = %e, "discarding gossip"),
        }
    }

    fn on_shutdown_requested(&mut self) {
        if self.machine.request_shutdown() {
            info!(phase = %self.machine.local(), "shutdown signal received");
            self.broadcast();
            self.progress();
            self.publish();
        }
    }

    fn on_group_completed(
        &mut self,
        done: GroupCompletion<R::Handle>,
    ) -> CoordinatorResult<()> {
        let name = self.group_name(done.group).to_string();
        match done.result {
            Ok(outcome) => {
                self.lifecycle.apply(done.group, outcome);
                let next = done.from.next().unwrap_or(EntityGroupPhase::Terminated);
                self.machine.complete_group(done.group, next);
                info!(group = %name, phase = %next, "group phase advanced");
                self.broadcast();
                self.progress();
                self.publish();
                Ok(())
            }
            Err(err) => {
                self.machine.halt();
                error!(
                    group = %name,
                    error = %err,
                    exit_code = err.exit_code(),
                    "fatal group operation failure, halting"
                );
                self.publish();
                Err(err)
            }
        }
    }

    /// Apply transitions until the machine has to wait.
    fn progress(&mut self) {
        let mut entered = false;
        while let Some(step) = self.machine.next_transition(&self.book) {
            match step {
                Transition::Enter(phase) => {
                    self.machine.enter(phase);
                    self.sync_self();
                    info!(%phase, "entered cluster phase");
                    entered = true;
                }
                Transition::Group {
                    group,
                    from,
                    action,
                } => {
                    self.machine.begin_group(group);
                    self.spawn_group_operation(group, from, action);
                    break;
                }
            }
        }
        if entered {
            self.broadcast();
        }
    }

    fn spawn_group_operation(&self, group: usize, from: EntityGroupPhase, action: GroupAction) {
        info!(group = %self.group_name(group), ?action, "group operation started");
        let operation = self.lifecycle.operation(group, action);
        let completions = self.completions_tx.clone();

        tokio::spawn(async move {
            // Inner task so a panicking runtime surfaces as a failure.
            let result = match tokio::spawn(operation).await {
                Ok(result) => result,
                Err(e) => Err(CoordinatorError::TaskFailed(e.to_string())),
            };
            let _ = completions.send(GroupCompletion {
                group,
                from,
                result,
            });
        });
    }

    /// Send our current phases to every connected peer.
    fn broadcast(&mut self) {
        self.sync_self();
        let report = self.machine.report();
        for peer in self.book.connected_remotes() {
            self.send(&peer, GossipMessage::status(report.clone()));
        }
    }

    fn hello(&self) -> GossipMessage {
        GossipMessage::hello(self.machine.report(), self.settings.cookie.clone())
    }

    fn send(&self, peer: &NodeAddress, message: GossipMessage) {
        if let Err(e) = self.transport.send(peer, message) {
            debug!(%peer, error = %e, "gossip send failed, retrying next tick");
        }
    }

    fn sync_self(&mut self) {
        self.book.set_self_report(&self.machine.report());
    }

    fn group_name(&self, group: usize) -> &str {
        self.group_names.get(group).map(String::as_str).unwrap_or("?")
    }

    fn publish(&self) {
        let status = status_of(
            self.book.self_address(),
            &self.machine,
            &self.book,
            &self.group_names,
        );
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

fn status_of(
    node: &NodeAddress,
    machine: &PhaseMachine,
    book: &AddressBook,
    group_names: &[String],
) -> ClusterStatus {
    ClusterStatus {
        node: node.clone(),
        phase: machine.local(),
        target_phase: machine.target(),
        groups: group_names
            .iter()
            .zip(machine.groups())
            .map(|(name, phase)| GroupStatus {
                name: name.clone(),
                phase: *phase,
            })
            .collect(),
        total_nodes: book.len(),
        connected_nodes: book.connected_count(),
    }
}
