//! Phase state machine.
//!
//! Holds this node's cluster phase, the cluster target phase, and one
//! phase per entity shard group, and decides what to do next given the
//! address book's view of every peer. All setters are monotonic: a value
//! lower than the current one is ignored.
//!
//! Startup walks groups in declared order, shutdown in reverse. A group
//! may leave phase `P` only once every known node reports at least `P`
//! for that group.

use serde::{Deserialize, Serialize};

use shardgrid_core::{ClusterPhase, EntityGroupPhase};

use crate::address_book::AddressBook;

/// A node's advertised phases, as gossiped between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub local_phase: ClusterPhase,
    pub target_phase: ClusterPhase,
    pub group_phases: Vec<EntityGroupPhase>,
}

impl PhaseReport {
    /// The report of a node that has not started yet.
    pub fn initial(group_count: usize) -> Self {
        Self {
            local_phase: ClusterPhase::Connecting,
            target_phase: ClusterPhase::Connecting,
            group_phases: vec![EntityGroupPhase::Pending; group_count],
        }
    }

    /// Fold `other` into `self`, keeping the maximum of every entry.
    ///
    /// Both reports must have the same number of groups. Returns whether
    /// anything changed.
    pub fn merge(&mut self, other: &PhaseReport) -> bool {
        debug_assert_eq!(self.group_phases.len(), other.group_phases.len());
        let mut changed = false;

        if other.local_phase > self.local_phase {
            self.local_phase = other.local_phase;
            changed = true;
        }
        if other.target_phase > self.target_phase {
            self.target_phase = other.target_phase;
            changed = true;
        }
        for (mine, theirs) in self.group_phases.iter_mut().zip(&other.group_phases) {
            if *theirs > *mine {
                *mine = *theirs;
                changed = true;
            }
        }
        changed
    }
}

/// What leaving a group phase does to the node's local shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    /// `Pending → Created`: instantiate every locally owned shard.
    Create,
    /// `Created → Running`: start the shards and wait until they are ready.
    Start,
    /// `Running → Stopped`: stop the shards, tolerating failures.
    Stop,
    /// `Stopped → Terminated`: drop the node's handles to the shards.
    Release,
}

impl GroupAction {
    /// The action taken when a group leaves `phase`.
    pub fn leaving(phase: EntityGroupPhase) -> Option<GroupAction> {
        match phase {
            EntityGroupPhase::Pending => Some(GroupAction::Create),
            EntityGroupPhase::Created => Some(GroupAction::Start),
            EntityGroupPhase::Running => Some(GroupAction::Stop),
            EntityGroupPhase::Stopped => Some(GroupAction::Release),
            EntityGroupPhase::Terminated => None,
        }
    }
}

/// The next step the coordinator should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move this node to a new cluster phase.
    Enter(ClusterPhase),
    /// Run `action` on `group`, moving it out of `from` once done.
    Group {
        group: usize,
        from: EntityGroupPhase,
        action: GroupAction,
    },
}

/// Per-node phase bookkeeping and the progression rules.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    local: ClusterPhase,
    target: ClusterPhase,
    groups: Vec<EntityGroupPhase>,
    shutdown_requested: bool,
    /// Group whose lifecycle operation is currently running.
    in_flight: Option<usize>,
    /// Set after a fatal error; nothing advances afterwards.
    halted: bool,
}

impl PhaseMachine {
    pub fn new(group_count: usize) -> Self {
        Self {
            local: ClusterPhase::Connecting,
            target: ClusterPhase::Connecting,
            groups: vec![EntityGroupPhase::Pending; group_count],
            shutdown_requested: false,
            in_flight: None,
            halted: false,
        }
    }

    pub fn local(&self) -> ClusterPhase {
        self.local
    }

    pub fn target(&self) -> ClusterPhase {
        self.target
    }

    pub fn groups(&self) -> &[EntityGroupPhase] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> Option<EntityGroupPhase> {
        self.groups.get(index).copied()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub fn in_flight(&self) -> Option<usize> {
        self.in_flight
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_terminated(&self) -> bool {
        self.local == ClusterPhase::Terminated
    }

    /// This node's phases in gossip form.
    pub fn report(&self) -> PhaseReport {
        PhaseReport {
            local_phase: self.local,
            target_phase: self.target,
            group_phases: self.groups.clone(),
        }
    }

    /// Raise the target phase. Returns whether it moved.
    pub fn raise_target(&mut self, phase: ClusterPhase) -> bool {
        if phase > self.target {
            self.target = phase;
            true
        } else {
            false
        }
    }

    /// Account for a peer's report: the target never trails any phase seen.
    pub fn observe(&mut self, report: &PhaseReport) -> bool {
        let highest = report.target_phase.max(report.local_phase);
        self.raise_target(highest)
    }

    /// Latch a local shutdown request. Returns false if already latched.
    pub fn request_shutdown(&mut self) -> bool {
        if self.shutdown_requested {
            return false;
        }
        self.shutdown_requested = true;
        self.raise_target(ClusterPhase::Stopping);
        true
    }

    /// Move to `phase` if it is ahead of the current phase.
    pub fn enter(&mut self, phase: ClusterPhase) -> bool {
        if phase <= self.local {
            return false;
        }
        self.local = phase;
        self.raise_target(phase);
        true
    }

    /// Mark `group` as having an operation in flight.
    pub fn begin_group(&mut self, group: usize) {
        debug_assert!(self.in_flight.is_none(), "group operation already in flight");
        self.in_flight = Some(group);
    }

    /// Record the end of a group operation, advancing the group to `phase`.
    ///
    /// Returns whether the group's phase moved.
    pub fn complete_group(&mut self, group: usize, phase: EntityGroupPhase) -> bool {
        if self.in_flight == Some(group) {
            self.in_flight = None;
        }
        match self.groups.get_mut(group) {
            Some(current) if phase > *current => {
                *current = phase;
                true
            }
            _ => false,
        }
    }

    /// Stop all further progression.
    pub fn halt(&mut self) {
        self.halted = true;
        self.in_flight = None;
    }

    /// Decide the next step given the current view of the cluster.
    ///
    /// Pure: calling it repeatedly without intervening changes yields the
    /// same answer. Returns `None` when the node has to wait.
    pub fn next_transition(&self, book: &AddressBook) -> Option<Transition> {
        if self.halted || self.in_flight.is_some() {
            return None;
        }

        match self.local {
            ClusterPhase::Connecting => {
                (book.connected_count() == book.len()).then_some(Transition::Enter(ClusterPhase::Starting))
            }
            ClusterPhase::Starting => {
                match self.groups.iter().position(|p| *p != EntityGroupPhase::Running) {
                    None => Some(Transition::Enter(ClusterPhase::Running)),
                    Some(group) => self.group_step(book, group),
                }
            }
            ClusterPhase::Running => (self.shutdown_requested || self.target > ClusterPhase::Running)
                .then_some(Transition::Enter(ClusterPhase::Stopping)),
            ClusterPhase::Stopping => {
                match self.groups.iter().rposition(|p| *p != EntityGroupPhase::Terminated) {
                    None => Some(Transition::Enter(ClusterPhase::Terminated)),
                    Some(group) => self.group_step(book, group),
                }
            }
            ClusterPhase::Terminated => None,
        }
    }

    fn group_step(&self, book: &AddressBook, group: usize) -> Option<Transition> {
        let from = self.groups[group];
        let action = GroupAction::leaving(from)?;
        if !book.all_report_at_least(group, from) {
            return None;
        }
        Some(Transition::Group {
            group,
            from,
            action,
        })
    }
}
