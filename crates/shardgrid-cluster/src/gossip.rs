//! Gossip messages and the inbound acceptance rules.
//!
//! A `GossipMessage` carries a node's full phase report. The cookie is only
//! attached to connection-establishing sends; a first message whose cookie
//! differs from ours is dropped without touching any state.

use serde::{Deserialize, Serialize};

use shardgrid_core::NodeAddress;

use crate::address_book::AddressBook;
use crate::error::CoordinatorResult;
use crate::phase::{PhaseMachine, PhaseReport};

/// Phase gossip exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    #[serde(flatten)]
    pub report: PhaseReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

impl GossipMessage {
    /// A steady-state status update.
    pub fn status(report: PhaseReport) -> Self {
        Self {
            report,
            cookie: None,
        }
    }

    /// A connection-establishing hello carrying the cluster cookie.
    pub fn hello(report: PhaseReport, cookie: Option<String>) -> Self {
        Self { report, cookie }
    }
}

/// What accepting an inbound message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// First contact with a mismatched cookie: nothing changed.
    Rejected,
    /// The message claimed to come from this node.
    Ignored,
    Accepted {
        /// The sender was not marked connected before.
        newly_connected: bool,
        /// The sender expects our status in return.
        reply: bool,
        /// Our target phase moved.
        target_raised: bool,
    },
}

/// Apply an inbound message to the address book and phase machine.
///
/// Malformed reports (unknown sender, wrong group count) are returned as
/// errors before any state is touched.
pub fn accept_inbound(
    book: &mut AddressBook,
    machine: &mut PhaseMachine,
    local_cookie: Option<&str>,
    from: &NodeAddress,
    message: &GossipMessage,
) -> CoordinatorResult<InboundOutcome> {
    if book.is_self(from) {
        return Ok(InboundOutcome::Ignored);
    }
    if !book.contains(from) {
        return Err(crate::error::CoordinatorError::UnknownNode(from.clone()));
    }
    book.check_group_count(from, &message.report)?;

    let newly_connected = !book.is_connected(from);
    if newly_connected {
        if let (Some(theirs), Some(ours)) = (message.cookie.as_deref(), local_cookie) {
            if theirs != ours {
                return Ok(InboundOutcome::Rejected);
            }
        }
        book.mark_connected(from);
    }

    book.merge_report(from, &message.report)?;
    let target_raised = machine.observe(&message.report);

    Ok(InboundOutcome::Accepted {
        newly_connected,
        reply: newly_connected && message.cookie.is_some(),
        target_raised,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgrid_core::{ClusterPhase, EntityGroupPhase};

    use crate::error::CoordinatorError;

    fn addr(i: u16) -> NodeAddress {
        NodeAddress::new("node", 9000 + i)
    }

    fn setup() -> (AddressBook, PhaseMachine) {
        let nodes: Vec<NodeAddress> = (0..2).map(addr).collect();
        (AddressBook::new(&addr(0), &nodes, 1).unwrap(), PhaseMachine::new(1))
    }

    fn peer_report(target: ClusterPhase) -> PhaseReport {
        PhaseReport {
            local_phase: ClusterPhase::Starting,
            target_phase: target,
            group_phases: vec![EntityGroupPhase::Created],
        }
    }

    #[test]
    fn wire_format_uses_ordinals() {
        let msg = GossipMessage::hello(peer_report(ClusterPhase::Running), Some("c".into()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["local_phase"], 1);
        assert_eq!(json["target_phase"], 2);
        assert_eq!(json["group_phases"], serde_json::json!([1]));
        assert_eq!(json["cookie"], "c");

        let status = serde_json::to_value(GossipMessage::status(peer_report(ClusterPhase::Running)))
            .unwrap();
        assert!(status.get("cookie").is_none());
    }

    #[test]
    fn wire_rejects_invalid_ordinal() {
        let raw = r#"{"local_phase":9,"target_phase":0,"group_phases":[0]}"#;
        assert!(serde_json::from_str::<GossipMessage>(raw).is_err());
    }

    #[test]
    fn first_hello_connects_and_requests_reply() {
        let (mut book, mut machine) = setup();
        let msg = GossipMessage::hello(peer_report(ClusterPhase::Starting), Some("c".into()));

        let outcome = accept_inbound(&mut book, &mut machine, Some("c"), &addr(1), &msg).unwrap();
        assert_eq!(
            outcome,
            InboundOutcome::Accepted {
                newly_connected: true,
                reply: true,
                target_raised: true,
            }
        );
        assert!(book.is_connected(&addr(1)));
        assert_eq!(
            book.get(&addr(1)).unwrap().report.group_phases,
            vec![EntityGroupPhase::Created]
        );
    }

    #[test]
    fn mismatched_cookie_changes_nothing() {
        let (mut book, mut machine) = setup();
        let before_book = book.clone();
        let msg = GossipMessage::hello(peer_report(ClusterPhase::Stopping), Some("other".into()));

        let outcome = accept_inbound(&mut book, &mut machine, Some("mine"), &addr(1), &msg).unwrap();
        assert_eq!(outcome, InboundOutcome::Rejected);
        assert!(!book.is_connected(&addr(1)));
        assert_eq!(book.get(&addr(1)), before_book.get(&addr(1)));
        assert_eq!(machine.target(), ClusterPhase::Connecting);
    }

    #[test]
    fn cookie_ignored_once_connected() {
        let (mut book, mut machine) = setup();
        book.mark_connected(&addr(1));
        let msg = GossipMessage::hello(peer_report(ClusterPhase::Starting), Some("other".into()));

        let outcome = accept_inbound(&mut book, &mut machine, Some("mine"), &addr(1), &msg).unwrap();
        assert!(matches!(
            outcome,
            InboundOutcome::Accepted {
                newly_connected: false,
                reply: false,
                ..
            }
        ));
    }

    #[test]
    fn cookieless_first_message_connects_without_reply() {
        let (mut book, mut machine) = setup();
        let msg = GossipMessage::status(peer_report(ClusterPhase::Starting));

        let outcome = accept_inbound(&mut book, &mut machine, Some("mine"), &addr(1), &msg).unwrap();
        assert!(matches!(
            outcome,
            InboundOutcome::Accepted {
                newly_connected: true,
                reply: false,
                ..
            }
        ));
    }

    #[test]
    fn no_local_cookie_accepts_any() {
        let (mut book, mut machine) = setup();
        let msg = GossipMessage::hello(peer_report(ClusterPhase::Starting), Some("x".into()));
        let outcome = accept_inbound(&mut book, &mut machine, None, &addr(1), &msg).unwrap();
        assert!(matches!(outcome, InboundOutcome::Accepted { reply: true, .. }));
    }

    #[test]
    fn target_raised_from_peer() {
        let (mut book, mut machine) = setup();
        let msg = GossipMessage::status(peer_report(ClusterPhase::Stopping));
        accept_inbound(&mut book, &mut machine, None, &addr(1), &msg).unwrap();
        assert_eq!(machine.target(), ClusterPhase::Stopping);
        assert_eq!(machine.local(), ClusterPhase::Connecting);
    }

    #[test]
    fn unknown_sender_and_bad_vector_rejected() {
        let (mut book, mut machine) = setup();
        let msg = GossipMessage::status(peer_report(ClusterPhase::Starting));
        let err = accept_inbound(&mut book, &mut machine, None, &addr(7), &msg).unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownNode(_)));

        let mut bad = msg.clone();
        bad.report.group_phases.push(EntityGroupPhase::Pending);
        let err = accept_inbound(&mut book, &mut machine, None, &addr(1), &bad).unwrap_err();
        assert!(matches!(err, CoordinatorError::GroupCountMismatch { .. }));
        assert!(!book.is_connected(&addr(1)));
    }

    #[test]
    fn message_from_self_ignored() {
        let (mut book, mut machine) = setup();
        let msg = GossipMessage::status(peer_report(ClusterPhase::Stopping));
        let outcome = accept_inbound(&mut book, &mut machine, None, &addr(0), &msg).unwrap();
        assert_eq!(outcome, InboundOutcome::Ignored);
        assert_eq!(machine.target(), ClusterPhase::Connecting);
    }
}
