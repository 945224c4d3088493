//! Frame forwarding policy.
//!
//! A hub evaluates every inbound frame against an ordered rule table. Each
//! rule matches structurally on (type, operand) and optionally on the
//! sender's declared role, and yields a routing decision. The first match
//! wins; when no user rule matches, a built-in table implements the
//! default cluster routing, and anything left over is delivered locally.
//!
//! Forwarded frames are relayed as their exact ingress octets; the hub
//! never re-encodes.

use uuid::Uuid;

use crate::protocol::{Command, Event, FrameKind, Status};
use crate::role::Role;

/// Structural match over an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFilter {
    /// The (type, operand) pair to match.
    pub kind: FrameKind,
    /// When set, the sender's declared role must intersect this mask.
    pub sender_role: Option<Role>,
}

impl FrameFilter {
    /// Match any sender for the given kind.
    pub fn kind(kind: FrameKind) -> Self {
        Self {
            kind,
            sender_role: None,
        }
    }

    /// Match the given kind from senders holding any bit of `role`.
    pub fn kind_from(kind: FrameKind, role: Role) -> Self {
        Self {
            kind,
            sender_role: Some(role),
        }
    }

    fn matches(&self, kind: &FrameKind, sender_role: Role) -> bool {
        if self.kind != *kind {
            return false;
        }
        match self.sender_role {
            Some(mask) => sender_role.intersects(mask),
            None => true,
        }
    }
}

/// What to do with a matched frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardAction {
    /// Hand the frame to the local handler.
    Deliver,
    /// Relay to every connected peer holding any bit of the mask, except
    /// the sender.
    ToRoles(Role),
    /// Relay to the listed peers.
    ToUuids(Vec<Uuid>),
    /// Relay to the peer whose UUID leads the payload (36 bytes of
    /// hyphenated text), provided it holds any bit of the mask.
    ToPayloadUuid {
        /// Role mask the addressed peer must hold.
        role: Role,
    },
    /// Discard the frame.
    Drop,
}

/// What a hub does when a destination's send queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the frame and log a warning. For telemetry-like traffic.
    DropAndWarn,
    /// Close the slow peer. For frames that must not be silently lost.
    ClosePeer,
}

/// One forwarding rule: a predicate and its routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    /// The frames this rule applies to.
    pub filter: FrameFilter,
    /// The routing decision.
    pub action: ForwardAction,
    /// Per-rule overflow override; the per-operand default applies when
    /// unset.
    pub overflow: Option<OverflowPolicy>,
}

impl ForwardRule {
    /// Rule with the default overflow policy.
    pub fn new(filter: FrameFilter, action: ForwardAction) -> Self {
        Self {
            filter,
            action,
            overflow: None,
        }
    }
}

/// An ordered forwarding table.
#[derive(Debug, Clone, Default)]
pub struct ForwardTable {
    rules: Vec<ForwardRule>,
}

impl ForwardTable {
    /// Build a table from user-supplied rules.
    pub fn new(rules: Vec<ForwardRule>) -> Self {
        Self { rules }
    }

    /// Decide the routing for one inbound frame. Returns the action and
    /// the overflow policy to apply to relays.
    pub fn decide(&self, kind: &FrameKind, sender_role: Role) -> (ForwardAction, OverflowPolicy) {
        for rule in &self.rules {
            if rule.filter.matches(kind, sender_role) {
                let overflow = rule.overflow.unwrap_or_else(|| default_overflow(kind));
                return (rule.action.clone(), overflow);
            }
        }

        let action = builtin_action(kind, sender_role).unwrap_or(ForwardAction::Deliver);
        (action, default_overflow(kind))
    }
}

/// The default routing every hub implements without explicit rules.
fn builtin_action(kind: &FrameKind, sender_role: Role) -> Option<ForwardAction> {
    match kind {
        // Node statistics flow from agents to every Controller.
        FrameKind::Command(Command::Stats) if sender_role.intersects(Role::AGENT) => {
            Some(ForwardAction::ToRoles(Role::CONTROLLER))
        }
        // Cluster topology events go to every Controller.
        FrameKind::Event(Event::ConcentratorInstanceAdded)
        | FrameKind::Event(Event::PublicIpAssigned)
        | FrameKind::Event(Event::NodeConnected)
        | FrameKind::Event(Event::NodeDisconnected) => {
            Some(ForwardAction::ToRoles(Role::CONTROLLER))
        }
        // Public IP management is relayed to the addressed concentrator.
        FrameKind::Command(Command::AssignPublicIp)
        | FrameKind::Command(Command::ReleasePublicIp)
            if sender_role.intersects(Role::CONTROLLER) =>
        {
            Some(ForwardAction::ToPayloadUuid {
                role: Role::CNCIAGENT,
            })
        }
        // START lands on the hub; choosing an agent is the embedder's
        // scheduling policy, not the protocol's.
        FrameKind::Command(Command::Start) => Some(ForwardAction::Deliver),
        _ => None,
    }
}

/// Per-operand overflow default: handshake and configuration frames must
/// not be silently dropped.
pub(crate) fn default_overflow(kind: &FrameKind) -> OverflowPolicy {
    match kind {
        FrameKind::Command(Command::Configure) | FrameKind::Status(Status::Connected) => {
            OverflowPolicy::ClosePeer
        }
        _ => OverflowPolicy::DropAndWarn,
    }
}

/// Parse the destination UUID leading a payload, used by
/// [`ForwardAction::ToPayloadUuid`].
pub(crate) fn payload_destination(payload: &[u8]) -> Option<Uuid> {
    let head = payload.get(..36)?;
    let text = std::str::from_utf8(head).ok()?;
    Uuid::parse_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_matching_rule_wins() {
        let kind = FrameKind::Command(Command::Stats);
        let table = ForwardTable::new(vec![
            ForwardRule::new(FrameFilter::kind(kind), ForwardAction::Drop),
            ForwardRule::new(FrameFilter::kind(kind), ForwardAction::Deliver),
        ]);

        let (action, _) = table.decide(&kind, Role::AGENT);
        assert_eq!(action, ForwardAction::Drop);
    }

    #[test]
    fn test_sender_role_predicate() {
        let kind = FrameKind::Event(Event::TenantAdded);
        let table = ForwardTable::new(vec![ForwardRule::new(
            FrameFilter::kind_from(kind, Role::NETAGENT),
            ForwardAction::ToRoles(Role::CNCIAGENT),
        )]);

        let (action, _) = table.decide(&kind, Role::NETAGENT);
        assert_eq!(action, ForwardAction::ToRoles(Role::CNCIAGENT));

        // Different sender: the rule does not match, default delivers.
        let (action, _) = table.decide(&kind, Role::AGENT);
        assert_eq!(action, ForwardAction::Deliver);
    }

    #[test]
    fn test_builtin_stats_fanout() {
        let table = ForwardTable::default();
        let (action, overflow) = table.decide(&FrameKind::Command(Command::Stats), Role::AGENT);
        assert_eq!(action, ForwardAction::ToRoles(Role::CONTROLLER));
        assert_eq!(overflow, OverflowPolicy::DropAndWarn);

        // STATS straight from a Controller stays local.
        let (action, _) = table.decide(&FrameKind::Command(Command::Stats), Role::CONTROLLER);
        assert_eq!(action, ForwardAction::Deliver);
    }

    #[test]
    fn test_builtin_events_to_controllers() {
        let table = ForwardTable::default();
        for event in [
            Event::ConcentratorInstanceAdded,
            Event::PublicIpAssigned,
            Event::NodeConnected,
            Event::NodeDisconnected,
        ] {
            let (action, _) = table.decide(&FrameKind::Event(event), Role::NETAGENT);
            assert_eq!(action, ForwardAction::ToRoles(Role::CONTROLLER), "{}", event);
        }
    }

    #[test]
    fn test_builtin_public_ip_addressing() {
        let table = ForwardTable::default();
        let (action, _) = table.decide(
            &FrameKind::Command(Command::AssignPublicIp),
            Role::CONTROLLER,
        );
        assert_eq!(
            action,
            ForwardAction::ToPayloadUuid {
                role: Role::CNCIAGENT
            }
        );
    }

    #[test]
    fn test_default_is_deliver() {
        let table = ForwardTable::default();
        let (action, _) = table.decide(&FrameKind::Status(Status::Ready), Role::AGENT);
        assert_eq!(action, ForwardAction::Deliver);
    }

    #[test]
    fn test_critical_overflow_policy() {
        assert_eq!(
            default_overflow(&FrameKind::Command(Command::Configure)),
            OverflowPolicy::ClosePeer
        );
        assert_eq!(
            default_overflow(&FrameKind::Status(Status::Connected)),
            OverflowPolicy::ClosePeer
        );
        assert_eq!(
            default_overflow(&FrameKind::Command(Command::Stats)),
            OverflowPolicy::DropAndWarn
        );
    }

    #[test]
    fn test_payload_destination() {
        let uuid = Uuid::new_v4();
        let mut payload = uuid.to_string().into_bytes();
        payload.extend_from_slice(b"\nip: 10.0.0.1");

        assert_eq!(payload_destination(&payload), Some(uuid));
        assert_eq!(payload_destination(b"short"), None);
        assert_eq!(payload_destination(&[0xffu8; 40]), None);
    }
}
