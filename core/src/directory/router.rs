//! Signaling router: forwards handshake primitives and addressed payloads
//!
//! Fire-and-forget: an absent target is logged and reported as dropped,
//! never answered on the wire.

use tracing::debug;

use super::effect::{Delivery, DropReason, Effect};
use super::registry::NodeRegistry;
use super::rooms::RoomTable;
use super::ConnId;
use crate::protocol::{DirectoryEvent, Handshake};

/// How an addressed message names its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Node(&'a str),
    Wallet(&'a str),
}

impl Target<'_> {
    fn label(&self) -> String {
        match self {
            Target::Node(id) => id.to_string(),
            Target::Wallet(w) => format!("wallet:{}", w),
        }
    }
}

pub struct SignalingRouter;

impl SignalingRouter {
    /// Route an offer/answer/ICE candidate.
    ///
    /// `to` takes precedence over `call_id`. Node-addressed messages get
    /// `from` stamped with the sender's node id when it is missing and link
    /// both nodes in the registry.
    pub fn route_handshake(
        mut handshake: Handshake,
        sender: ConnId,
        sender_id: Option<&str>,
        registry: &mut NodeRegistry,
        rooms: &RoomTable,
        now_ms: u64,
    ) -> Vec<Effect> {
        let kind = handshake.kind.as_str();

        if let Some(to) = handshake.to.clone() {
            if handshake.from.is_none() {
                handshake.from = sender_id.map(str::to_string);
            }
            let effects = Self::deliver(
                registry,
                Target::Node(&to),
                kind,
                handshake.to_event(),
                now_ms,
            );
            if effects.iter().any(|e| matches!(e, Effect::Send { .. })) {
                if let Some(from) = sender_id {
                    registry.link(from, &to);
                }
            }
            return effects;
        }

        if let Some(call_id) = handshake.call_id.clone() {
            let Some(members) = rooms.members_except(&call_id, sender) else {
                debug!("Dropping {} for unknown call {}", kind, call_id);
                return vec![Effect::Report(Delivery::Dropped {
                    kind,
                    target: call_id,
                    reason: DropReason::UnknownRoom,
                })];
            };
            let event = handshake.to_event();
            let mut effects: Vec<Effect> = members
                .into_iter()
                .map(|conn| Effect::Send {
                    conn,
                    event: event.clone(),
                })
                .collect();
            debug!("Forwarded {} to {} member(s) of call {}", kind, effects.len(), call_id);
            effects.push(Effect::Report(Delivery::Delivered {
                kind,
                target: call_id,
            }));
            return effects;
        }

        debug!("Dropping unaddressed {} from {}", kind, sender);
        vec![Effect::Report(Delivery::Dropped {
            kind,
            target: String::new(),
            reason: DropReason::UnknownNode,
        })]
    }

    /// Deliver `event` to the live node behind `target`.
    ///
    /// A wallet reaches every live node registered under it.
    pub fn deliver(
        registry: &NodeRegistry,
        target: Target<'_>,
        kind: &'static str,
        event: DirectoryEvent,
        now_ms: u64,
    ) -> Vec<Effect> {
        let candidates: Vec<_> = match target {
            Target::Node(id) => registry.get(id).into_iter().collect(),
            Target::Wallet(wallet) => registry.by_wallet(wallet),
        };

        let mut conns: Vec<ConnId> = candidates
            .into_iter()
            .filter(|node| node.is_alive(now_ms, registry.timeout()))
            .map(|node| {
                debug!("Forwarding {} to {}", kind, node.id);
                node.conn
            })
            .collect();
        conns.sort();
        conns.dedup();

        if conns.is_empty() {
            debug!("Dropping {} for absent target {}", kind, target.label());
            return vec![Effect::Report(Delivery::Dropped {
                kind,
                target: target.label(),
                reason: DropReason::UnknownNode,
            })];
        }

        let mut effects: Vec<Effect> = conns
            .into_iter()
            .map(|conn| Effect::Send {
                conn,
                event: event.clone(),
            })
            .collect();
        effects.push(Effect::Report(Delivery::Delivered {
            kind,
            target: target.label(),
        }));
        effects
    }
}
