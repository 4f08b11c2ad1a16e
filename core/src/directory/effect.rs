//! Effects emitted by the directory state machine
//!
//! `DirectoryState::apply` never performs I/O; it returns a list of effects
//! that the hub executes in order.

use super::registry::Node;
use super::ConnId;
use crate::gateway::{PerformanceDelta, SessionId};
use crate::protocol::DirectoryEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Deliver an event on one connection
    Send { conn: ConnId, event: DirectoryEvent },
    /// Close a connection with a WebSocket close code
    Close {
        conn: ConnId,
        code: u16,
        reason: String,
    },
    /// Persist the final figures of a removed node
    Flush(SessionFlush),
    /// Delivery outcome of a routed message
    Report(Delivery),
}

/// Final uptime and relay counts of a node leaving the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFlush {
    pub session: Option<SessionId>,
    pub node_id: String,
    pub wallet_address: String,
    pub region: String,
    pub uptime_ms: u64,
    pub relays: u64,
}

impl SessionFlush {
    /// Figures for `node` as of `now_ms`
    pub fn for_node(node: &Node, now_ms: u64) -> Self {
        Self {
            session: node.session.clone(),
            node_id: node.id.clone(),
            wallet_address: node.wallet_address.clone(),
            region: node.region.clone(),
            uptime_ms: node.uptime_ms(now_ms),
            relays: node.relay_count,
        }
    }

    pub fn performance(&self) -> PerformanceDelta {
        PerformanceDelta {
            node_id: self.node_id.clone(),
            wallet_address: self.wallet_address.clone(),
            region: self.region.clone(),
            uptime_ms: self.uptime_ms,
            relays: self.relays,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownNode,
    UnknownRoom,
    NotRegistered,
    NotMember,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::UnknownNode => write!(f, "unknown node"),
            DropReason::UnknownRoom => write!(f, "unknown room"),
            DropReason::NotRegistered => write!(f, "sender not registered"),
            DropReason::NotMember => write!(f, "sender not in room"),
        }
    }
}

/// Ack/nack for an addressed message. Never sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered {
        kind: &'static str,
        target: String,
    },
    Dropped {
        kind: &'static str,
        target: String,
        reason: DropReason,
    },
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered { .. })
    }
}

/// Events queued for `conn`
pub fn sent_to(effects: &[Effect], conn: ConnId) -> Vec<&DirectoryEvent> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Send { conn: c, event } if *c == conn => Some(event),
            _ => None,
        })
        .collect()
}
