//! Directory service: node registry, signaling, call rooms and relay fan-out
//!
//! All state lives in [`DirectoryState`], mutated one message at a time by
//! the [`Hub`] event loop.

pub mod broadcast;
pub mod effect;
pub mod hub;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod state;
pub mod sweeper;

pub use broadcast::RelayBroadcaster;
pub use effect::{Delivery, DropReason, Effect, SessionFlush};
pub use hub::{
    Connection, Hub, HubConfig, HubError, HubHandle, HubHealth, Outbound, CLOSE_POLICY_VIOLATION,
};
pub use registry::{DirectoryStats, Node, NodeRegistry, Registration, NODE_TIMEOUT};
pub use rooms::{CallRoom, CallSummary, JoinOutcome, LeaveOutcome, RoomTable};
pub use router::SignalingRouter;
pub use state::{DirectoryInput, DirectoryState};
pub use sweeper::{LivenessSweeper, SWEEP_INTERVAL};

use std::fmt;

/// Identifies one WebSocket connection for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
