//! Directory state machine
//!
//! One [`DirectoryInput`] in, a list of [`Effect`]s out. Registry, rooms and
//! the connection index only change inside [`DirectoryState::apply`].

use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::broadcast::RelayBroadcaster;
use super::effect::{Delivery, DropReason, Effect, SessionFlush};
use super::registry::{DirectoryStats, NodeRegistry, Registration};
use super::rooms::{
    CallSummary, JoinOutcome, LeaveOutcome, RoomTable, REASON_INITIATOR_DISCONNECTED,
    REASON_INITIATOR_LEFT,
};
use super::router::{SignalingRouter, Target};
use super::sweeper::LivenessSweeper;
use super::ConnId;
use crate::protocol::{DirectoryEvent, NodeCommand, NodeInfo};

#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryInput {
    /// A socket was accepted
    Opened(ConnId),
    /// A `register` passed the access gate and has a session
    Registered {
        conn: ConnId,
        registration: Registration,
    },
    /// A `register` failed the access gate
    Rejected { conn: ConnId, reason: String },
    /// Any other decoded command
    Command { conn: ConnId, command: NodeCommand },
    /// The socket closed
    Closed(ConnId),
    /// Sweeper tick
    Sweep,
}

pub struct DirectoryState {
    registry: NodeRegistry,
    rooms: RoomTable,
    /// Open connections and the node id each one currently owns
    conns: HashMap<ConnId, Option<String>>,
    sweeper: LivenessSweeper,
}

impl DirectoryState {
    pub fn new(sweeper: LivenessSweeper) -> Self {
        Self {
            registry: NodeRegistry::new(sweeper.timeout),
            rooms: RoomTable::new(),
            conns: HashMap::new(),
            sweeper,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomTable {
        &self.rooms
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Node id owned by `conn`, if its registry entry still points at it
    pub fn owner_of(&self, conn: ConnId) -> Option<&str> {
        let id = self.conns.get(&conn)?.as_deref()?;
        match self.registry.get(id) {
            Some(node) if node.conn == conn => Some(id),
            _ => None,
        }
    }

    pub fn apply(&mut self, input: DirectoryInput, now_ms: u64) -> Vec<Effect> {
        match input {
            DirectoryInput::Opened(conn) => {
                self.conns.insert(conn, None);
                Vec::new()
            }
            DirectoryInput::Registered { conn, registration } => {
                self.on_registered(conn, registration, now_ms)
            }
            DirectoryInput::Rejected { conn, reason } => {
                warn!("Registration on {} rejected: {}", conn, reason);
                vec![Effect::Close {
                    conn,
                    code: super::hub::CLOSE_POLICY_VIOLATION,
                    reason,
                }]
            }
            DirectoryInput::Command { conn, command } => self.on_command(conn, command, now_ms),
            DirectoryInput::Closed(conn) => self.on_closed(conn, now_ms),
            DirectoryInput::Sweep => self.sweeper.sweep(&mut self.registry, now_ms),
        }
    }

    fn on_registered(
        &mut self,
        conn: ConnId,
        registration: Registration,
        now_ms: u64,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();

        if !self.conns.contains_key(&conn) {
            debug!(
                "{} closed before registration of {} completed",
                conn, registration.node_id
            );
            if registration.session.is_some() {
                effects.push(Effect::Flush(SessionFlush {
                    session: registration.session,
                    node_id: registration.node_id,
                    wallet_address: registration.wallet_address,
                    region: registration.region,
                    uptime_ms: 0,
                    relays: 0,
                }));
            }
            return effects;
        }

        // A connection owns one node id at a time
        if let Some(previous) = self.owner_of(conn).map(str::to_string) {
            if previous != registration.node_id {
                if let Some(node) = self.registry.remove(&previous) {
                    effects.push(Effect::Flush(SessionFlush::for_node(&node, now_ms)));
                }
            }
        }

        let node_id = registration.node_id.clone();
        info!(
            "Node registered: {} ({}, {})",
            node_id, registration.wallet_address, registration.region
        );
        if let Some(displaced) = self.registry.register(registration, conn, now_ms) {
            effects.push(Effect::Flush(SessionFlush::for_node(&displaced, now_ms)));
            if displaced.conn != conn {
                if let Some(owner) = self.conns.get_mut(&displaced.conn) {
                    *owner = None;
                }
            }
        }
        self.conns.insert(conn, Some(node_id.clone()));

        let nodes = self.registry.snapshot(Some(&node_id), now_ms);
        effects.push(Effect::Send {
            conn,
            event: DirectoryEvent::Registered { node_id, nodes },
        });
        effects.extend(RelayBroadcaster::node_list(&self.registry, now_ms));
        effects
    }

    fn on_command(&mut self, conn: ConnId, command: NodeCommand, now_ms: u64) -> Vec<Effect> {
        let owner = self.owner_of(conn).map(str::to_string);
        if let Some(id) = &owner {
            self.registry.touch(id, now_ms);
        }

        match command {
            NodeCommand::Register { node_id, .. } => {
                warn!("Ungated register for {} on {} ignored", node_id, conn);
                Vec::new()
            }
            NodeCommand::Heartbeat { node_id } => {
                if owner.as_deref() != Some(node_id.as_str()) {
                    debug!("Heartbeat for {} from non-owner {}", node_id, conn);
                }
                Vec::new()
            }
            NodeCommand::Disconnect { node_id } => self.on_disconnect(conn, &node_id, now_ms),
            cmd @ (NodeCommand::Offer { .. }
            | NodeCommand::Answer { .. }
            | NodeCommand::IceCandidate { .. }) => match cmd.into_handshake() {
                Ok(handshake) => SignalingRouter::route_handshake(
                    handshake,
                    conn,
                    owner.as_deref(),
                    &mut self.registry,
                    &self.rooms,
                    now_ms,
                ),
                Err(_) => Vec::new(),
            },
            NodeCommand::Join { call_id } => self.on_join(conn, call_id),
            NodeCommand::Leave { call_id } => self.on_leave(conn, &call_id),
            NodeCommand::BroadcastRelayRequest(job) => {
                RelayBroadcaster::fan_out(&job, &self.registry, now_ms)
            }
            NodeCommand::RelayForward { to, data } => SignalingRouter::deliver(
                &self.registry,
                Target::Wallet(&to),
                "relay_forward",
                DirectoryEvent::RelayForward { data },
                now_ms,
            ),
            NodeCommand::RelayCompleted(completion) => {
                info!(
                    "Relay {} completed by {}",
                    completion.request_id, completion.node_id
                );
                self.registry.record_relay(&completion.node_id);
                let conns: Vec<ConnId> = self.conns.keys().copied().collect();
                RelayBroadcaster::broadcast_all(&DirectoryEvent::RelayCompleted(completion), conns)
            }
            NodeCommand::RelayRecorded { node_id, tx_hash } => {
                match self.registry.record_relay(&node_id) {
                    Some(relay_count) => {
                        self.registry.touch(&node_id, now_ms);
                        info!("Relay recorded for {}: {}", node_id, tx_hash);
                        RelayBroadcaster::broadcast_all(
                            &DirectoryEvent::RelayStats {
                                node_id,
                                relay_count,
                            },
                            self.registry.connections(),
                        )
                    }
                    None => {
                        debug!("Relay recorded for unknown node {}", node_id);
                        Vec::new()
                    }
                }
            }
            NodeCommand::NodeJoinedRelay {
                node_id,
                request_id,
                wallet_address,
            } => {
                info!(
                    "Node {} ({}) joined relay {}",
                    node_id, wallet_address, request_id
                );
                Vec::new()
            }
            NodeCommand::StoreChunk(mut chunk) => {
                if let Some(id) = &owner {
                    chunk.from = Some(id.clone());
                }
                let target = chunk.target_node_id.clone();
                SignalingRouter::deliver(
                    &self.registry,
                    Target::Node(&target),
                    "STORE_CHUNK",
                    DirectoryEvent::StoreChunk(chunk),
                    now_ms,
                )
            }
            NodeCommand::RequestChunk(mut request) => {
                if let Some(id) = &owner {
                    request.from = Some(id.clone());
                }
                let target = request.target_node_id.clone();
                SignalingRouter::deliver(
                    &self.registry,
                    Target::Node(&target),
                    "REQUEST_CHUNK",
                    DirectoryEvent::RequestChunk(request),
                    now_ms,
                )
            }
            NodeCommand::ChunkStored(reply) => {
                let target = reply.to.clone();
                SignalingRouter::deliver(
                    &self.registry,
                    Target::Node(&target),
                    "CHUNK_STORED",
                    DirectoryEvent::ChunkStored(reply),
                    now_ms,
                )
            }
            NodeCommand::ChunkData(reply) => {
                let target = reply.to.clone();
                SignalingRouter::deliver(
                    &self.registry,
                    Target::Node(&target),
                    "CHUNK_DATA",
                    DirectoryEvent::ChunkData(reply),
                    now_ms,
                )
            }
        }
    }

    fn on_disconnect(&mut self, conn: ConnId, node_id: &str, now_ms: u64) -> Vec<Effect> {
        let owned = self
            .registry
            .get(node_id)
            .map_or(false, |node| node.conn == conn);
        if !owned {
            debug!("Disconnect for {} from non-owner {}", node_id, conn);
            return vec![Effect::Report(Delivery::Dropped {
                kind: "disconnect",
                target: node_id.to_string(),
                reason: DropReason::NotRegistered,
            })];
        }

        let mut effects = Vec::new();
        if let Some(node) = self.registry.remove(node_id) {
            info!("Node {} gracefully disconnected", node_id);
            effects.push(Effect::Flush(SessionFlush::for_node(&node, now_ms)));
        }
        if let Some(owner) = self.conns.get_mut(&conn) {
            *owner = None;
        }
        effects.extend(RelayBroadcaster::node_list(&self.registry, now_ms));
        effects
    }

    fn on_join(&mut self, conn: ConnId, call_id: String) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(current) = self.rooms.room_of(conn).map(str::to_string) {
            if current != call_id {
                let outcome = self.rooms.leave(&current, conn);
                effects.extend(Self::leave_effects(outcome, REASON_INITIATOR_LEFT));
            }
        }

        let outcome = self.rooms.join(&call_id, conn);
        if let JoinOutcome::Joined { initiator } = outcome {
            effects.push(Effect::Send {
                conn: initiator,
                event: DirectoryEvent::PeerJoined,
            });
        }
        effects.push(Effect::Send {
            conn,
            event: DirectoryEvent::Joined {
                role: outcome.role(),
            },
        });
        effects
    }

    fn on_leave(&mut self, conn: ConnId, call_id: &str) -> Vec<Effect> {
        match self.rooms.leave(call_id, conn) {
            LeaveOutcome::NotMember => {
                debug!("{} left call {} it was not in", conn, call_id);
                vec![Effect::Report(Delivery::Dropped {
                    kind: "leave",
                    target: call_id.to_string(),
                    reason: DropReason::NotMember,
                })]
            }
            outcome => Self::leave_effects(outcome, REASON_INITIATOR_LEFT),
        }
    }

    fn leave_effects(outcome: LeaveOutcome, reason: &str) -> Vec<Effect> {
        match outcome {
            LeaveOutcome::Closed { participants } => participants
                .into_iter()
                .map(|conn| Effect::Send {
                    conn,
                    event: DirectoryEvent::CallEnded {
                        reason: reason.to_string(),
                    },
                })
                .collect(),
            LeaveOutcome::ParticipantLeft { remaining } => {
                RelayBroadcaster::broadcast_all(&DirectoryEvent::PeerLeft, remaining)
            }
            LeaveOutcome::NotMember => Vec::new(),
        }
    }

    fn on_closed(&mut self, conn: ConnId, now_ms: u64) -> Vec<Effect> {
        let owner = self.owner_of(conn).map(str::to_string);
        self.conns.remove(&conn);

        let mut effects = Vec::new();
        if let Some((_, outcome)) = self.rooms.leave_all(conn) {
            effects.extend(Self::leave_effects(outcome, REASON_INITIATOR_DISCONNECTED));
        }

        if let Some(node_id) = owner {
            if let Some(node) = self.registry.remove(&node_id) {
                info!("Node {} connection closed", node_id);
                effects.push(Effect::Flush(SessionFlush::for_node(&node, now_ms)));
                effects.extend(RelayBroadcaster::node_list(&self.registry, now_ms));
            }
        }
        effects
    }

    /// Live nodes
    pub fn nodes(&self, now_ms: u64) -> Vec<NodeInfo> {
        self.registry.snapshot(None, now_ms)
    }

    pub fn stats(&self, now_ms: u64) -> DirectoryStats {
        self.registry.stats(now_ms)
    }

    pub fn calls(&self) -> Vec<CallSummary> {
        self.rooms.calls()
    }
}

impl Default for DirectoryState {
    fn default() -> Self {
        Self::new(LivenessSweeper::default())
    }
}
