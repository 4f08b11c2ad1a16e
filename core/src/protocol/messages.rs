//! Message types exchanged between nodes and the directory

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::job::{RelayHandoff, RelayJob};

/// Protocol decoding errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Public view of a registered node, as shared for peer discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: String,
    pub wallet_address: String,
    pub region: String,
    pub connected_at: u64,
    pub uptime: u64,
    pub relay_count: u64,
    pub reputation: i64,
    pub connection_count: usize,
}

/// Role assigned to a connection when it joins a call room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomRole {
    Initiator,
    Participant,
}

/// Completion notice for a relay job, emitted by the final hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCompletion {
    pub request_id: String,
    pub node_id: String,
    pub signature: String,
}

/// Ask a storage-capable node to keep an opaque chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreChunk {
    pub target_node_id: String,
    /// Requesting node; stamped by the directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub file_id: String,
    pub chunk_id: String,
    /// Base64 chunk bytes
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestChunk {
    pub target_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub file_id: String,
    pub chunk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStored {
    /// Node that asked for the store
    pub to: String,
    pub node_id: String,
    pub file_id: String,
    pub chunk_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkData {
    pub to: String,
    pub node_id: String,
    pub file_id: String,
    pub chunk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Messages a node sends to the directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum NodeCommand {
    #[serde(rename = "register")]
    Register {
        node_id: String,
        wallet_address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat { node_id: String },
    #[serde(rename = "disconnect")]
    Disconnect { node_id: String },
    #[serde(rename = "offer")]
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        offer: Value,
    },
    #[serde(rename = "answer")]
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        answer: Value,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        candidate: Value,
    },
    #[serde(rename = "join")]
    Join { call_id: String },
    #[serde(rename = "leave")]
    Leave { call_id: String },
    #[serde(rename = "broadcast_relay_request")]
    BroadcastRelayRequest(RelayJob),
    /// Hand the job to the next hop, addressed by wallet
    #[serde(rename = "relay_forward")]
    RelayForward { to: String, data: RelayHandoff },
    #[serde(rename = "RELAY_COMPLETED")]
    RelayCompleted(RelayCompletion),
    /// Relay count bookkeeping for a single node
    #[serde(rename = "relay-request")]
    RelayRecorded { node_id: String, tx_hash: String },
    #[serde(rename = "NODE_JOINED_RELAY")]
    NodeJoinedRelay {
        node_id: String,
        request_id: String,
        wallet_address: String,
    },
    #[serde(rename = "STORE_CHUNK")]
    StoreChunk(StoreChunk),
    #[serde(rename = "REQUEST_CHUNK")]
    RequestChunk(RequestChunk),
    #[serde(rename = "CHUNK_STORED")]
    ChunkStored(ChunkStored),
    #[serde(rename = "CHUNK_DATA")]
    ChunkData(ChunkData),
}

impl NodeCommand {
    /// Short name used in logs and delivery reports
    pub fn kind(&self) -> &'static str {
        match self {
            NodeCommand::Register { .. } => "register",
            NodeCommand::Heartbeat { .. } => "heartbeat",
            NodeCommand::Disconnect { .. } => "disconnect",
            NodeCommand::Offer { .. } => "offer",
            NodeCommand::Answer { .. } => "answer",
            NodeCommand::IceCandidate { .. } => "ice-candidate",
            NodeCommand::Join { .. } => "join",
            NodeCommand::Leave { .. } => "leave",
            NodeCommand::BroadcastRelayRequest(_) => "broadcast_relay_request",
            NodeCommand::RelayForward { .. } => "relay_forward",
            NodeCommand::RelayCompleted(_) => "RELAY_COMPLETED",
            NodeCommand::RelayRecorded { .. } => "relay-request",
            NodeCommand::NodeJoinedRelay { .. } => "NODE_JOINED_RELAY",
            NodeCommand::StoreChunk(_) => "STORE_CHUNK",
            NodeCommand::RequestChunk(_) => "REQUEST_CHUNK",
            NodeCommand::ChunkStored(_) => "CHUNK_STORED",
            NodeCommand::ChunkData(_) => "CHUNK_DATA",
        }
    }

    /// Extract the handshake primitive, if this is one
    pub fn into_handshake(self) -> Result<Handshake, NodeCommand> {
        match self {
            NodeCommand::Offer { from, to, call_id, offer } => Ok(Handshake {
                kind: HandshakeKind::Offer,
                from,
                to,
                call_id,
                payload: offer,
            }),
            NodeCommand::Answer { from, to, call_id, answer } => Ok(Handshake {
                kind: HandshakeKind::Answer,
                from,
                to,
                call_id,
                payload: answer,
            }),
            NodeCommand::IceCandidate { from, to, call_id, candidate } => Ok(Handshake {
                kind: HandshakeKind::IceCandidate,
                from,
                to,
                call_id,
                payload: candidate,
            }),
            other => Err(other),
        }
    }
}

/// Messages the directory sends to nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum DirectoryEvent {
    /// Registration accepted; `nodes` never contains the registering node
    #[serde(rename = "registered")]
    Registered { node_id: String, nodes: Vec<NodeInfo> },
    #[serde(rename = "node-list")]
    NodeList { nodes: Vec<NodeInfo>, total_nodes: usize },
    #[serde(rename = "offer")]
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        offer: Value,
    },
    #[serde(rename = "answer")]
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        answer: Value,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        candidate: Value,
    },
    #[serde(rename = "joined")]
    Joined { role: RoomRole },
    #[serde(rename = "peer-joined")]
    PeerJoined,
    #[serde(rename = "peer-left")]
    PeerLeft,
    #[serde(rename = "call-ended")]
    CallEnded { reason: String },
    #[serde(rename = "relay_request")]
    RelayRequest(RelayJob),
    #[serde(rename = "relay_forward")]
    RelayForward { data: RelayHandoff },
    #[serde(rename = "RELAY_COMPLETED")]
    RelayCompleted(RelayCompletion),
    #[serde(rename = "relay-stats")]
    RelayStats { node_id: String, relay_count: u64 },
    #[serde(rename = "STORE_CHUNK")]
    StoreChunk(StoreChunk),
    #[serde(rename = "REQUEST_CHUNK")]
    RequestChunk(RequestChunk),
    #[serde(rename = "CHUNK_STORED")]
    ChunkStored(ChunkStored),
    #[serde(rename = "CHUNK_DATA")]
    ChunkData(ChunkData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    Offer,
    Answer,
    IceCandidate,
}

impl HandshakeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeKind::Offer => "offer",
            HandshakeKind::Answer => "answer",
            HandshakeKind::IceCandidate => "ice-candidate",
        }
    }
}

/// A WebRTC handshake primitive, addressed to a node id or a call room
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub kind: HandshakeKind,
    pub from: Option<String>,
    pub to: Option<String>,
    pub call_id: Option<String>,
    pub payload: Value,
}

impl Handshake {
    /// Build the forwarded event. The payload is carried untouched.
    pub fn to_event(&self) -> DirectoryEvent {
        let from = self.from.clone();
        let call_id = self.call_id.clone();
        let payload = self.payload.clone();
        match self.kind {
            HandshakeKind::Offer => DirectoryEvent::Offer { from, call_id, offer: payload },
            HandshakeKind::Answer => DirectoryEvent::Answer { from, call_id, answer: payload },
            HandshakeKind::IceCandidate => DirectoryEvent::IceCandidate {
                from,
                call_id,
                candidate: payload,
            },
        }
    }
}

/// Decode one inbound text frame
pub fn decode_command(text: &str) -> Result<NodeCommand, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode one frame received from the directory
pub fn decode_event(text: &str) -> Result<DirectoryEvent, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}
