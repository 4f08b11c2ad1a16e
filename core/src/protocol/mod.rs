//! Node-facing wire protocol
//!
//! JSON text frames tagged by `type`. There is no version field; both sides
//! decode into closed enums and reject anything else at the boundary.

pub mod job;
pub mod messages;

pub use job::{RelayHandoff, RelayJob, RelayStatus};
pub use messages::{
    decode_command, decode_event, ChunkData, ChunkStored, DirectoryEvent, Handshake, HandshakeKind,
    NodeCommand, NodeInfo, ProtocolError, RelayCompletion, RequestChunk, RoomRole, StoreChunk,
};
