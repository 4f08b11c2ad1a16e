//! Relay node: identity, hop execution, chunk storage and the directory client

pub mod agent;
pub mod chunks;
pub mod client;
pub mod executor;
pub mod identity;

pub use agent::NodeAgent;
pub use chunks::{ChunkError, ChunkMeta, ChunkStore};
pub use client::{ClientError, NodeClient, NodeClientConfig};
pub use executor::{HopOutcome, IgnoreReason, RelayExecutor, RelayTiming, TrackedJob};
pub use identity::{NodeClass, NodeIdentity, BOOTSTRAP_MARKER};
