// Ghost Relay Core: directory, signaling and hop execution
//
// Nodes register with a directory, exchange handshakes through it, and
// move value across a chain of selected hops. Ledger, access and
// persistence are external; they sit behind the traits in `gateway`.

pub mod directory;
pub mod gateway;
pub mod node;
pub mod protocol;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

pub use directory::{
    ConnId, DirectoryInput, DirectoryState, DirectoryStats, Effect, Hub, HubConfig, HubError,
    HubHandle, LivenessSweeper, Outbound,
};
pub use gateway::{
    AccessGate, AllowAll, InMemoryLedger, LedgerError, LedgerGateway, NoopPersistence,
    PersistenceError, PersistenceGateway, SessionId, StoredPersistence, TokenAllowList,
};
pub use node::{
    HopOutcome, NodeAgent, NodeClass, NodeClient, NodeClientConfig, NodeIdentity, RelayExecutor,
    RelayTiming,
};
pub use protocol::{DirectoryEvent, NodeCommand, NodeInfo, RelayJob, RelayStatus};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
