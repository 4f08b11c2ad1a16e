//! External collaborators of the relay network
//!
//! The directory and the nodes only ever talk to these traits:
//! - [`AccessGate`]: token check at registration time
//! - [`LedgerGateway`]: join / transfer / claim submission
//! - [`PersistenceGateway`]: session, uptime and reputation history
//!
//! Implementations here are the in-tree ones; production deployments plug
//! their own behind the same seams.

pub mod access;
pub mod ledger;
pub mod persistence;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::RelayJob;
use crate::store::StorageError;

pub use access::{AllowAll, TokenAllowList};
pub use ledger::{InMemoryLedger, LedgerOp, LedgerRecord};
pub use persistence::{NoopPersistence, PerformanceRecord, SessionRecord, StoredPersistence};

/// Ledger transaction signature
pub type Signature = String;

/// Opaque session handle issued by the persistence gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger rejected {op}: {reason}")]
    Rejected { op: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Validates the access token a node presents when it registers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn validate(&self, token: &str) -> bool;
}

/// Submits relay operations to the underlying ledger
///
/// Join and claim are best-effort bookkeeping; only transfer decides whether
/// a hop succeeded.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn submit_join(&self, job: &RelayJob) -> Result<Signature, LedgerError>;
    async fn submit_transfer(
        &self,
        job: &RelayJob,
        destination: &str,
    ) -> Result<Signature, LedgerError>;
    async fn submit_claim(&self, job: &RelayJob) -> Result<Signature, LedgerError>;
}

/// Uptime and relay counts accumulated by one node since the last flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformanceDelta {
    pub node_id: String,
    pub wallet_address: String,
    pub region: String,
    pub uptime_ms: u64,
    pub relays: u64,
}

/// Durable per-node history. Callers log and swallow every error.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_session(
        &self,
        node_id: &str,
        region: &str,
    ) -> Result<SessionId, PersistenceError>;

    async fn end_session(
        &self,
        session: &SessionId,
        uptime_ms: u64,
        relays_completed: u64,
    ) -> Result<(), PersistenceError>;

    async fn upsert_performance(&self, delta: &PerformanceDelta) -> Result<(), PersistenceError>;
}
