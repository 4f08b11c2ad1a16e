//! Session and performance history
//!
//! Sessions are keyed `session:<uuid>`; cumulative per-node performance rows
//! are keyed `perf:<node_id>`. Both are JSON documents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{PerformanceDelta, PersistenceError, PersistenceGateway, SessionId};
use crate::store::{get_json, put_json, StorageBackend};

const SESSION_PREFIX: &str = "session:";
const PERF_PREFIX: &str = "perf:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub node_id: String,
    pub region: String,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub uptime_ms: u64,
    pub relays_completed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub node_id: String,
    pub wallet_address: String,
    pub region: String,
    pub total_uptime_ms: u64,
    pub total_relays: u64,
    pub flushes: u64,
    pub updated_at: u64,
}

/// Discards everything; sessions get a fresh id so nodes still carry a handle
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersistence;

#[async_trait]
impl PersistenceGateway for NoopPersistence {
    async fn create_session(
        &self,
        _node_id: &str,
        _region: &str,
    ) -> Result<SessionId, PersistenceError> {
        Ok(SessionId(uuid::Uuid::new_v4().to_string()))
    }

    async fn end_session(
        &self,
        _session: &SessionId,
        _uptime_ms: u64,
        _relays_completed: u64,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn upsert_performance(&self, _delta: &PerformanceDelta) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Persistence on top of any [`StorageBackend`]
pub struct StoredPersistence<B> {
    backend: B,
}

impl<B: StorageBackend> StoredPersistence<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn session(&self, session: &SessionId) -> Result<Option<SessionRecord>, PersistenceError> {
        Ok(get_json(&self.backend, &session_key(session))?)
    }

    pub fn performance(&self, node_id: &str) -> Result<Option<PerformanceRecord>, PersistenceError> {
        Ok(get_json(&self.backend, &format!("{PERF_PREFIX}{node_id}"))?)
    }

    /// All sessions recorded for a node, oldest first
    pub fn sessions_for(&self, node_id: &str) -> Result<Vec<SessionRecord>, PersistenceError> {
        let mut sessions = Vec::new();
        for (key, value) in self.backend.scan_prefix(SESSION_PREFIX.as_bytes())? {
            let record: SessionRecord = serde_json::from_slice(&value).map_err(|source| {
                crate::store::StorageError::Corrupt {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    source,
                }
            })?;
            if record.node_id == node_id {
                sessions.push(record);
            }
        }
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }
}

fn session_key(session: &SessionId) -> String {
    format!("{SESSION_PREFIX}{}", session.0)
}

#[async_trait]
impl<B: StorageBackend> PersistenceGateway for StoredPersistence<B> {
    async fn create_session(
        &self,
        node_id: &str,
        region: &str,
    ) -> Result<SessionId, PersistenceError> {
        let session_id = SessionId(uuid::Uuid::new_v4().to_string());
        let record = SessionRecord {
            session_id: session_id.clone(),
            node_id: node_id.to_string(),
            region: region.to_string(),
            started_at: crate::now_ms(),
            ended_at: None,
            uptime_ms: 0,
            relays_completed: 0,
        };
        put_json(&self.backend, &session_key(&session_id), &record)?;
        debug!("Opened session {} for {}", session_id, node_id);
        Ok(session_id)
    }

    async fn end_session(
        &self,
        session: &SessionId,
        uptime_ms: u64,
        relays_completed: u64,
    ) -> Result<(), PersistenceError> {
        let key = session_key(session);
        let mut record: SessionRecord = get_json(&self.backend, &key)?
            .ok_or_else(|| PersistenceError::UnknownSession(session.clone()))?;
        record.ended_at = Some(crate::now_ms());
        record.uptime_ms = uptime_ms;
        record.relays_completed = relays_completed;
        put_json(&self.backend, &key, &record)?;
        self.backend.flush()?;
        Ok(())
    }

    async fn upsert_performance(&self, delta: &PerformanceDelta) -> Result<(), PersistenceError> {
        let key = format!("{PERF_PREFIX}{}", delta.node_id);
        let mut record = get_json::<PerformanceRecord>(&self.backend, &key)?.unwrap_or(
            PerformanceRecord {
                node_id: delta.node_id.clone(),
                wallet_address: delta.wallet_address.clone(),
                region: delta.region.clone(),
                total_uptime_ms: 0,
                total_relays: 0,
                flushes: 0,
                updated_at: 0,
            },
        );
        record.wallet_address = delta.wallet_address.clone();
        record.region = delta.region.clone();
        record.total_uptime_ms += delta.uptime_ms;
        record.total_relays += delta.relays;
        record.flushes += 1;
        record.updated_at = crate::now_ms();
        put_json(&self.backend, &key, &record)?;
        self.backend.flush()?;
        Ok(())
    }
}
