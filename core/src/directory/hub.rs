//! Directory hub, the single event loop that owns [`DirectoryState`]
//!
//! Connection tasks talk to the hub through a cloneable [`HubHandle`]. The
//! access check and session creation run in the connection task; the
//! resulting registration is then applied by the loop in one step.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::effect::{Delivery, Effect, SessionFlush};
use super::registry::{DirectoryStats, Registration};
use super::rooms::CallSummary;
use super::state::{DirectoryInput, DirectoryState};
use super::sweeper::LivenessSweeper;
use super::ConnId;
use crate::gateway::{AccessGate, PersistenceGateway};
use crate::protocol::{decode_command, DirectoryEvent, NodeCommand, NodeInfo};

/// WebSocket close code for a rejected access token
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

const DEFAULT_REGION: &str = "unknown";

/// What the hub hands a connection task to write on its socket
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(DirectoryEvent),
    Close { code: u16, reason: String },
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Directory hub has shut down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub sweeper: LivenessSweeper,
    /// Region recorded for nodes that do not send one
    pub default_region: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            sweeper: LivenessSweeper::default(),
            default_region: DEFAULT_REGION.to_string(),
        }
    }
}

/// Summary served on the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubHealth {
    pub connections: usize,
    pub nodes: usize,
    pub active_calls: usize,
}

/// A newly attached connection
pub struct Connection {
    pub id: ConnId,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

enum HubRequest {
    Attach {
        conn: ConnId,
        tx: mpsc::UnboundedSender<Outbound>,
    },
    Input(DirectoryInput),
    Nodes(oneshot::Sender<Vec<NodeInfo>>),
    Stats(oneshot::Sender<DirectoryStats>),
    Calls(oneshot::Sender<Vec<CallSummary>>),
    Health(oneshot::Sender<HubHealth>),
    Shutdown,
}

/// Unix milliseconds driven by the tokio clock
#[derive(Debug, Clone, Copy)]
struct Clock {
    start: Instant,
    base_ms: u64,
}

impl Clock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            base_ms: crate::now_ms(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.base_ms + self.start.elapsed().as_millis() as u64
    }
}

pub struct Hub {
    state: DirectoryState,
    sweeper: LivenessSweeper,
    conns: HashMap<ConnId, mpsc::UnboundedSender<Outbound>>,
    requests: mpsc::UnboundedReceiver<HubRequest>,
    persistence: Arc<dyn PersistenceGateway>,
    observer: Option<mpsc::UnboundedSender<Delivery>>,
    clock: Clock,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        access: Arc<dyn AccessGate>,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            state: DirectoryState::new(config.sweeper),
            sweeper: config.sweeper,
            conns: HashMap::new(),
            requests: rx,
            persistence: persistence.clone(),
            observer: None,
            clock: Clock::new(),
        };
        let handle = HubHandle {
            requests: tx,
            next_conn: Arc::new(AtomicU64::new(1)),
            access,
            persistence,
            default_region: config.default_region,
        };
        (hub, handle)
    }

    /// Receive a delivery report for every routed message
    pub fn observe(&mut self) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observer = Some(tx);
        rx
    }

    /// Spawn the loop on the current runtime
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(
            "Directory hub started (sweep every {:?}, timeout {:?})",
            self.sweeper.interval, self.sweeper.timeout
        );
        let mut ticker = self.sweeper.ticker();

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(HubRequest::Shutdown) | None => break,
                    Some(request) => self.handle(request),
                },
                _ = ticker.tick() => {
                    let now = self.clock.now_ms();
                    let effects = self.state.apply(DirectoryInput::Sweep, now);
                    self.execute(effects);
                }
            }
        }

        for (conn, tx) in self.conns.drain() {
            let _ = tx.send(Outbound::Close {
                code: 1001,
                reason: "server shutting down".to_string(),
            });
            debug!("Released {}", conn);
        }
        info!("Directory hub stopped");
    }

    fn handle(&mut self, request: HubRequest) {
        let now = self.clock.now_ms();
        match request {
            HubRequest::Attach { conn, tx } => {
                debug!("{} attached", conn);
                self.conns.insert(conn, tx);
                let effects = self.state.apply(DirectoryInput::Opened(conn), now);
                self.execute(effects);
            }
            HubRequest::Input(input) => {
                let closed = match &input {
                    DirectoryInput::Closed(conn) => Some(*conn),
                    _ => None,
                };
                let effects = self.state.apply(input, now);
                self.execute(effects);
                if let Some(conn) = closed {
                    self.conns.remove(&conn);
                    debug!("{} detached", conn);
                }
            }
            HubRequest::Nodes(reply) => {
                let _ = reply.send(self.state.nodes(now));
            }
            HubRequest::Stats(reply) => {
                let _ = reply.send(self.state.stats(now));
            }
            HubRequest::Calls(reply) => {
                let _ = reply.send(self.state.calls());
            }
            HubRequest::Health(reply) => {
                let _ = reply.send(HubHealth {
                    connections: self.state.connection_count(),
                    nodes: self.state.registry().len(),
                    active_calls: self.state.rooms().len(),
                });
            }
            HubRequest::Shutdown => {}
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { conn, event } => self.send(conn, Outbound::Event(event)),
                Effect::Close { conn, code, reason } => {
                    self.send(conn, Outbound::Close { code, reason })
                }
                Effect::Flush(flush) => self.flush(flush),
                Effect::Report(delivery) => {
                    if let Some(observer) = &self.observer {
                        if observer.send(delivery).is_err() {
                            self.observer = None;
                        }
                    }
                }
            }
        }
    }

    fn send(&self, conn: ConnId, message: Outbound) {
        match self.conns.get(&conn) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!("{} outbound queue closed", conn);
                }
            }
            None => debug!("No outbound queue for {}", conn),
        }
    }

    fn flush(&self, flush: SessionFlush) {
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            if let Some(session) = &flush.session {
                if let Err(e) = persistence
                    .end_session(session, flush.uptime_ms, flush.relays)
                    .await
                {
                    warn!("Failed to end session {}: {}", session, e);
                }
            }
            if let Err(e) = persistence.upsert_performance(&flush.performance()).await {
                warn!("Failed to record performance for {}: {}", flush.node_id, e);
            }
        });
    }
}

/// Cloneable front of the hub
#[derive(Clone)]
pub struct HubHandle {
    requests: mpsc::UnboundedSender<HubRequest>,
    next_conn: Arc<AtomicU64>,
    access: Arc<dyn AccessGate>,
    persistence: Arc<dyn PersistenceGateway>,
    default_region: String,
}

impl HubHandle {
    fn request(&self, request: HubRequest) -> Result<(), HubError> {
        self.requests.send(request).map_err(|_| HubError::Closed)
    }

    /// Attach a new connection
    pub fn connect(&self) -> Result<Connection, HubError> {
        let id = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.request(HubRequest::Attach { conn: id, tx })?;
        Ok(Connection { id, outbound: rx })
    }

    /// Handle one text frame from `conn`.
    ///
    /// Frames that fail to decode are logged and dropped; the connection
    /// stays open.
    pub async fn submit(&self, conn: ConnId, text: &str) -> Result<(), HubError> {
        let command = match decode_command(text) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring frame from {}: {}", conn, e);
                return Ok(());
            }
        };
        self.submit_command(conn, command).await
    }

    pub async fn submit_command(&self, conn: ConnId, command: NodeCommand) -> Result<(), HubError> {
        let input = match command {
            NodeCommand::Register {
                node_id,
                wallet_address,
                region,
                token,
            } => {
                self.gate_registration(conn, node_id, wallet_address, region, token)
                    .await
            }
            command => DirectoryInput::Command { conn, command },
        };
        self.request(HubRequest::Input(input))
    }

    async fn gate_registration(
        &self,
        conn: ConnId,
        node_id: String,
        wallet_address: String,
        region: Option<String>,
        token: Option<String>,
    ) -> DirectoryInput {
        if !self.access.validate(token.as_deref().unwrap_or_default()).await {
            return DirectoryInput::Rejected {
                conn,
                reason: "Invalid access token".to_string(),
            };
        }

        let region = region
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.default_region.clone());
        let session = match self.persistence.create_session(&node_id, &region).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to open session for {}: {}", node_id, e);
                None
            }
        };

        DirectoryInput::Registered {
            conn,
            registration: Registration {
                node_id,
                wallet_address,
                region,
                session,
            },
        }
    }

    /// Report that `conn`'s socket closed
    pub fn disconnect(&self, conn: ConnId) -> Result<(), HubError> {
        self.request(HubRequest::Input(DirectoryInput::Closed(conn)))
    }

    pub async fn nodes(&self) -> Result<Vec<NodeInfo>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.request(HubRequest::Nodes(tx))?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn stats(&self) -> Result<DirectoryStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.request(HubRequest::Stats(tx))?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn calls(&self) -> Result<Vec<CallSummary>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.request(HubRequest::Calls(tx))?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn health(&self) -> Result<HubHealth, HubError> {
        let (tx, rx) = oneshot::channel();
        self.request(HubRequest::Health(tx))?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub fn shutdown(&self) -> Result<(), HubError> {
        self.request(HubRequest::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AllowAll, MockAccessGate, NoopPersistence, StoredPersistence};
    use crate::store::MemoryStorage;
    use std::time::Duration;

    fn register_frame(id: &str, wallet: &str, token: &str) -> String {
        format!(
            r#"{{"type":"register","nodeId":"{}","walletAddress":"{}","region":"eu","token":"{}"}}"#,
            id, wallet, token
        )
    }

    async fn next_event(conn: &mut Connection) -> DirectoryEvent {
        match conn.outbound.recv().await {
            Some(Outbound::Event(event)) => event,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_token_closes_with_policy_violation() {
        let mut gate = MockAccessGate::new();
        gate.expect_validate().returning(|token| token == "good");

        let (hub, handle) = Hub::new(
            HubConfig::default(),
            Arc::new(gate),
            Arc::new(NoopPersistence),
        );
        hub.spawn();

        let mut conn = handle.connect().unwrap();
        handle
            .submit(conn.id, &register_frame("n1", "W1", "bad"))
            .await
            .unwrap();

        assert_eq!(
            conn.outbound.recv().await,
            Some(Outbound::Close {
                code: CLOSE_POLICY_VIOLATION,
                reason: "Invalid access token".to_string()
            })
        );
        assert!(handle.nodes().await.unwrap().is_empty());

        let mut conn = handle.connect().unwrap();
        handle
            .submit(conn.id, &register_frame("n1", "W1", "good"))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut conn).await,
            DirectoryEvent::Registered { .. }
        ));
        assert_eq!(handle.nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let (hub, handle) = Hub::new(
            HubConfig::default(),
            Arc::new(AllowAll),
            Arc::new(NoopPersistence),
        );
        hub.spawn();

        let mut conn = handle.connect().unwrap();
        handle.submit(conn.id, "{not json").await.unwrap();
        handle.submit(conn.id, r#"{"type":"teleport"}"#).await.unwrap();
        handle
            .submit(conn.id, r#"{"type":"join","callId":"c1"}"#)
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut conn).await,
            DirectoryEvent::Joined {
                role: crate::protocol::RoomRole::Initiator
            }
        );
        assert_eq!(handle.health().await.unwrap().active_calls, 1);
    }

    #[tokio::test]
    async fn test_observer_sees_dropped_handshake() {
        let (mut hub, handle) = Hub::new(
            HubConfig::default(),
            Arc::new(AllowAll),
            Arc::new(NoopPersistence),
        );
        let mut reports = hub.observe();
        hub.spawn();

        let mut conn = handle.connect().unwrap();
        handle
            .submit(conn.id, &register_frame("n1", "W1", ""))
            .await
            .unwrap();
        next_event(&mut conn).await;
        handle
            .submit(conn.id, r#"{"type":"offer","to":"ghost","offer":{"sdp":"x"}}"#)
            .await
            .unwrap();

        assert_eq!(
            reports.recv().await,
            Some(Delivery::Dropped {
                kind: "offer",
                target: "ghost".to_string(),
                reason: crate::directory::DropReason::UnknownNode,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_and_flushes_session() {
        let storage = MemoryStorage::new();
        let persistence = Arc::new(StoredPersistence::new(storage.clone()));
        let config = HubConfig {
            sweeper: LivenessSweeper::new(Duration::from_secs(30), Duration::from_secs(60)),
            ..HubConfig::default()
        };
        let (hub, handle) = Hub::new(config, Arc::new(AllowAll), persistence.clone());
        hub.spawn();

        let mut silent = handle.connect().unwrap();
        handle
            .submit(silent.id, &register_frame("n1", "W1", ""))
            .await
            .unwrap();
        next_event(&mut silent).await;
        assert_eq!(handle.nodes().await.unwrap().len(), 1);

        // 60s of silence reaches the timeout on the second tick
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(handle.stats().await.unwrap().total_nodes, 0);

        let sessions = persistence.sessions_for("n1").unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (hub, handle) = Hub::new(
            HubConfig::default(),
            Arc::new(AllowAll),
            Arc::new(NoopPersistence),
        );
        let task = hub.spawn();
        let mut conn = handle.connect().unwrap();

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(matches!(
            conn.outbound.recv().await,
            Some(Outbound::Close { code: 1001, .. })
        ));
        assert!(handle.stats().await.is_err());
    }
}
