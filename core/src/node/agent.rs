//! Node agent: reacts to directory events independently of the transport

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::chunks::ChunkStore;
use super::executor::{HopOutcome, RelayExecutor, RelayTiming};
use super::identity::NodeIdentity;
use crate::gateway::LedgerGateway;
use crate::protocol::{DirectoryEvent, NodeCommand};
use crate::store::StorageBackend;

pub struct NodeAgent {
    executor: RelayExecutor,
    chunks: ChunkStore<Arc<dyn StorageBackend>>,
    outbound: mpsc::UnboundedSender<NodeCommand>,
}

impl NodeAgent {
    /// Build an agent and the queue of commands it wants sent to the directory
    pub fn new(
        identity: NodeIdentity,
        ledger: Arc<dyn LedgerGateway>,
        storage: Arc<dyn StorageBackend>,
        timing: RelayTiming,
    ) -> (Self, mpsc::UnboundedReceiver<NodeCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let chunks = ChunkStore::new(storage, identity.node_id.clone());
        let executor = RelayExecutor::new(identity, ledger, tx.clone(), timing);
        (
            Self {
                executor,
                chunks,
                outbound: tx,
            },
            rx,
        )
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.executor.identity()
    }

    pub fn executor(&self) -> &RelayExecutor {
        &self.executor
    }

    /// Queue a command for the directory
    pub fn send(&self, command: NodeCommand) {
        if self.outbound.send(command).is_err() {
            debug!("Agent outbound queue closed");
        }
    }

    /// Handle one event. Relay work runs on its own task, whose handle is
    /// returned.
    pub fn handle_event(&self, event: DirectoryEvent) -> Option<JoinHandle<HopOutcome>> {
        match event {
            DirectoryEvent::RelayRequest(job) => {
                let executor = self.executor.clone();
                Some(tokio::spawn(async move { executor.handle_request(job).await }))
            }
            DirectoryEvent::RelayForward { data } => {
                let executor = self.executor.clone();
                Some(tokio::spawn(async move { executor.handle_forward(data).await }))
            }
            DirectoryEvent::StoreChunk(request) => {
                let reply = self.chunks.handle_store(request);
                self.send(NodeCommand::ChunkStored(reply));
                None
            }
            DirectoryEvent::RequestChunk(request) => {
                let reply = self.chunks.handle_request(request);
                self.send(NodeCommand::ChunkData(reply));
                None
            }
            DirectoryEvent::Registered { node_id, nodes } => {
                info!("Registered as {} ({} peer(s) online)", node_id, nodes.len());
                None
            }
            DirectoryEvent::NodeList { total_nodes, .. } => {
                debug!("Network has {} node(s)", total_nodes);
                None
            }
            DirectoryEvent::RelayCompleted(completion) => {
                info!(
                    "Relay {} completed by {}",
                    completion.request_id, completion.node_id
                );
                None
            }
            DirectoryEvent::RelayStats {
                node_id,
                relay_count,
            } => {
                debug!("{} has relayed {} time(s)", node_id, relay_count);
                None
            }
            other => {
                debug!("Ignoring {:?}", other);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryLedger;
    use crate::protocol::{RelayJob, RequestChunk, StoreChunk};
    use crate::store::MemoryStorage;

    fn agent(node_id: &str, wallet: &str) -> (NodeAgent, mpsc::UnboundedReceiver<NodeCommand>) {
        NodeAgent::new(
            NodeIdentity::new(node_id, wallet, "eu"),
            Arc::new(InMemoryLedger::new(wallet)),
            Arc::new(MemoryStorage::new()),
            RelayTiming::default(),
        )
    }

    #[tokio::test]
    async fn test_chunk_requests_are_answered() {
        let (agent, mut rx) = agent("holder", "H");

        let stored = agent.handle_event(DirectoryEvent::StoreChunk(StoreChunk {
            target_node_id: "holder".to_string(),
            from: Some("owner".to_string()),
            file_id: "f".to_string(),
            chunk_id: "1".to_string(),
            data: "aGk=".to_string(),
        }));
        assert!(stored.is_none());
        match rx.recv().await {
            Some(NodeCommand::ChunkStored(reply)) => {
                assert!(reply.success);
                assert_eq!(reply.to, "owner");
            }
            other => panic!("unexpected {:?}", other),
        }

        agent.handle_event(DirectoryEvent::RequestChunk(RequestChunk {
            target_node_id: "holder".to_string(),
            from: Some("owner".to_string()),
            file_id: "f".to_string(),
            chunk_id: "1".to_string(),
            request_id: None,
        }));
        match rx.recv().await {
            Some(NodeCommand::ChunkData(reply)) => assert_eq!(reply.data.as_deref(), Some("aGk=")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_request_runs_on_task() {
        let (agent, _rx) = agent("bootstrap-node-1", "A");
        let job = RelayJob {
            request_id: "r1".to_string(),
            recipient: "R".to_string(),
            amount: 5,
            fee: 0,
            hops: 1,
            selected_nodes: vec!["A".to_string()],
            mode: None,
        };

        let task = agent.handle_event(DirectoryEvent::RelayRequest(job)).unwrap();
        assert!(matches!(task.await.unwrap(), HopOutcome::Completed { .. }));
    }
}
