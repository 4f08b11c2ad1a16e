//! Node registry: in-memory directory of live nodes

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

use super::ConnId;
use crate::gateway::SessionId;
use crate::protocol::NodeInfo;

/// A node is considered gone once it has been silent this long
pub const NODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Registration data that already passed the access gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub node_id: String,
    pub wallet_address: String,
    pub region: String,
    pub session: Option<SessionId>,
}

/// A registered node
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub wallet_address: String,
    pub region: String,
    /// Connection that owns this entry
    pub conn: ConnId,
    pub connected_at: u64,
    pub last_seen: u64,
    pub relay_count: u64,
    pub reputation: i64,
    /// Peers this node has exchanged handshakes with
    pub peers: HashSet<String>,
    pub session: Option<SessionId>,
}

impl Node {
    pub fn is_alive(&self, now_ms: u64, timeout: Duration) -> bool {
        now_ms.saturating_sub(self.last_seen) < timeout.as_millis() as u64
    }

    pub fn uptime_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.connected_at)
    }

    pub fn info(&self, now_ms: u64) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            wallet_address: self.wallet_address.clone(),
            region: self.region.clone(),
            connected_at: self.connected_at,
            uptime: self.uptime_ms(now_ms),
            relay_count: self.relay_count,
            reputation: self.reputation,
            connection_count: self.peers.len(),
        }
    }
}

/// Aggregate view served on the stats endpoint
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryStats {
    pub total_nodes: usize,
    pub total_relays: u64,
    pub nodes_by_region: BTreeMap<String, usize>,
    pub average_uptime: u64,
}

pub struct NodeRegistry {
    nodes: HashMap<String, Node>,
    by_region: HashMap<String, HashSet<String>>,
    /// Several node ids may share one wallet
    by_wallet: HashMap<String, BTreeSet<String>>,
    timeout: Duration,
}

impl NodeRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            by_region: HashMap::new(),
            by_wallet: HashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create or overwrite the entry for `registration.node_id`.
    ///
    /// Returns the displaced entry when the id was already registered.
    pub fn register(&mut self, registration: Registration, conn: ConnId, now_ms: u64) -> Option<Node> {
        let displaced = self.remove(&registration.node_id);
        if let Some(old) = &displaced {
            if old.conn != conn {
                warn!(
                    "Node {} re-registered from {} (was {}), overwriting",
                    old.id, conn, old.conn
                );
            }
        }

        let node = Node {
            id: registration.node_id.clone(),
            wallet_address: registration.wallet_address.clone(),
            region: registration.region.clone(),
            conn,
            connected_at: now_ms,
            last_seen: now_ms,
            relay_count: 0,
            reputation: 0,
            peers: HashSet::new(),
            session: registration.session,
        };

        self.by_region
            .entry(node.region.clone())
            .or_default()
            .insert(node.id.clone());
        self.by_wallet
            .entry(node.wallet_address.clone())
            .or_default()
            .insert(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        displaced
    }

    /// Refresh `last_seen`. Unknown ids are ignored.
    pub fn touch(&mut self, node_id: &str, now_ms: u64) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.last_seen = now_ms;
                true
            }
            None => {
                debug!("touch for unknown node {}", node_id);
                false
            }
        }
    }

    pub fn remove(&mut self, node_id: &str) -> Option<Node> {
        let node = self.nodes.remove(node_id)?;
        if let Some(ids) = self.by_region.get_mut(&node.region) {
            ids.remove(node_id);
            if ids.is_empty() {
                self.by_region.remove(&node.region);
            }
        }
        if let Some(ids) = self.by_wallet.get_mut(&node.wallet_address) {
            ids.remove(node_id);
            if ids.is_empty() {
                self.by_wallet.remove(&node.wallet_address);
            }
        }
        Some(node)
    }

    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Every node registered under `wallet_address`, ordered by id
    pub fn by_wallet(&self, wallet_address: &str) -> Vec<&Node> {
        self.by_wallet
            .get(wallet_address)
            .map(|ids| ids.iter().filter_map(|id| self.nodes.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn is_alive(&self, node_id: &str, now_ms: u64) -> bool {
        self.nodes
            .get(node_id)
            .map_or(false, |n| n.is_alive(now_ms, self.timeout))
    }

    /// Record a soft, bidirectional handshake relationship
    pub fn link(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        if let Some(node) = self.nodes.get_mut(a) {
            node.peers.insert(b.to_string());
        }
        if let Some(node) = self.nodes.get_mut(b) {
            node.peers.insert(a.to_string());
        }
    }

    /// Count one relay for `node_id`, returning the new total
    pub fn record_relay(&mut self, node_id: &str) -> Option<u64> {
        let node = self.nodes.get_mut(node_id)?;
        node.relay_count += 1;
        Some(node.relay_count)
    }

    /// Live nodes, optionally excluding one id
    pub fn snapshot(&self, exclude: Option<&str>, now_ms: u64) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .nodes
            .values()
            .filter(|n| Some(n.id.as_str()) != exclude)
            .filter(|n| n.is_alive(now_ms, self.timeout))
            .map(|n| n.info(now_ms))
            .collect();
        nodes.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        nodes
    }

    /// Ids of nodes whose silence has reached the timeout
    pub fn stale(&self, now_ms: u64) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .values()
            .filter(|n| !n.is_alive(now_ms, self.timeout))
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Connections of every registered node
    pub fn connections(&self) -> Vec<ConnId> {
        let mut conns: Vec<ConnId> = self.nodes.values().map(|n| n.conn).collect();
        conns.sort();
        conns.dedup();
        conns
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stats(&self, now_ms: u64) -> DirectoryStats {
        let total_nodes = self.nodes.len();
        let total_relays = self.nodes.values().map(|n| n.relay_count).sum();
        let nodes_by_region = self
            .by_region
            .iter()
            .map(|(region, ids)| (region.clone(), ids.len()))
            .collect();
        let average_uptime = if total_nodes == 0 {
            0
        } else {
            self.nodes.values().map(|n| n.uptime_ms(now_ms)).sum::<u64>() / total_nodes as u64
        };

        DirectoryStats {
            total_nodes,
            total_relays,
            nodes_by_region,
            average_uptime,
        }
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(NODE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: &str, wallet: &str, region: &str) -> Registration {
        Registration {
            node_id: id.to_string(),
            wallet_address: wallet.to_string(),
            region: region.to_string(),
            session: None,
        }
    }

    #[test]
    fn test_snapshot_excludes_self() {
        let mut registry = NodeRegistry::default();
        registry.register(registration("n1", "W1", "us-east"), ConnId(1), 1_000);
        registry.register(registration("n2", "W2", "us-east"), ConnId(2), 2_000);

        let snapshot = registry.snapshot(Some("n2"), 2_000);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "n1");
        assert_eq!(registry.snapshot(None, 2_000).len(), 2);
    }

    #[test]
    fn test_liveness_threshold() {
        let mut registry = NodeRegistry::new(Duration::from_secs(60));
        registry.register(registration("n1", "W1", "eu"), ConnId(1), 0);

        assert!(registry.is_alive("n1", 59_999));
        assert!(!registry.is_alive("n1", 60_000));
        assert_eq!(registry.stale(60_000), vec!["n1".to_string()]);

        registry.touch("n1", 50_000);
        assert!(registry.stale(60_000).is_empty());
        assert!(registry.snapshot(None, 200_000).is_empty());
    }

    #[test]
    fn test_touch_unknown_is_ignored() {
        let mut registry = NodeRegistry::default();
        assert!(!registry.touch("ghost", 10));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let mut registry = NodeRegistry::default();
        registry.register(registration("n1", "W1", "eu"), ConnId(1), 0);
        registry.record_relay("n1");

        let displaced = registry
            .register(registration("n1", "W9", "us-west"), ConnId(2), 5)
            .unwrap();
        assert_eq!(displaced.conn, ConnId(1));
        assert_eq!(displaced.relay_count, 1);

        assert_eq!(registry.len(), 1);
        let node = registry.get("n1").unwrap();
        assert_eq!(node.conn, ConnId(2));
        assert_eq!(node.relay_count, 0);
        assert!(registry.by_wallet("W1").is_empty());
        assert_eq!(registry.by_wallet("W9")[0].id, "n1");

        let stats = registry.stats(5);
        assert_eq!(stats.nodes_by_region.get("eu"), None);
        assert_eq!(stats.nodes_by_region.get("us-west"), Some(&1));
    }

    #[test]
    fn test_shared_wallet_survives_one_removal() {
        let mut registry = NodeRegistry::default();
        registry.register(registration("n1", "W", "eu"), ConnId(1), 0);
        registry.register(registration("n2", "W", "eu"), ConnId(2), 0);

        let ids: Vec<&str> = registry.by_wallet("W").iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);

        registry.remove("n2");
        let ids: Vec<&str> = registry.by_wallet("W").iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n1"]);

        registry.remove("n1");
        assert!(registry.by_wallet("W").is_empty());
    }

    #[test]
    fn test_link_is_bidirectional() {
        let mut registry = NodeRegistry::default();
        registry.register(registration("n1", "W1", "eu"), ConnId(1), 0);
        registry.register(registration("n2", "W2", "eu"), ConnId(2), 0);

        registry.link("n1", "n2");
        registry.link("n1", "absent");
        assert!(registry.get("n1").unwrap().peers.contains("n2"));
        assert!(registry.get("n2").unwrap().peers.contains("n1"));
        assert_eq!(registry.get("n2").unwrap().info(0).connection_count, 1);
    }

    #[test]
    fn test_stats() {
        let mut registry = NodeRegistry::default();
        registry.register(registration("n1", "W1", "eu"), ConnId(1), 0);
        registry.register(registration("n2", "W2", "eu"), ConnId(2), 2_000);
        registry.register(registration("n3", "W3", "ap"), ConnId(3), 4_000);
        registry.record_relay("n1");
        registry.record_relay("n1");
        registry.record_relay("n3");

        let stats = registry.stats(4_000);
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.total_relays, 3);
        assert_eq!(stats.nodes_by_region.get("eu"), Some(&2));
        assert_eq!(stats.average_uptime, 2_000);
    }
}
