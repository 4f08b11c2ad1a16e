//! Relay broadcaster: delivers jobs to the selected nodes that are online

use std::collections::HashSet;
use tracing::{debug, info};

use super::effect::{Delivery, Effect};
use super::registry::NodeRegistry;
use super::router::{SignalingRouter, Target};
use super::ConnId;
use crate::protocol::{DirectoryEvent, RelayJob};

pub struct RelayBroadcaster;

impl RelayBroadcaster {
    /// Send the full job to every live node named in `selected_nodes`.
    ///
    /// A wallet held by several live nodes reaches each of them. Wallets
    /// that are offline are skipped; the submitter is never told.
    pub fn fan_out(job: &RelayJob, registry: &NodeRegistry, now_ms: u64) -> Vec<Effect> {
        let mut seen = HashSet::new();
        let mut effects = Vec::new();

        for wallet in &job.selected_nodes {
            if !seen.insert(wallet.as_str()) {
                continue;
            }
            effects.extend(SignalingRouter::deliver(
                registry,
                Target::Wallet(wallet),
                "relay_request",
                DirectoryEvent::RelayRequest(job.clone()),
                now_ms,
            ));
        }

        let delivered = effects
            .iter()
            .filter(|e| matches!(e, Effect::Report(d) if d.is_delivered()))
            .count();
        info!(
            "Relay {} broadcast to {}/{} selected node(s)",
            job.request_id,
            delivered,
            seen.len()
        );
        effects
    }

    /// Send one event to every listed connection
    pub fn broadcast_all<I>(event: &DirectoryEvent, conns: I) -> Vec<Effect>
    where
        I: IntoIterator<Item = ConnId>,
    {
        let effects: Vec<Effect> = conns
            .into_iter()
            .map(|conn| Effect::Send {
                conn,
                event: event.clone(),
            })
            .collect();
        debug!("Broadcasting to {} connection(s)", effects.len());
        effects
    }

    /// One `node-list` to every registered node. `totalNodes` counts stale
    /// entries not yet swept.
    pub fn node_list(registry: &NodeRegistry, now_ms: u64) -> Vec<Effect> {
        let nodes = registry.snapshot(None, now_ms);
        let event = DirectoryEvent::NodeList {
            nodes,
            total_nodes: registry.len(),
        };
        Self::broadcast_all(&event, registry.connections())
    }

    /// Deliveries recorded in a batch of effects
    pub fn reports(effects: &[Effect]) -> impl Iterator<Item = &Delivery> {
        effects.iter().filter_map(|e| match e {
            Effect::Report(d) => Some(d),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::effect::sent_to;
    use crate::directory::registry::Registration;

    fn job(selected: &[&str]) -> RelayJob {
        RelayJob {
            request_id: "r1".to_string(),
            recipient: "R".to_string(),
            amount: 100,
            fee: 1,
            hops: selected.len(),
            selected_nodes: selected.iter().map(|s| s.to_string()).collect(),
            mode: None,
        }
    }

    fn register(registry: &mut NodeRegistry, id: &str, wallet: &str, conn: u64) {
        registry.register(
            Registration {
                node_id: id.to_string(),
                wallet_address: wallet.to_string(),
                region: "eu".to_string(),
                session: None,
            },
            ConnId(conn),
            0,
        );
    }

    #[test]
    fn test_only_connected_selected_nodes_receive() {
        let mut registry = NodeRegistry::default();
        register(&mut registry, "a", "A", 1);
        register(&mut registry, "c", "C", 3);

        let effects = RelayBroadcaster::fan_out(&job(&["A", "B"]), &registry, 10);

        assert_eq!(
            sent_to(&effects, ConnId(1)),
            vec![&DirectoryEvent::RelayRequest(job(&["A", "B"]))]
        );
        assert!(sent_to(&effects, ConnId(3)).is_empty());
        let delivered: Vec<bool> = RelayBroadcaster::reports(&effects)
            .map(Delivery::is_delivered)
            .collect();
        assert_eq!(delivered, vec![true, false]);
    }

    #[test]
    fn test_duplicate_wallets_receive_once() {
        let mut registry = NodeRegistry::default();
        register(&mut registry, "a", "A", 1);

        let effects = RelayBroadcaster::fan_out(&job(&["A", "A"]), &registry, 10);
        assert_eq!(sent_to(&effects, ConnId(1)).len(), 1);
    }

    #[test]
    fn test_shared_wallet_still_reached_after_one_holder_leaves() {
        let mut registry = NodeRegistry::default();
        register(&mut registry, "n1", "W", 1);
        register(&mut registry, "n2", "W", 2);

        let effects = RelayBroadcaster::fan_out(&job(&["W"]), &registry, 10);
        assert_eq!(sent_to(&effects, ConnId(1)).len(), 1);
        assert_eq!(sent_to(&effects, ConnId(2)).len(), 1);

        registry.remove("n2");
        assert!(registry.is_alive("n1", 10));

        let effects = RelayBroadcaster::fan_out(&job(&["W"]), &registry, 10);
        assert_eq!(
            sent_to(&effects, ConnId(1)),
            vec![&DirectoryEvent::RelayRequest(job(&["W"]))]
        );
        assert!(sent_to(&effects, ConnId(2)).is_empty());
    }

    #[test]
    fn test_node_list_reaches_every_node() {
        let mut registry = NodeRegistry::default();
        register(&mut registry, "a", "A", 1);
        register(&mut registry, "b", "B", 2);

        let effects = RelayBroadcaster::node_list(&registry, 10);
        for conn in [ConnId(1), ConnId(2)] {
            match sent_to(&effects, conn).as_slice() {
                [DirectoryEvent::NodeList { nodes, total_nodes }] => {
                    assert_eq!(*total_nodes, 2);
                    assert_eq!(nodes.len(), 2);
                }
                other => panic!("unexpected events {:?}", other),
            }
        }
    }

    #[test]
    fn test_broadcast_all() {
        let effects =
            RelayBroadcaster::broadcast_all(&DirectoryEvent::PeerLeft, [ConnId(1), ConnId(2)]);
        assert_eq!(effects.len(), 2);
    }
}
