//! Node identity and value-moving authorization

use serde::{Deserialize, Serialize};

use crate::protocol::NodeCommand;

/// Marker in a node id that designates a bootstrap node
pub const BOOTSTRAP_MARKER: &str = "bootstrap-node";

/// Only bootstrap nodes execute value-moving hops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeClass {
    Bootstrap,
    User,
}

impl NodeClass {
    pub fn from_node_id(node_id: &str) -> Self {
        if node_id.contains(BOOTSTRAP_MARKER) {
            NodeClass::Bootstrap
        } else {
            NodeClass::User
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    pub wallet_address: String,
    pub region: String,
    pub class: NodeClass,
}

impl NodeIdentity {
    /// Identity with the class derived from the node id
    pub fn new(
        node_id: impl Into<String>,
        wallet_address: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            class: NodeClass::from_node_id(&node_id),
            node_id,
            wallet_address: wallet_address.into(),
            region: region.into(),
        }
    }

    pub fn with_class(mut self, class: NodeClass) -> Self {
        self.class = class;
        self
    }

    pub fn may_move_value(&self) -> bool {
        self.class == NodeClass::Bootstrap
    }

    pub fn register_command(&self, token: Option<String>) -> NodeCommand {
        NodeCommand::Register {
            node_id: self.node_id.clone(),
            wallet_address: self.wallet_address.clone(),
            region: Some(self.region.clone()),
            token,
        }
    }
}
