//! Relay job descriptors shared by the directory and the nodes

use serde::{Deserialize, Serialize};

/// A multi-hop value transfer coordinated across a selected node subset.
///
/// `selected_nodes` is ordered: index 0 is the first hop and the last entry
/// hands the value to `recipient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayJob {
    pub request_id: String,
    pub recipient: String,
    /// Amount to move, in ledger base units
    pub amount: u64,
    /// Fee paid to participating hops, in base units
    #[serde(default, alias = "relayFee")]
    pub fee: u64,
    /// Advertised hop count; the selected node list is authoritative
    #[serde(default, alias = "numHops")]
    pub hops: usize,
    pub selected_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl RelayJob {
    /// Number of hops actually selected
    pub fn hop_count(&self) -> usize {
        self.selected_nodes.len()
    }

    /// Position of a wallet in the hop sequence
    pub fn position_of(&self, wallet_address: &str) -> Option<usize> {
        self.selected_nodes.iter().position(|n| n == wallet_address)
    }

    pub fn is_final_hop(&self, index: usize) -> bool {
        index + 1 == self.selected_nodes.len()
    }

    /// Wallet of the hop after `index`, if any
    pub fn next_hop(&self, index: usize) -> Option<&str> {
        self.selected_nodes.get(index + 1).map(String::as_str)
    }
}

/// Lifecycle of one hop's view of a job. `Completed` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayStatus {
    Broadcast,
    Joined,
    Forwarding,
    Completed,
    Failed,
}

impl RelayStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RelayStatus::Completed | RelayStatus::Failed)
    }
}

impl std::fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayStatus::Broadcast => write!(f, "BROADCAST"),
            RelayStatus::Joined => write!(f, "JOINED"),
            RelayStatus::Forwarding => write!(f, "FORWARDING"),
            RelayStatus::Completed => write!(f, "COMPLETED"),
            RelayStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Point-to-point notification from one hop to the next after value moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayHandoff {
    pub job: RelayJob,
    /// Position of the receiving hop
    pub hop_index: usize,
    /// Wallet of the hop that forwarded the value
    pub from_node: String,
    /// Ledger signature of the forwarding transfer
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> RelayJob {
        RelayJob {
            request_id: "42".to_string(),
            recipient: "R".to_string(),
            amount: 1_000,
            fee: 10,
            hops: 3,
            selected_nodes: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            mode: None,
        }
    }

    #[test]
    fn test_hop_positions() {
        let job = job();
        assert_eq!(job.position_of("B"), Some(1));
        assert_eq!(job.position_of("Z"), None);
        assert_eq!(job.next_hop(0), Some("B"));
        assert_eq!(job.next_hop(2), None);
        assert!(job.is_final_hop(2));
        assert!(!job.is_final_hop(1));
    }

    #[test]
    fn test_parse_legacy_field_names() {
        let json = r#"{
            "requestId": "7",
            "recipient": "R",
            "amount": 5,
            "relayFee": 2,
            "numHops": 2,
            "selectedNodes": ["A", "B"],
            "mode": "standard"
        }"#;
        let job: RelayJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.fee, 2);
        assert_eq!(job.hops, 2);
        assert_eq!(job.mode.as_deref(), Some("standard"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(RelayStatus::Completed.is_terminal());
        assert!(RelayStatus::Failed.is_terminal());
        assert!(!RelayStatus::Forwarding.is_terminal());
        assert_eq!(
            serde_json::to_string(&RelayStatus::Forwarding).unwrap(),
            "\"FORWARDING\""
        );
    }
}
