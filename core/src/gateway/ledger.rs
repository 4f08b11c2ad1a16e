//! In-memory ledger
//!
//! Every operation succeeds unless a failure has been injected for its kind,
//! and is recorded in order. Signatures are derived from a counter so runs
//! are reproducible.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use super::{LedgerError, LedgerGateway, Signature};
use crate::protocol::RelayJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    Join,
    Transfer,
    Claim,
}

impl LedgerOp {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerOp::Join => "join",
            LedgerOp::Transfer => "transfer",
            LedgerOp::Claim => "claim",
        }
    }
}

/// One submitted operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub op: LedgerOp,
    pub request_id: String,
    pub destination: Option<String>,
    pub amount: u64,
    pub signature: Signature,
}

#[derive(Default)]
struct LedgerState {
    records: Vec<LedgerRecord>,
    failures: HashMap<LedgerOp, String>,
    tx_counter: u64,
}

pub struct InMemoryLedger {
    signer: String,
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new(signer: impl Into<String>) -> Self {
        Self {
            signer: signer.into(),
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Make every subsequent `op` fail with `reason`
    pub fn fail(&self, op: LedgerOp, reason: impl Into<String>) {
        self.state.lock().failures.insert(op, reason.into());
    }

    pub fn heal(&self, op: LedgerOp) {
        self.state.lock().failures.remove(&op);
    }

    pub fn records(&self) -> Vec<LedgerRecord> {
        self.state.lock().records.clone()
    }

    pub fn count(&self, op: LedgerOp) -> usize {
        self.state.lock().records.iter().filter(|r| r.op == op).count()
    }

    fn submit(
        &self,
        op: LedgerOp,
        job: &RelayJob,
        destination: Option<&str>,
    ) -> Result<Signature, LedgerError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.failures.get(&op) {
            return Err(LedgerError::Rejected {
                op: op.as_str(),
                reason: reason.clone(),
            });
        }

        state.tx_counter += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.signer.as_bytes());
        hasher.update(op.as_str().as_bytes());
        hasher.update(job.request_id.as_bytes());
        hasher.update(&state.tx_counter.to_le_bytes());
        let signature = bs58::encode(hasher.finalize().as_bytes()).into_string();

        debug!(
            "ledger {} for {} -> {}",
            op.as_str(),
            job.request_id,
            signature
        );

        state.records.push(LedgerRecord {
            op,
            request_id: job.request_id.clone(),
            destination: destination.map(str::to_string),
            amount: if op == LedgerOp::Transfer { job.amount } else { 0 },
            signature: signature.clone(),
        });
        Ok(signature)
    }
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    async fn submit_join(&self, job: &RelayJob) -> Result<Signature, LedgerError> {
        self.submit(LedgerOp::Join, job, None)
    }

    async fn submit_transfer(
        &self,
        job: &RelayJob,
        destination: &str,
    ) -> Result<Signature, LedgerError> {
        self.submit(LedgerOp::Transfer, job, Some(destination))
    }

    async fn submit_claim(&self, job: &RelayJob) -> Result<Signature, LedgerError> {
        self.submit(LedgerOp::Claim, job, None)
    }
}
