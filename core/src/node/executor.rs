//! Relay executor: drives this node's hop of each relay job
//!
//! ```text
//! RECEIVED → JOIN_CHAIN → WAIT_PROPAGATION → TRANSFER → FORWARD_NEXT | COMPLETE → CLAIM
//! ```
//!
//! Only a failed transfer fails a job. Join and claim failures are recorded
//! on the tracked job and logged; the hop carries on.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::identity::NodeIdentity;
use crate::gateway::{LedgerGateway, Signature};
use crate::protocol::{NodeCommand, RelayCompletion, RelayHandoff, RelayJob, RelayStatus};

/// Suspension points of a hop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTiming {
    /// Wait before the first hop transfers, so sibling joins settle
    pub first_hop_delay: Duration,
    /// Wait before a forwarded hop transfers
    pub forward_delay: Duration,
    /// Wait between the transfer and the fee claim
    pub claim_delay: Duration,
}

impl Default for RelayTiming {
    fn default() -> Self {
        Self {
            first_hop_delay: Duration::from_secs(3),
            forward_delay: Duration::from_secs(2),
            claim_delay: Duration::from_secs(5),
        }
    }
}

/// This node's view of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedJob {
    pub job: RelayJob,
    /// This node's position in `selected_nodes`
    pub hop_index: usize,
    pub status: RelayStatus,
    /// Why the transfer failed
    pub error: Option<String>,
    pub join_error: Option<String>,
    /// Transfer signature of the previous hop, for forwarded hops
    pub inbound_signature: Option<Signature>,
    pub transfer_signature: Option<Signature>,
    pub claim_signature: Option<Signature>,
    pub claim_error: Option<String>,
    pub received_at: u64,
    hop_started: bool,
}

impl TrackedJob {
    fn new(job: RelayJob, hop_index: usize) -> Self {
        Self {
            job,
            hop_index,
            status: RelayStatus::Broadcast,
            error: None,
            join_error: None,
            inbound_signature: None,
            transfer_signature: None,
            claim_signature: None,
            claim_error: None,
            received_at: crate::now_ms(),
            hop_started: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// This node may not move value
    Unauthorized,
    NotSelected,
    /// Already tracking the job, or its hop already ran
    Duplicate,
    /// The forward names a different hop position
    WrongHop,
    /// The job already completed or failed
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopOutcome {
    Ignored(IgnoreReason),
    /// Joined; the transfer waits for the previous hop's forward
    AwaitingForward,
    Completed { signature: Signature },
    Forwarded { signature: Signature },
    Failed { error: String },
}

struct Inner {
    identity: NodeIdentity,
    ledger: Arc<dyn LedgerGateway>,
    outbound: mpsc::UnboundedSender<NodeCommand>,
    jobs: Mutex<HashMap<String, TrackedJob>>,
    timing: RelayTiming,
}

#[derive(Clone)]
pub struct RelayExecutor {
    inner: Arc<Inner>,
}

impl RelayExecutor {
    pub fn new(
        identity: NodeIdentity,
        ledger: Arc<dyn LedgerGateway>,
        outbound: mpsc::UnboundedSender<NodeCommand>,
        timing: RelayTiming,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                ledger,
                outbound,
                jobs: Mutex::new(HashMap::new()),
                timing,
            }),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    pub fn job_status(&self, request_id: &str) -> Option<RelayStatus> {
        self.inner.jobs.lock().get(request_id).map(|t| t.status)
    }

    pub fn job(&self, request_id: &str) -> Option<TrackedJob> {
        self.inner.jobs.lock().get(request_id).cloned()
    }

    /// Every tracked job, oldest first
    pub fn jobs(&self) -> Vec<TrackedJob> {
        let mut jobs: Vec<TrackedJob> = self.inner.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.job.request_id.cmp(&b.job.request_id))
        });
        jobs
    }

    /// A `relay_request` arrived.
    ///
    /// The first hop runs its transfer after the propagation delay; later
    /// hops stop in JOINED until their forward arrives.
    pub async fn handle_request(&self, job: RelayJob) -> HopOutcome {
        let identity = &self.inner.identity;
        if !identity.may_move_value() {
            info!(
                "Relay {} ignored: {} is not a bootstrap node",
                job.request_id, identity.node_id
            );
            return HopOutcome::Ignored(IgnoreReason::Unauthorized);
        }
        let Some(hop_index) = job.position_of(&identity.wallet_address) else {
            debug!("Relay {} does not select this node", job.request_id);
            return HopOutcome::Ignored(IgnoreReason::NotSelected);
        };

        let request_id = job.request_id.clone();
        {
            let mut jobs = self.inner.jobs.lock();
            if jobs.contains_key(&request_id) {
                return HopOutcome::Ignored(IgnoreReason::Duplicate);
            }
            let mut tracked = TrackedJob::new(job.clone(), hop_index);
            tracked.hop_started = hop_index == 0;
            jobs.insert(request_id.clone(), tracked);
        }
        info!(
            "Selected for relay {} as hop {}/{}",
            request_id,
            hop_index + 1,
            job.hop_count()
        );

        self.join_chain(&job).await;

        if hop_index > 0 {
            return HopOutcome::AwaitingForward;
        }
        tokio::time::sleep(self.inner.timing.first_hop_delay).await;
        self.execute_hop(&request_id).await
    }

    /// A `relay_forward` from the previous hop arrived.
    ///
    /// Unknown jobs are adopted from the context the forward carries.
    pub async fn handle_forward(&self, handoff: RelayHandoff) -> HopOutcome {
        let identity = &self.inner.identity;
        let request_id = handoff.job.request_id.clone();
        if !identity.may_move_value() {
            info!(
                "Forward for {} ignored: {} is not a bootstrap node",
                request_id, identity.node_id
            );
            return HopOutcome::Ignored(IgnoreReason::Unauthorized);
        }
        if handoff.job.position_of(&identity.wallet_address) != Some(handoff.hop_index) {
            warn!(
                "Forward for {} names hop {}, which is not this node",
                request_id, handoff.hop_index
            );
            return HopOutcome::Ignored(IgnoreReason::WrongHop);
        }

        let adopted = {
            let mut jobs = self.inner.jobs.lock();
            match jobs.get_mut(&request_id) {
                Some(tracked) if tracked.status.is_terminal() => {
                    return HopOutcome::Ignored(IgnoreReason::Terminal);
                }
                Some(tracked) if tracked.hop_started => {
                    return HopOutcome::Ignored(IgnoreReason::Duplicate);
                }
                Some(tracked) => {
                    tracked.hop_started = true;
                    tracked.inbound_signature = Some(handoff.signature.clone());
                    false
                }
                None => {
                    let mut tracked = TrackedJob::new(handoff.job.clone(), handoff.hop_index);
                    tracked.hop_started = true;
                    tracked.inbound_signature = Some(handoff.signature.clone());
                    jobs.insert(request_id.clone(), tracked);
                    true
                }
            }
        };
        info!(
            "Relay {} forwarded by {} ({})",
            request_id, handoff.from_node, handoff.signature
        );

        if adopted {
            self.join_chain(&handoff.job).await;
        }
        tokio::time::sleep(self.inner.timing.forward_delay).await;
        self.execute_hop(&request_id).await
    }

    /// Acknowledge and join on the ledger. Failure is non-fatal.
    async fn join_chain(&self, job: &RelayJob) {
        let identity = &self.inner.identity;
        self.send(NodeCommand::NodeJoinedRelay {
            node_id: identity.node_id.clone(),
            request_id: job.request_id.clone(),
            wallet_address: identity.wallet_address.clone(),
        });

        let join = self.inner.ledger.submit_join(job).await;
        self.update(&job.request_id, |tracked| {
            if let Err(e) = &join {
                warn!("Join for relay {} failed, continuing: {}", job.request_id, e);
                tracked.join_error = Some(e.to_string());
            }
            if tracked.status == RelayStatus::Broadcast {
                tracked.status = RelayStatus::Joined;
            }
        });
    }

    async fn execute_hop(&self, request_id: &str) -> HopOutcome {
        let snapshot = {
            let jobs = self.inner.jobs.lock();
            jobs.get(request_id).map(|t| (t.job.clone(), t.hop_index))
        };
        let Some((job, hop_index)) = snapshot else {
            return HopOutcome::Ignored(IgnoreReason::NotSelected);
        };

        let is_final = job.is_final_hop(hop_index);
        let next_hop = job.next_hop(hop_index).map(str::to_string);
        let destination = match (&next_hop, is_final) {
            (Some(next), false) => next.clone(),
            _ => job.recipient.clone(),
        };

        let signature = match self.inner.ledger.submit_transfer(&job, &destination).await {
            Ok(signature) => signature,
            Err(e) => {
                error!("Relay {} transfer failed: {}", request_id, e);
                let error = e.to_string();
                self.update(request_id, |tracked| {
                    tracked.status = RelayStatus::Failed;
                    tracked.error = Some(error.clone());
                });
                return HopOutcome::Failed { error };
            }
        };

        let outcome = match next_hop {
            Some(next) if !is_final => {
                self.update(request_id, |tracked| {
                    tracked.status = RelayStatus::Forwarding;
                    tracked.transfer_signature = Some(signature.clone());
                });
                info!("Relay {} forwarded to {}", request_id, next);
                self.send(NodeCommand::RelayForward {
                    to: next,
                    data: RelayHandoff {
                        job: job.clone(),
                        hop_index: hop_index + 1,
                        from_node: self.inner.identity.wallet_address.clone(),
                        signature: signature.clone(),
                    },
                });
                HopOutcome::Forwarded { signature }
            }
            _ => {
                self.update(request_id, |tracked| {
                    tracked.status = RelayStatus::Completed;
                    tracked.transfer_signature = Some(signature.clone());
                });
                info!("Relay {} completed, recipient paid", request_id);
                self.send(NodeCommand::RelayCompleted(RelayCompletion {
                    request_id: request_id.to_string(),
                    node_id: self.inner.identity.node_id.clone(),
                    signature: signature.clone(),
                }));
                HopOutcome::Completed { signature }
            }
        };

        tokio::time::sleep(self.inner.timing.claim_delay).await;
        let claim = self.inner.ledger.submit_claim(&job).await;
        self.update(request_id, |tracked| match claim {
            Ok(signature) => {
                info!("Relay {} fee claimed", request_id);
                tracked.claim_signature = Some(signature);
            }
            Err(e) => {
                warn!("Relay {} claim failed: {}", request_id, e);
                tracked.claim_error = Some(e.to_string());
            }
        });

        outcome
    }

    fn update<F>(&self, request_id: &str, f: F)
    where
        F: FnOnce(&mut TrackedJob),
    {
        if let Some(tracked) = self.inner.jobs.lock().get_mut(request_id) {
            f(tracked);
        }
    }

    fn send(&self, command: NodeCommand) {
        if self.inner.outbound.send(command).is_err() {
            warn!("Outbound channel closed, dropping message");
        }
    }
}
