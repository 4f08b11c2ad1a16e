//! Liveness sweeper: periodic eviction of silent nodes

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::info;

use super::broadcast::RelayBroadcaster;
use super::effect::{Effect, SessionFlush};
use super::registry::{NodeRegistry, NODE_TIMEOUT};

/// Time between sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest interval the ticker accepts
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct LivenessSweeper {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for LivenessSweeper {
    fn default() -> Self {
        Self {
            interval: SWEEP_INTERVAL,
            timeout: NODE_TIMEOUT,
        }
    }
}

impl LivenessSweeper {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Tick stream; the first tick fires one interval from now.
    /// Intervals under one second are raised to one second.
    pub fn ticker(&self) -> Interval {
        let period = self.interval.max(MIN_INTERVAL);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Evict every stale node.
    ///
    /// Emits one flush per eviction and a single `node-list` for the whole
    /// batch. Nothing is emitted when no node is stale.
    pub fn sweep(&self, registry: &mut NodeRegistry, now_ms: u64) -> Vec<Effect> {
        let stale = registry.stale(now_ms);
        if stale.is_empty() {
            return Vec::new();
        }

        let mut effects = Vec::with_capacity(stale.len() + registry.len());
        for id in &stale {
            if let Some(node) = registry.remove(id) {
                info!(
                    "Evicting {} ({}s silent)",
                    node.id,
                    now_ms.saturating_sub(node.last_seen) / 1000
                );
                effects.push(Effect::Flush(SessionFlush::for_node(&node, now_ms)));
            }
        }

        effects.extend(RelayBroadcaster::node_list(registry, now_ms));
        info!("Sweep evicted {} node(s), {} remaining", stale.len(), registry.len());
        effects
    }
}
