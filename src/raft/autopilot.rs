//! Autopilot (§4.9 Autopilot): a periodic reconciliation loop that only does
//! anything while this node is the Raft leader. Classifies members as
//! alive/failed from gossip, and removes servers that have been failed for
//! longer than `dead_server_threshold` as long as quorum stays above
//! `min_quorum`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{NodeId, RaftInstance};
use crate::registry::gossip::GossipMembership;

pub struct AutopilotConfig {
    pub reconcile_interval: Duration,
    pub dead_server_threshold: Duration,
    pub min_quorum: usize,
    pub cleanup_dead_servers: bool,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            dead_server_threshold: Duration::from_secs(90),
            min_quorum: 2,
            cleanup_dead_servers: true,
        }
    }
}

/// Runs until `lifetime` is cancelled. Reconciliation only executes while
/// `raft.is_leader()` is true at the top of each tick — leadership loss
/// disables it immediately rather than partway through an in-flight pass.
pub async fn run(
    raft: std::sync::Arc<RaftInstance>,
    self_id: NodeId,
    gossip: std::sync::Arc<GossipMembership>,
    config: AutopilotConfig,
    lifetime: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.reconcile_interval);
    let mut failed_since: HashMap<NodeId, Instant> = HashMap::new();

    loop {
        tokio::select! {
            _ = lifetime.cancelled() => break,
            _ = ticker.tick() => {},
        }

        let metrics = raft.metrics().borrow().clone();
        if metrics.current_leader != Some(self_id) {
            failed_since.clear();
            continue;
        }

        let voters: Vec<NodeId> = metrics.membership_config.membership().voter_ids().collect();
        let live_addrs = gossip.live_raft_addrs().await;

        let mut failed = Vec::new();
        for &voter in &voters {
            if voter == self_id {
                continue;
            }
            let healthy = live_addrs.iter().any(|addr| super::node_id_from_str(addr) == voter);
            if healthy {
                failed_since.remove(&voter);
            } else {
                let since = *failed_since.entry(voter).or_insert_with(Instant::now);
                if since.elapsed() >= config.dead_server_threshold {
                    failed.push(voter);
                }
            }
        }

        if !config.cleanup_dead_servers || failed.is_empty() {
            continue;
        }

        let remaining = voters.len().saturating_sub(failed.len());
        if remaining < config.min_quorum {
            warn!(
                remaining,
                min_quorum = config.min_quorum,
                "autopilot: skipping dead-server cleanup, would drop below min quorum"
            );
            continue;
        }

        for node_id in failed {
            info!(node_id, "autopilot: removing server failed beyond threshold");
            if let Err(e) = super::membership::remove_server(&raft, node_id, 0).await {
                warn!(node_id, error = %e, "autopilot: remove_server failed");
            } else {
                failed_since.remove(&node_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = AutopilotConfig::default();
        assert_eq!(cfg.reconcile_interval, Duration::from_secs(10));
        assert!(cfg.cleanup_dead_servers);
    }
}
