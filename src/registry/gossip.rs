//! LAN gossip membership (§4.9 cluster bootstrap, `serf/local.snapshot`).
//!
//! Raft needs a way to find peers before any of them is a known Raft
//! member — the role Serf plays in the original design. `chitchat` gives
//! us the same SWIM-style failure-detector gossip without a bespoke
//! protocol: each node advertises its Raft RPC address as a chitchat key
//! and `live_nodes()` is the discovery source the bootstrap/Autopilot code
//! polls.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use chitchat::{transport::UdpTransport, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig, NodeState};
use tokio::sync::Mutex;

pub const RAFT_ADDR_KEY: &str = "raft_addr";

/// One running gossip participant. Wraps `chitchat::ChitchatHandle`; `self`
/// owns the gossip UDP socket for the process lifetime.
pub struct GossipMembership {
    handle: ChitchatHandle,
}

impl GossipMembership {
    pub async fn spawn(
        node_id: String,
        gossip_addr: SocketAddr,
        raft_addr: SocketAddr,
        seed_addrs: Vec<String>,
    ) -> anyhow::Result<Self> {
        let chitchat_id = ChitchatId::new(node_id, 0, gossip_addr);
        let config = ChitchatConfig {
            chitchat_id,
            cluster_id: "xdooria-fabric".to_string(),
            gossip_interval: std::time::Duration::from_millis(500),
            listen_addr: gossip_addr,
            seed_nodes: seed_addrs,
            failure_detector_config: FailureDetectorConfig::default(),
            marked_for_deletion_grace_period: std::time::Duration::from_secs(60 * 60),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_kvs = vec![(RAFT_ADDR_KEY.to_string(), raft_addr.to_string())];
        let handle = chitchat::spawn_chitchat(config, initial_kvs, &UdpTransport).await?;
        Ok(Self { handle })
    }

    pub fn chitchat(&self) -> &Mutex<Chitchat> {
        self.handle.chitchat()
    }

    /// Raft RPC addresses of every node currently considered live (§4.9
    /// bootstrap discovery, used alongside `ExpectNodes` and `StatusPeers`
    /// retries).
    pub async fn live_raft_addrs(&self) -> BTreeSet<String> {
        let guard = self.handle.chitchat().lock().await;
        let mut out = BTreeSet::new();
        for chitchat_id in guard.live_nodes() {
            if let Some(node_state) = guard.node_state(chitchat_id) {
                if let Some(addr) = node_state.get(RAFT_ADDR_KEY) {
                    out.insert(addr.to_string());
                }
            }
        }
        out
    }

    pub async fn self_node_state(&self) -> Option<NodeState> {
        let guard = self.handle.chitchat().lock().await;
        guard.self_node_state().cloned()
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.handle.shutdown().await
    }
}
