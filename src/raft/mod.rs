//! Raft consensus (§4.9, the heaviest component). Built on `openraft` 0.9,
//! following the same v1 `RaftStorage` + `Adaptor` bridge into the v2
//! `RaftLogStorage`/`RaftStateMachine` split as the load-test cluster this
//! crate started from, and the same plain-`async fn` (RPITIT, not
//! `#[async_trait]`) shape for `RaftNetwork`/`RaftNetworkFactory`.

pub mod autopilot;
pub mod chunking;
pub mod membership;
pub mod network;
pub mod snapshot;
pub mod storage;

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use openraft::{BasicNode, Entry, TokioRuntime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::registry::gossip::GossipMembership;

pub type NodeId = u64;
pub type Node = BasicNode;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Derives a stable u64 node id from a configured string identifier,
/// persisted at `{data_dir}/node-id` on first boot (§6 Raft persistence).
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

/// A replicated command. `ApplyLarge` is chunked by `chunking` before it
/// ever reaches the log (§4.9 ApplyLarge chunking, R3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FabricCommand {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
    ApplyLargeChunk { request_id: String, seq: u32, total: u32, bytes: Vec<u8> },
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricResponse {
    pub ok: bool,
    pub message: String,
}

/// Stable error taxonomy for Raft operations (§4.9 Error taxonomy). Flattens
/// openraft's own generic, call-specific error types into the fixed set of
/// outcomes a caller needs to branch on, the same way `errors::ErrorCode`
/// flattens this crate's client-facing failures.
#[derive(Debug, Error, Clone)]
pub enum RaftError {
    #[error("not the raft leader")]
    NotLeader,
    #[error("leadership lost while applying")]
    LeadershipLost,
    #[error("raft node is closed")]
    NodeClosed,
    #[error("raft node is not ready yet")]
    NodeNotReady,
    #[error("apply timed out")]
    ApplyTimeout,
    #[error("invalid raft configuration: {0}")]
    InvalidConfig(String),
    #[error("no leader currently elected")]
    NoLeader,
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),
    #[error("snapshot restore failed: {0}")]
    RestoreFailed(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("cluster already bootstrapped")]
    AlreadyBootstrapped,
    #[error("a membership change is already pending")]
    MembershipChangePending,
    #[error("server not found: {0}")]
    ServerNotFound(NodeId),
    #[error("snapshot data is corrupted")]
    SnapshotCorrupted,
}

impl RaftError {
    /// `NotLeader`/`LeadershipLost`/`ApplyTimeout` are worth a bounded retry
    /// by the caller; every other outcome needs a different action (fix
    /// config, wait for a leader, don't resubmit the same command).
    pub fn is_retryable(&self) -> bool {
        matches!(self, RaftError::NotLeader | RaftError::LeadershipLost | RaftError::ApplyTimeout)
    }
}

impl From<openraft::error::RaftError<NodeId, openraft::error::ClientWriteError<NodeId, Node>>> for RaftError {
    fn from(e: openraft::error::RaftError<NodeId, openraft::error::ClientWriteError<NodeId, Node>>) -> Self {
        use openraft::error::{ClientWriteError, Fatal};
        match e {
            openraft::error::RaftError::APIError(ClientWriteError::ForwardToLeader(_)) => RaftError::NotLeader,
            openraft::error::RaftError::APIError(ClientWriteError::ChangeMembershipError(_)) => {
                RaftError::MembershipChangePending
            }
            openraft::error::RaftError::Fatal(Fatal::Stopped) => RaftError::NodeClosed,
            openraft::error::RaftError::Fatal(Fatal::Panicked) => RaftError::NodeClosed,
            openraft::error::RaftError::Fatal(Fatal::StorageError(err)) => {
                tracing::warn!(error = %err, "raft storage error surfaced as NodeNotReady");
                RaftError::NodeNotReady
            }
        }
    }
}

impl From<snapshot::SnapshotError> for RaftError {
    fn from(e: snapshot::SnapshotError) -> Self {
        if e.is_corrupted() {
            RaftError::SnapshotCorrupted
        } else {
            RaftError::RestoreFailed(e.to_string())
        }
    }
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = FabricCommand,
        R            = FabricResponse,
        NodeId       = NodeId,
        Node         = Node,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

/// A running Raft node: the `openraft` handle, a watch channel driven by
/// the state machine's applied `__config` key, and the gossip participant
/// bootstrap/Autopilot use to discover peers.
#[derive(Clone)]
pub struct RaftNode {
    pub raft: Arc<RaftInstance>,
    pub node_id: NodeId,
    config_rx: watch::Receiver<Option<String>>,
    gossip: Arc<GossipMembership>,
}

impl RaftNode {
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    pub fn config_receiver(&self) -> watch::Receiver<Option<String>> {
        self.config_rx.clone()
    }

    pub async fn current_config(&self) -> Option<String> {
        self.config_rx.borrow().clone()
    }

    pub fn gossip(&self) -> &Arc<GossipMembership> {
        &self.gossip
    }

    /// §4.9 `ApplyCommand(cmd, timeout)`: leader-only, bounded by `timeout`.
    /// Errors are classified via [`RaftError::is_retryable`]
    /// (`NotLeader`/`LeadershipLost`/`ApplyTimeout` are retryable, everything
    /// else is not).
    pub async fn apply(&self, cmd: FabricCommand, timeout: Duration) -> Result<FabricResponse, RaftError> {
        match tokio::time::timeout(timeout, self.raft.client_write(cmd)).await {
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(e)) => Err(RaftError::from(e)),
            Err(_elapsed) => Err(RaftError::ApplyTimeout),
        }
    }

    /// §4.9 `ApplyLarge(data, timeout)`: splits `data` into
    /// `FabricCommand::ApplyLargeChunk` entries via `chunking::split` and
    /// submits them one at a time, in order, each bounded by `timeout`. The
    /// state machine reassembles the chunks as they're applied
    /// (`chunking::ChunkAssembler`); the response from the final chunk is
    /// returned to the caller.
    pub async fn apply_large(
        &self,
        request_id: String,
        data: &[u8],
        timeout: Duration,
    ) -> Result<FabricResponse, RaftError> {
        let chunks = chunking::split(request_id, data);
        let mut last = FabricResponse { ok: true, message: String::new() };
        for chunk in chunks {
            last = self.apply(chunk, timeout).await?;
        }
        Ok(last)
    }
}

/// Node identity persistence (§4.9 Persistence): `{data_dir}/node-id`, a
/// plain-text UUID with a trailing newline, generated once and reused on
/// every subsequent restart (R1: stable across restarts of the same data
/// dir).
pub fn load_or_create_node_id(data_dir: &Path) -> anyhow::Result<uuid::Uuid> {
    let path = data_dir.join("node-id");
    if let Ok(contents) = std::fs::read_to_string(&path) {
        if let Ok(id) = uuid::Uuid::parse_str(contents.trim()) {
            return Ok(id);
        }
    }
    let id = uuid::Uuid::new_v4();
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&path, format!("{id}\n"))?;
    Ok(id)
}

/// Opens `{data_dir}/raft.db` (sled), wires storage + gRPC network into a
/// running `Raft<TypeConfig>`, and wraps it in a [`RaftNode`]. Does not
/// bootstrap membership — callers follow up with
/// `membership::bootstrap_single` or `membership::bootstrap_expect`
/// depending on configured `expect_nodes`.
pub async fn start_raft_node(
    data_dir: &Path,
    self_id: NodeId,
    gossip: Arc<GossipMembership>,
    raft_config: openraft::Config,
) -> anyhow::Result<Arc<RaftNode>> {
    let (store, config_rx) = storage::SledStorage::open(&data_dir.join("raft.db"))?;
    let (log_store, state_machine) = storage::split(store);

    let raft = openraft::Raft::new(
        self_id,
        Arc::new(raft_config),
        network::GrpcNetworkFactory,
        log_store,
        state_machine,
    )
    .await?;

    info!(node_id = self_id, "raft node started");

    Ok(Arc::new(RaftNode { raft: Arc::new(raft), node_id: self_id, config_rx, gossip }))
}

/// Convenience helper matching `GatewayHandler`'s need for a stable
/// `BTreeMap<NodeId, Node>` of the current membership, e.g. to decide which
/// node the bootstrap race should favour (lowest node id wins, by
/// convention — see [`membership::bootstrap_expect`]).
pub fn membership_snapshot(raft: &RaftInstance) -> BTreeMap<NodeId, Node> {
    raft.metrics()
        .borrow()
        .membership_config
        .membership()
        .nodes()
        .map(|(id, node)| (*id, node.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_derivation_is_deterministic() {
        assert_eq!(node_id_from_str("gateway-1"), node_id_from_str("gateway-1"));
        assert_ne!(node_id_from_str("gateway-1"), node_id_from_str("gateway-2"));
    }
}
