//! gRPC transport for Raft RPCs (§4.9 Transport), carried over the
//! `RaftTransport` service in `proto/fabric.proto`. openraft request/response
//! types are JSON-serialised into the proto's `payload: bytes` field — the
//! same "generic envelope, opaque payload" shape the Gateway<->Game stream
//! uses, just turned towards Raft instead of game traffic.
//!
//! openraft's network traits are RPITIT (plain `async fn`), not
//! `#[async_trait]` — the impls below must match that shape exactly.

use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::AnyError;
use tonic::transport::{Channel, Endpoint};

use super::{Node, NodeId, TypeConfig};
use crate::pb::raft_transport_client::RaftTransportClient;
use crate::pb::{
    AppendEntriesRequest as ProtoAppendEntries, ServerStatsRequest, SnapshotRequest as ProtoSnapshot,
    StatusPeersRequest, VoteRequest as ProtoVote,
};

fn unreachable_err(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

/// Per-peer gRPC channel. Lazily dials on first use and lets tonic handle
/// reconnection — heartbeats fail fast via the connect/call timeouts below
/// rather than hanging until a follower's election timer fires.
pub struct GrpcNetwork {
    target_addr: String,
    client: Option<RaftTransportClient<Channel>>,
}

impl GrpcNetwork {
    pub fn new(target_addr: String) -> Self {
        Self { target_addr, client: None }
    }

    fn get_client(&mut self) -> Result<&mut RaftTransportClient<Channel>, String> {
        if self.client.is_none() {
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            let channel = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(RaftTransportClient::new(channel));
        }
        Ok(self.client.as_mut().unwrap())
    }

    pub async fn status_peers(&mut self) -> Result<(Vec<String>, bool), String> {
        let client = self.get_client()?;
        let resp = client.status_peers(StatusPeersRequest {}).await.map_err(|e| e.to_string())?;
        let resp = resp.into_inner();
        Ok((resp.peer_addrs, resp.has_existing_state))
    }

    pub async fn server_stats(&mut self) -> Result<(String, u64, u64), String> {
        let client = self.get_client()?;
        let resp = client.server_stats(ServerStatsRequest {}).await.map_err(|e| e.to_string())?;
        let resp = resp.into_inner();
        Ok((resp.node_id, resp.last_contact_millis, resp.last_index))
    }
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        let payload = serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable_err(e)))?;
        let term = rpc.vote.leader_id().term;
        let leader_id = rpc.vote.leader_id().node_id.to_string();

        let client = self.get_client().map_err(|e| RPCError::Unreachable(unreachable_err(e)))?;
        let proto_resp = client
            .append_entries(ProtoAppendEntries { term, leader_id, payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable_err(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload).map_err(|e| RPCError::Unreachable(unreachable_err(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        let payload = serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable_err(e)))?;
        let term = rpc.vote.leader_id().term;
        let candidate_id = rpc.vote.leader_id().node_id.to_string();

        let client = self.get_client().map_err(|e| RPCError::Unreachable(unreachable_err(e)))?;
        let proto_resp = client
            .request_vote(ProtoVote { term, candidate_id, payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable_err(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload).map_err(|e| RPCError::Unreachable(unreachable_err(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId, InstallSnapshotError>>> {
        let payload = serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable_err(e)))?;
        let term = rpc.vote.leader_id().term;

        let client = self.get_client().map_err(|e| RPCError::Unreachable(unreachable_err(e)))?;
        let proto_resp = client
            .install_snapshot(ProtoSnapshot { term, payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable_err(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload).map_err(|e| RPCError::Unreachable(unreachable_err(e)))
    }
}

/// Builds a fresh `GrpcNetwork` per target node, as `Raft` requires.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &Node) -> Self::Network {
        GrpcNetwork::new(node.addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_does_not_dial_until_first_rpc() {
        let net = GrpcNetwork::new("127.0.0.1:9999".into());
        assert!(net.client.is_none());
    }
}
