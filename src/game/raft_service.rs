//! Server side of the `RaftTransport` service (§4.9 Transport) — the
//! receiving end of what `raft::network::GrpcNetwork` dials. Each RPC
//! JSON-decodes the proto payload into the matching openraft request type,
//! calls the local `Raft` handle, and re-encodes the response the same way.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::pb::raft_transport_server::RaftTransport;
use crate::pb::{
    AppendEntriesRequest as ProtoAppendEntries, AppendEntriesResponse as ProtoAppendEntriesResponse,
    ServerStatsRequest, ServerStatsResponse, SnapshotRequest as ProtoSnapshot, SnapshotResponse as ProtoSnapshotResponse,
    StatusPeersRequest, StatusPeersResponse, VoteRequest as ProtoVote, VoteResponse as ProtoVoteResponse,
};
use crate::raft::RaftNode;

pub struct RaftTransportService {
    node: Arc<RaftNode>,
}

impl RaftTransportService {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }
}

fn bad_payload(e: impl std::fmt::Display) -> Status {
    Status::invalid_argument(format!("malformed raft payload: {e}"))
}

#[tonic::async_trait]
impl RaftTransport for RaftTransportService {
    async fn append_entries(&self, request: Request<ProtoAppendEntries>) -> Result<Response<ProtoAppendEntriesResponse>, Status> {
        let req = serde_json::from_slice(&request.into_inner().payload).map_err(bad_payload)?;
        let resp = self.node.raft.append_entries(req).await.map_err(|e| Status::internal(e.to_string()))?;
        let payload = serde_json::to_vec(&resp).map_err(bad_payload)?;
        Ok(Response::new(ProtoAppendEntriesResponse { payload }))
    }

    async fn request_vote(&self, request: Request<ProtoVote>) -> Result<Response<ProtoVoteResponse>, Status> {
        let req = serde_json::from_slice(&request.into_inner().payload).map_err(bad_payload)?;
        let resp = self.node.raft.vote(req).await.map_err(|e| Status::internal(e.to_string()))?;
        let payload = serde_json::to_vec(&resp).map_err(bad_payload)?;
        Ok(Response::new(ProtoVoteResponse { payload }))
    }

    async fn install_snapshot(&self, request: Request<ProtoSnapshot>) -> Result<Response<ProtoSnapshotResponse>, Status> {
        let req = serde_json::from_slice(&request.into_inner().payload).map_err(bad_payload)?;
        let resp = self.node.raft.install_snapshot(req).await.map_err(|e| Status::internal(e.to_string()))?;
        let payload = serde_json::to_vec(&resp).map_err(bad_payload)?;
        Ok(Response::new(ProtoSnapshotResponse { payload }))
    }

    async fn status_peers(&self, _request: Request<StatusPeersRequest>) -> Result<Response<StatusPeersResponse>, Status> {
        let peer_addrs = self.node.gossip().live_raft_addrs().await.into_iter().collect();
        let has_existing_state = self.node.raft.metrics().borrow().last_applied.is_some();
        Ok(Response::new(StatusPeersResponse { peer_addrs, has_existing_state }))
    }

    async fn server_stats(&self, _request: Request<ServerStatsRequest>) -> Result<Response<ServerStatsResponse>, Status> {
        let metrics = self.node.raft.metrics().borrow().clone();
        let last_index = metrics.last_applied.map(|id| id.index).unwrap_or(0);
        Ok(Response::new(ServerStatsResponse {
            node_id: self.node.node_id.to_string(),
            last_contact_millis: 0,
            last_index,
        }))
    }
}
