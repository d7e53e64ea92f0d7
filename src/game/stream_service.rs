//! Server side of the `GameStream` service (§4.7) — one bidi stream per
//! connected Gateway. Tracks presence (§4.8) on `GATEWAY_PLAYER_ONLINE`
//! /`OFFLINE`, kicking a role's previous session when it reappears on a
//! different Gateway, and routes `GATEWAY_FORWARD_MESSAGE` client opcodes
//! through a [`Router`] that — absent any gameplay opcode registrations —
//! silently drops them (§6: unknown ops get no response), matching the
//! fabric's scope: it carries gameplay traffic, it doesn't define it.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::opcode::backend::*;
use crate::opcode::{GameKickClient, GatewayForwardMessage, GatewayHeartbeat, GatewayPlayerOffline, GatewayPlayerOnline};
use crate::pb;
use crate::pb::game_stream_server::GameStream;
use crate::presence::{KickCommand, PresenceCoordinator, RegisterOutcome, RoleSession};
use crate::router::Router;

const OUTBOUND_QUEUE_DEPTH: usize = 4096;

type GatewayMap = Arc<RwLock<HashMap<String, mpsc::Sender<pb::Envelope>>>>;

#[derive(Clone)]
pub struct GameStreamService {
    zone_id: String,
    presence: Arc<PresenceCoordinator>,
    router: Router,
    gateways: GatewayMap,
}

impl GameStreamService {
    pub fn new(zone_id: String, presence: Arc<PresenceCoordinator>, router: Router) -> Self {
        Self { zone_id, presence, router, gateways: Arc::new(RwLock::new(HashMap::new())) }
    }

    fn register_gateway_conn(&self, gateway_id: &str, tx: mpsc::Sender<pb::Envelope>) {
        self.gateways.write().insert(gateway_id.to_string(), tx);
    }

    fn gateway_sender(&self, gateway_id: &str) -> Option<mpsc::Sender<pb::Envelope>> {
        self.gateways.read().get(gateway_id).cloned()
    }

    async fn handle_player_online(&self, out_tx: &mpsc::Sender<pb::Envelope>, body: GatewayPlayerOnline) {
        self.register_gateway_conn(&body.gateway_id, out_tx.clone());

        let session = RoleSession {
            zone_id: self.zone_id.clone(),
            role_id: body.role_id,
            uid: body.uid,
            gateway_id: body.gateway_id.clone(),
            session_id: body.session_id.clone(),
            timestamp: 0,
        };

        match self.presence.register_role_session(&session).await {
            Ok(RegisterOutcome::Registered { previous_session: Some(prev) }) if prev.gateway_id != body.gateway_id => {
                if let Some(prev_tx) = self.gateway_sender(&prev.gateway_id) {
                    let cmd = GameKickClient { role_id: prev.role_id, reason: "duplicate_login".into(), message: "logged in elsewhere".into() };
                    let payload = serde_json::to_vec(&cmd).unwrap_or_default();
                    let _ = prev_tx.send(pb::Envelope { op: GAME_KICK_CLIENT, seq_id: 0, payload }).await;
                } else if let Err(e) = self
                    .presence
                    .publish_kick_command(&KickCommand { role_id: prev.role_id, reason: "duplicate_login".into(), message: "logged in elsewhere".into() })
                    .await
                {
                    warn!(error = %e, "failed to publish kick command for a gateway this node holds no stream to");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(role_id = body.role_id, error = %e, "presence registration failed"),
        }
    }

    async fn handle_player_offline(&self, body: GatewayPlayerOffline) {
        if let Err(e) = self.presence.unregister_role_session(&self.zone_id, body.role_id, 0).await {
            warn!(role_id = body.role_id, error = %e, "presence unregister failed");
        }
    }

    async fn handle_forward_message(&self, body: GatewayForwardMessage) {
        let env = crate::envelope::Envelope::new(body.client_op, bytes::Bytes::from(body.client_payload));
        if self.router.is_registered(env.op) {
            let _ = self.router.dispatch(env).await;
        }
    }

    async fn handle_inbound(&self, out_tx: &mpsc::Sender<pb::Envelope>, pb_env: pb::Envelope) {
        match pb_env.op {
            GATEWAY_PLAYER_ONLINE => {
                if let Ok(body) = serde_json::from_slice::<GatewayPlayerOnline>(&pb_env.payload) {
                    self.handle_player_online(out_tx, body).await;
                }
            }
            GATEWAY_PLAYER_OFFLINE => {
                if let Ok(body) = serde_json::from_slice::<GatewayPlayerOffline>(&pb_env.payload) {
                    self.handle_player_offline(body).await;
                }
            }
            GATEWAY_FORWARD_MESSAGE => {
                if let Ok(body) = serde_json::from_slice::<GatewayForwardMessage>(&pb_env.payload) {
                    self.handle_forward_message(body).await;
                }
            }
            GATEWAY_HEARTBEAT => {
                if let Ok(body) = serde_json::from_slice::<GatewayHeartbeat>(&pb_env.payload) {
                    self.register_gateway_conn(&body.gateway_id, out_tx.clone());
                    let _ = out_tx.send(pb::Envelope { op: GAME_HEARTBEAT_ACK, seq_id: 0, payload: Vec::new() }).await;
                }
            }
            _ => {}
        }
    }
}

#[tonic::async_trait]
impl GameStream for GameStreamService {
    type StreamStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<pb::Envelope, Status>> + Send + 'static>>;

    async fn stream(&self, request: Request<Streaming<pb::Envelope>>) -> Result<Response<Self::StreamStream>, Status> {
        let mut inbound = request.into_inner();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let service = self.clone();

        info!("game stream opened");

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(pb_env)) => service.handle_inbound(&out_tx, pb_env).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "game stream inbound error");
                        break;
                    }
                }
            }
        });

        let stream: Self::StreamStream = Box::pin(ReceiverStream::new(out_rx).map(Ok));
        Ok(Response::new(stream))
    }

    async fn forward_message(&self, request: Request<pb::Envelope>) -> Result<Response<pb::Envelope>, Status> {
        let pb_env = request.into_inner();
        let (tx, _rx) = mpsc::channel(1);
        self.handle_inbound(&tx, pb_env.clone()).await;
        Ok(Response::new(pb_env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forward_message_with_unregistered_opcode_is_a_noop() {
        let presence = PresenceCoordinator::new("redis://127.0.0.1:6399").unwrap();
        let service = GameStreamService::new("zone-1".into(), presence, Router::new());
        let (tx, _rx) = mpsc::channel(1);
        let body = GatewayForwardMessage { role_id: 1, session_id: "s".into(), client_op: 999, client_payload: vec![], gateway_id: "gw-1".into() };
        service.handle_forward_message(body).await;
        let _ = tx; // no panic is the assertion here — nothing is registered for op 999
    }
}
