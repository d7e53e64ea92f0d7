//! Gateway<->Game stream connector (§4.7).
//!
//! One bidi gRPC stream per Gateway, pointed at the Game instance this
//! Gateway is currently assigned to by the registry/balancer. Outbound:
//! `GATEWAY_FORWARD_MESSAGE`, `GATEWAY_PLAYER_ONLINE/OFFLINE`, and a
//! `GATEWAY_HEARTBEAT` every 30 s. Inbound: `GAME_SEND_TO_CLIENT`,
//! `GAME_BROADCAST`, `GAME_KICK_CLIENT`, `GAME_HEARTBEAT_ACK`. The stream
//! reconnects with backoff on any break; while disconnected, outbound sends
//! fail with `StreamError::NotConnected` rather than queuing unboundedly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::envelope::Envelope;
use crate::errors::StreamError;
use crate::gateway::handler::GameNotifier;
use crate::gateway::manager::SessionManager;
use crate::gateway::session::{BoxFuture, ForwardFn};
use crate::opcode::{backend::*, GameBroadcast, GameKickClient, GameSendToClient, GatewayHeartbeat, GatewayPlayerOffline, GatewayPlayerOnline, KickNotice};
use crate::pb;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE_DEPTH: usize = 4096;

pub struct GameStreamConnector {
    manager: Arc<SessionManager>,
    gateway_id: String,
    zone_id: String,
    game_addr: String,
    outbound_tx: Mutex<Option<mpsc::Sender<pb::Envelope>>>,
    connected: AtomicBool,
    lifetime: CancellationToken,
}

impl GameStreamConnector {
    pub fn new(manager: Arc<SessionManager>, gateway_id: String, zone_id: String, game_addr: String) -> Arc<Self> {
        Arc::new(Self {
            manager,
            gateway_id,
            zone_id,
            game_addr,
            outbound_tx: Mutex::new(None),
            connected: AtomicBool::new(false),
            lifetime: CancellationToken::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.lifetime.cancel();
    }

    fn send_raw(&self, op: u32, payload: Vec<u8>) -> Result<(), StreamError> {
        let guard = self.outbound_tx.lock();
        let tx = guard.as_ref().ok_or(StreamError::NotConnected)?;
        let env = pb::Envelope { op, seq_id: 0, payload };
        tx.try_send(env).map_err(|_| StreamError::NotConnected)
    }

    async fn send_json<T: serde::Serialize>(&self, op: u32, body: &T) -> Result<(), StreamError> {
        let payload = serde_json::to_vec(body).unwrap_or_default();
        self.send_raw(op, payload)
    }

    /// Reconnects forever until `shutdown()` is called, each time running
    /// the bidi stream to completion (inbound reader + heartbeat ticker).
    pub fn spawn_connection_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(30));
            loop {
                if self.lifetime.is_cancelled() {
                    break;
                }
                match self.clone().run_one_connection().await {
                    Ok(()) => backoff.reset(),
                    Err(e) => warn!(error = %e, "game stream connection ended"),
                }
                self.connected.store(false, Ordering::Release);
                *self.outbound_tx.lock() = None;
                if self.lifetime.is_cancelled() {
                    break;
                }
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = self.lifetime.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });
    }

    async fn run_one_connection(self: Arc<Self>) -> Result<(), tonic::Status> {
        let channel = Channel::from_shared(self.game_addr.clone())
            .map_err(|e| tonic::Status::invalid_argument(e.to_string()))?
            .connect()
            .await
            .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
        let mut client = pb::game_stream_client::GameStreamClient::new(channel);

        let (tx, rx) = mpsc::channel::<pb::Envelope>(OUTBOUND_QUEUE_DEPTH);
        *self.outbound_tx.lock() = Some(tx);
        self.connected.store(true, Ordering::Release);
        info!(game_addr = %self.game_addr, "game stream connected");

        let outbound = ReceiverStream::new(rx);
        let response = client.stream(tonic::Request::new(outbound)).await?;
        let mut inbound = response.into_inner();

        let heartbeat_connector = self.clone();
        let heartbeat_lifetime = self.lifetime.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = heartbeat_lifetime.cancelled() => break,
                    _ = ticker.tick() => {
                        let body = GatewayHeartbeat {
                            gateway_id: heartbeat_connector.gateway_id.clone(),
                            timestamp: 0,
                            online_count: heartbeat_connector.manager.online_role_count() as u64,
                        };
                        if heartbeat_connector.send_json(GATEWAY_HEARTBEAT, &body).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.lifetime.cancelled() => break,
                frame = inbound.message() => {
                    match frame? {
                        Some(pb_env) => {
                            let env = Envelope::new(pb_env.op, pb_env.payload);
                            route_inbound(&self.manager, env).await;
                        }
                        None => break,
                    }
                }
            }
        }

        heartbeat_task.abort();
        Ok(())
    }
}

/// Dispatches one inbound `GAME_*` envelope against the session manager
/// (§6 Game->Gateway). Factored out of the connection loop so it can be
/// exercised without a real gRPC stream.
async fn route_inbound(manager: &Arc<SessionManager>, envelope: Envelope) {
    match envelope.op {
        GAME_SEND_TO_CLIENT => {
            let Ok(body) = serde_json::from_slice::<GameSendToClient>(&envelope.payload) else { return };
            if let Some(gs) = manager.get_by_role_id(body.role_id) {
                let _ = gs.session.send(Envelope::new(body.op, body.payload));
            }
        }
        GAME_BROADCAST => {
            let Ok(body) = serde_json::from_slice::<GameBroadcast>(&envelope.payload) else { return };
            let targets = if body.role_ids.is_empty() {
                manager.all_role_selected()
            } else {
                body.role_ids.iter().filter_map(|id| manager.get_by_role_id(*id)).collect()
            };
            for gs in targets {
                let _ = gs.session.send(Envelope::new(body.op, body.payload.clone()));
            }
        }
        GAME_KICK_CLIENT => {
            let Ok(body) = serde_json::from_slice::<GameKickClient>(&envelope.payload) else { return };
            if let Some(gs) = manager.get_by_role_id(body.role_id) {
                let notice = KickNotice { reason: body.reason, message: body.message };
                if let Ok(bytes) = serde_json::to_vec(&notice) {
                    let _ = gs.session.send(Envelope::new(crate::opcode::client::KICK_NOTICE, bytes));
                }
                gs.session.close();
            }
        }
        GAME_HEARTBEAT_ACK => {
            // Liveness tracking is left to the transport-level keepalive
            // (tonic/h2 pings); nothing to update here yet.
        }
        _ => {}
    }
}

#[async_trait]
impl GameNotifier for GameStreamConnector {
    async fn player_online(&self, role_id: i64, uid: i64, session_id: uuid::Uuid) {
        let body = GatewayPlayerOnline {
            role_id,
            uid,
            session_id: session_id.to_string(),
            gateway_id: self.gateway_id.clone(),
            zone_id: self.zone_id.clone(),
        };
        if let Err(e) = self.send_json(GATEWAY_PLAYER_ONLINE, &body).await {
            warn!(role_id, error = %e, "failed to notify Game of player_online");
        }
    }

    async fn player_offline(&self, role_id: i64, session_id: uuid::Uuid, reason: &str) {
        let body = GatewayPlayerOffline {
            role_id,
            session_id: session_id.to_string(),
            gateway_id: self.gateway_id.clone(),
            reason: reason.to_string(),
        };
        if let Err(e) = self.send_json(GATEWAY_PLAYER_OFFLINE, &body).await {
            warn!(role_id, error = %e, "failed to notify Game of player_offline");
        }
    }

    fn forward_fn(self: Arc<Self>) -> ForwardFn {
        // `env` here is already the fully-built `GATEWAY_FORWARD_MESSAGE`
        // envelope `GatewayHandler::on_message` constructed (role_id,
        // session_id, client_op, client_payload, gateway_id all set) — send
        // its payload as-is, don't re-wrap it in a second envelope.
        Arc::new(move |env: Envelope| -> BoxFuture {
            let connector = self.clone();
            Box::pin(async move {
                if connector.send_raw(env.op, env.payload.to_vec()).is_err() {
                    warn!("dropped forwarded envelope, game stream not connected");
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::detached_session;
    use bytes::Bytes;
    use std::sync::Arc;

    #[tokio::test]
    async fn game_send_to_client_reaches_the_right_session() {
        let manager = Arc::new(SessionManager::new());
        let (session, mut rx) = detached_session(4);
        let gs = manager.register(Arc::new(session));
        manager.update_auth_state(gs.id(), 42).unwrap();
        manager.update_role_state(gs.id(), 100).unwrap();

        let body = GameSendToClient { role_id: 100, op: 55, payload: b"hi".to_vec() };
        let env = Envelope::new(GAME_SEND_TO_CLIENT, Bytes::from(serde_json::to_vec(&body).unwrap()));
        route_inbound(&manager, env).await;

        let out = rx.recv().await.unwrap();
        assert_eq!(out.op, 55);
        assert_eq!(out.payload.as_ref(), b"hi");
    }

    #[tokio::test]
    async fn broadcast_with_empty_role_ids_reaches_every_role_selected_session() {
        let manager = Arc::new(SessionManager::new());
        let (s1, mut rx1) = detached_session(4);
        let gs1 = manager.register(Arc::new(s1));
        manager.update_auth_state(gs1.id(), 1).unwrap();
        manager.update_role_state(gs1.id(), 10).unwrap();

        let (s2, mut rx2) = detached_session(4);
        let gs2 = manager.register(Arc::new(s2));
        manager.update_auth_state(gs2.id(), 2).unwrap();
        manager.update_role_state(gs2.id(), 20).unwrap();

        let body = GameBroadcast { role_ids: vec![], op: 77, payload: b"all".to_vec() };
        let env = Envelope::new(GAME_BROADCAST, Bytes::from(serde_json::to_vec(&body).unwrap()));
        route_inbound(&manager, env).await;

        assert_eq!(rx1.recv().await.unwrap().op, 77);
        assert_eq!(rx2.recv().await.unwrap().op, 77);
    }

    #[tokio::test]
    async fn kick_client_sends_notice_then_closes_session() {
        let manager = Arc::new(SessionManager::new());
        let (session, mut rx) = detached_session(4);
        let gs = manager.register(Arc::new(session));
        manager.update_auth_state(gs.id(), 42).unwrap();
        manager.update_role_state(gs.id(), 100).unwrap();

        let body = GameKickClient { role_id: 100, reason: "duplicate_login".into(), message: "kicked".into() };
        let env = Envelope::new(GAME_KICK_CLIENT, Bytes::from(serde_json::to_vec(&body).unwrap()));
        route_inbound(&manager, env).await;

        let notice_env = rx.recv().await.unwrap();
        assert_eq!(notice_env.op, crate::opcode::client::KICK_NOTICE);
        assert!(gs.session.is_closed());
    }
}
