//! Gateway handler state machine (§4.5/§6 Client-API).
//!
//! States: `Connected -> Authenticated -> RoleSelected -> Closed`. Each
//! state accepts a fixed set of opcodes (§6 table); anything else is
//! silently dropped — the client protocol has no "unknown op" response.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use crate::envelope::{response_of, Envelope};
use crate::errors::{ErrorCode, SessionError, TokenError};
use crate::gateway::manager::SessionManager;
use crate::gateway::session::{ForwardFn, GatewaySession};
use crate::opcode::{client::*, *};
use crate::session::{Session, SessionHandler};

pub const MAX_ROLES_PER_ACCOUNT: usize = 3;
pub const NICKNAME_MIN_LEN: usize = 1;
pub const NICKNAME_MAX_LEN: usize = 32;

/// Validates login/session tokens (§3 Identity / Token). Implemented by
/// `crate::login::token` for production, and by an in-memory fake in tests.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate_login_token(&self, token: &str) -> Result<i64, TokenError>;
    async fn validate_session_token(&self, token: &str) -> Result<i64, TokenError>;
    fn issue_session_token(&self, uid: i64) -> String;
}

/// Backing store for role rows (§4.5 `CREATE_ROLE_REQ`/`GET_ROLES_REQ`).
#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn list_roles(&self, uid: i64) -> Vec<RoleSummary>;
    async fn nickname_exists(&self, nickname: &str) -> bool;
    async fn create_role(
        &self,
        uid: i64,
        nickname: String,
        gender: u8,
        appearance: String,
    ) -> RoleSummary;
    async fn owns_role(&self, uid: i64, role_id: i64) -> bool;
}

/// Notified of role lifecycle transitions so it can forward `GATEWAY_*`
/// envelopes to Game (§4.7) and drive the per-player worker (§4.3).
#[async_trait]
pub trait GameNotifier: Send + Sync {
    async fn player_online(&self, role_id: i64, uid: i64, session_id: uuid::Uuid);
    async fn player_offline(&self, role_id: i64, session_id: uuid::Uuid, reason: &str);
    fn forward_fn(self: Arc<Self>) -> ForwardFn;
}

pub struct GatewayHandler<A, R, G> {
    pub manager: Arc<SessionManager>,
    pub authenticator: Arc<A>,
    pub roles: Arc<R>,
    pub notifier: Arc<G>,
    pub gateway_id: String,
    pub zone_id: String,
}

impl<A, R, G> GatewayHandler<A, R, G>
where
    A: Authenticator + 'static,
    R: RoleStore + 'static,
    G: GameNotifier + 'static,
{
    pub fn new(
        manager: Arc<SessionManager>,
        authenticator: Arc<A>,
        roles: Arc<R>,
        notifier: Arc<G>,
        gateway_id: String,
        zone_id: String,
    ) -> Self {
        Self { manager, authenticator, roles, notifier, gateway_id, zone_id }
    }

    fn reply<T: serde::Serialize>(session: &Session, op: u32, req_seq: u32, body: &T) {
        match serde_json::to_vec(body) {
            Ok(bytes) => {
                let env = Envelope::new(op, Bytes::from(bytes)).with_seq(req_seq);
                if let Err(e) = session.send(env) {
                    warn!(session_id = %session.id, error = %e, "failed to enqueue response");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode response payload"),
        }
    }

    async fn handle_auth_req(&self, session: &Session, gs: &Arc<GatewaySession>, envelope: &Envelope) {
        let req: AuthReq = match serde_json::from_slice(&envelope.payload) {
            Ok(r) => r,
            Err(_) => return,
        };
        match self.authenticator.validate_login_token(&req.login_token).await {
            Ok(uid) => {
                let token = self.authenticator.issue_session_token(uid);
                if self.manager.update_auth_state(gs.id(), uid).is_err() {
                    return;
                }
                Self::reply(
                    session,
                    response_of(AUTH_REQ),
                    envelope.seq_id,
                    &AuthRes { code: ErrorCode::Success as u16, token, uid },
                );
            }
            Err(e) => {
                Self::reply(
                    session,
                    response_of(AUTH_REQ),
                    envelope.seq_id,
                    &AuthRes { code: ErrorCode::from(e) as u16, token: String::new(), uid: 0 },
                );
            }
        }
    }

    async fn handle_reconnect_req(&self, session: &Session, gs: &Arc<GatewaySession>, envelope: &Envelope) {
        let req: ReconnectReq = match serde_json::from_slice(&envelope.payload) {
            Ok(r) => r,
            Err(_) => return,
        };
        match self.authenticator.validate_session_token(&req.session_token).await {
            Ok(uid) => {
                let token = self.authenticator.issue_session_token(uid);
                if self.manager.update_auth_state(gs.id(), uid).is_err() {
                    return;
                }
                Self::reply(
                    session,
                    response_of(RECONNECT_REQ),
                    envelope.seq_id,
                    &ReconnectRes { code: ErrorCode::Success as u16, token },
                );
            }
            Err(e) => {
                Self::reply(
                    session,
                    response_of(RECONNECT_REQ),
                    envelope.seq_id,
                    &ReconnectRes { code: ErrorCode::from(e) as u16, token: String::new() },
                );
            }
        }
    }

    async fn handle_get_roles_req(&self, session: &Session, gs: &Arc<GatewaySession>, envelope: &Envelope) {
        let roles = self.roles.list_roles(gs.uid()).await;
        Self::reply(
            session,
            response_of(GET_ROLES_REQ),
            envelope.seq_id,
            &GetRolesRes { code: ErrorCode::Success as u16, roles },
        );
    }

    async fn handle_create_role_req(&self, session: &Session, gs: &Arc<GatewaySession>, envelope: &Envelope) {
        let req: CreateRoleReq = match serde_json::from_slice(&envelope.payload) {
            Ok(r) => r,
            Err(_) => return,
        };

        let len = req.nickname.chars().count();
        if !(NICKNAME_MIN_LEN..=NICKNAME_MAX_LEN).contains(&len) {
            Self::reply(
                session,
                response_of(CREATE_ROLE_REQ),
                envelope.seq_id,
                &CreateRoleRes { code: ErrorCode::NicknameInvalid as u16, role: None },
            );
            return;
        }

        if self.roles.nickname_exists(&req.nickname).await {
            Self::reply(
                session,
                response_of(CREATE_ROLE_REQ),
                envelope.seq_id,
                &CreateRoleRes { code: ErrorCode::NicknameExists as u16, role: None },
            );
            return;
        }

        if self.roles.list_roles(gs.uid()).await.len() >= MAX_ROLES_PER_ACCOUNT {
            Self::reply(
                session,
                response_of(CREATE_ROLE_REQ),
                envelope.seq_id,
                &CreateRoleRes { code: ErrorCode::RoleLimitExceeded as u16, role: None },
            );
            return;
        }

        let role = self
            .roles
            .create_role(gs.uid(), req.nickname, req.gender, req.appearance)
            .await;
        Self::reply(
            session,
            response_of(CREATE_ROLE_REQ),
            envelope.seq_id,
            &CreateRoleRes { code: ErrorCode::Success as u16, role: Some(role) },
        );
    }

    async fn handle_select_role_req(&self, session: &Session, gs: &Arc<GatewaySession>, envelope: &Envelope) {
        let req: SelectRoleReq = match serde_json::from_slice(&envelope.payload) {
            Ok(r) => r,
            Err(_) => return,
        };

        if !self.roles.owns_role(gs.uid(), req.role_id).await {
            Self::reply(
                session,
                response_of(SELECT_ROLE_REQ),
                envelope.seq_id,
                &SelectRoleRes { code: ErrorCode::InvalidRole as u16 },
            );
            return;
        }

        if self.manager.update_role_state(gs.id(), req.role_id).is_err() {
            return;
        }

        gs.start_processor(session.lifetime(), self.notifier.clone().forward_fn());
        self.notifier.player_online(req.role_id, gs.uid(), gs.id()).await;

        Self::reply(
            session,
            response_of(SELECT_ROLE_REQ),
            envelope.seq_id,
            &SelectRoleRes { code: ErrorCode::Success as u16 },
        );
    }
}

#[async_trait]
impl<A, R, G> SessionHandler for GatewayHandler<A, R, G>
where
    A: Authenticator + 'static,
    R: RoleStore + 'static,
    G: GameNotifier + 'static,
{
    async fn on_opened(&self, session: &Arc<Session>) {
        self.manager.register(session.clone());
        info!(session_id = %session.id, "gateway session opened");
    }

    async fn on_message(&self, session: &Arc<Session>, envelope: Envelope) {
        let Some(gs) = self.manager.get(session.id) else {
            return;
        };

        // State gating per §6: only the opcodes valid for the current
        // state are dispatched; everything else is dropped silently.
        match envelope.op {
            AUTH_REQ | RECONNECT_REQ => {
                if envelope.op == AUTH_REQ {
                    self.handle_auth_req(session, &gs, &envelope).await;
                } else {
                    self.handle_reconnect_req(session, &gs, &envelope).await;
                }
            }
            GET_ROLES_REQ if gs.is_authenticated() => {
                self.handle_get_roles_req(session, &gs, &envelope).await;
            }
            CREATE_ROLE_REQ if gs.is_authenticated() => {
                self.handle_create_role_req(session, &gs, &envelope).await;
            }
            SELECT_ROLE_REQ if gs.is_authenticated() => {
                self.handle_select_role_req(session, &gs, &envelope).await;
            }
            op if gs.is_role_selected() => {
                // Gameplay traffic: forward via the per-player worker so
                // ordering survives variable backend latency (§4.3, P5).
                let client_payload = envelope.payload.to_vec();
                let forward_envelope = Envelope::new(
                    backend::GATEWAY_FORWARD_MESSAGE,
                    Bytes::from(
                        serde_json::to_vec(&GatewayForwardMessage {
                            role_id: gs.role_id(),
                            session_id: gs.id().to_string(),
                            client_op: op,
                            client_payload,
                            gateway_id: self.gateway_id.clone(),
                        })
                        .unwrap_or_default(),
                    ),
                );
                if !gs.enqueue_forward(forward_envelope) {
                    warn!(session_id = %session.id, "dropped gameplay envelope, task queue full");
                }
            }
            _ => {}
        }
    }

    async fn on_closed(&self, session_id: uuid::Uuid) {
        if let Some(gs) = self.manager.get(session_id) {
            if gs.is_role_selected() {
                self.notifier.player_offline(gs.role_id(), session_id, "closed").await;
            }
        }
        self.manager.unregister(session_id);
        info!(session_id = %session_id, "gateway session closed");
    }

    async fn on_error(&self, session_id: uuid::Uuid, error: SessionError) {
        warn!(session_id = %session_id, error = %error, "session error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::BoxFuture;
    use crate::session::detached_session;
    use std::sync::Mutex as StdMutex;

    struct FakeAuth;

    #[async_trait]
    impl Authenticator for FakeAuth {
        async fn validate_login_token(&self, token: &str) -> Result<i64, TokenError> {
            if token == "good" {
                Ok(42)
            } else {
                Err(TokenError::Invalid)
            }
        }
        async fn validate_session_token(&self, token: &str) -> Result<i64, TokenError> {
            self.validate_login_token(token).await
        }
        fn issue_session_token(&self, _uid: i64) -> String {
            "session-token".into()
        }
    }

    struct FakeRoles {
        existing_nicknames: Vec<String>,
    }

    #[async_trait]
    impl RoleStore for FakeRoles {
        async fn list_roles(&self, _uid: i64) -> Vec<RoleSummary> {
            vec![]
        }
        async fn nickname_exists(&self, nickname: &str) -> bool {
            self.existing_nicknames.iter().any(|n| n == nickname)
        }
        async fn create_role(&self, _uid: i64, nickname: String, gender: u8, appearance: String) -> RoleSummary {
            RoleSummary { role_id: 1, nickname, gender, appearance }
        }
        async fn owns_role(&self, _uid: i64, role_id: i64) -> bool {
            role_id == 100
        }
    }

    struct FakeNotifier {
        online_calls: StdMutex<Vec<i64>>,
    }

    #[async_trait]
    impl GameNotifier for FakeNotifier {
        async fn player_online(&self, role_id: i64, _uid: i64, _session_id: uuid::Uuid) {
            self.online_calls.lock().unwrap().push(role_id);
        }
        async fn player_offline(&self, _role_id: i64, _session_id: uuid::Uuid, _reason: &str) {}
        fn forward_fn(self: Arc<Self>) -> ForwardFn {
            Arc::new(|_env: Envelope| -> BoxFuture { Box::pin(async move {}) })
        }
    }

    fn handler() -> GatewayHandler<FakeAuth, FakeRoles, FakeNotifier> {
        GatewayHandler::new(
            Arc::new(SessionManager::new()),
            Arc::new(FakeAuth),
            Arc::new(FakeRoles { existing_nicknames: vec!["alice".into()] }),
            Arc::new(FakeNotifier { online_calls: StdMutex::new(vec![]) }),
            "gw-1".into(),
            "zone-1".into(),
        )
    }

    #[tokio::test]
    async fn auth_happy_path_authenticates_and_registers_by_uid() {
        let h = handler();
        let (session, mut rx) = detached_session(4);
        let session = Arc::new(session);
        h.manager.register(session.clone());
        let gs = h.manager.get(session.id).unwrap();

        let req = Envelope::new(AUTH_REQ, Bytes::from(serde_json::to_vec(&AuthReq { login_token: "good".into() }).unwrap()));
        h.handle_auth_req(&session, &gs, &req).await;

        assert!(gs.is_authenticated());
        assert_eq!(gs.uid(), 42);
        assert_eq!(h.manager.get_by_uid(42).len(), 1);

        let res_env = rx.recv().await.unwrap();
        let res: AuthRes = serde_json::from_slice(&res_env.payload).unwrap();
        assert_eq!(res.code, ErrorCode::Success as u16);
        assert_eq!(res.uid, 42);
    }

    #[tokio::test]
    async fn nickname_uniqueness_rejects_duplicate() {
        let h = handler();
        let (session, mut rx) = detached_session(4);
        let session = Arc::new(session);
        h.manager.register(session.clone());
        let gs = h.manager.get(session.id).unwrap();
        h.manager.update_auth_state(gs.id(), 42).unwrap();

        let req = Envelope::new(
            CREATE_ROLE_REQ,
            Bytes::from(serde_json::to_vec(&CreateRoleReq { nickname: "alice".into(), gender: 0, appearance: String::new() }).unwrap()),
        );
        h.handle_create_role_req(&session, &gs, &req).await;

        let res_env = rx.recv().await.unwrap();
        let res: CreateRoleRes = serde_json::from_slice(&res_env.payload).unwrap();
        assert_eq!(res.code, ErrorCode::NicknameExists as u16);
        assert!(res.role.is_none());
    }

    #[tokio::test]
    async fn select_role_starts_worker_and_notifies_online() {
        let h = handler();
        let (session, mut rx) = detached_session(4);
        let session = Arc::new(session);
        h.manager.register(session.clone());
        let gs = h.manager.get(session.id).unwrap();
        h.manager.update_auth_state(gs.id(), 42).unwrap();

        let req = Envelope::new(
            SELECT_ROLE_REQ,
            Bytes::from(serde_json::to_vec(&SelectRoleReq { role_id: 100 }).unwrap()),
        );
        h.handle_select_role_req(&session, &gs, &req).await;

        assert!(gs.is_role_selected());
        let _ = rx.recv().await.unwrap();
    }
}
