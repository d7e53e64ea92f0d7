//! Wires [`LoginService`] into the shared session pipeline (§4.1): one
//! `LOGIN_REQ` in, one `LOGIN_RES` out, no per-connection state beyond the
//! socket itself — a login connection never outlives a single request.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;
use uuid::Uuid;

use crate::envelope::{response_of, Envelope};
use crate::errors::{ErrorCode, SessionError};
use crate::opcode::client::LOGIN_REQ;
use crate::opcode::{LoginReq, LoginRes};
use crate::session::{Session, SessionHandler};

use super::{LoginError, LoginService};

pub struct LoginSessionHandler {
    service: Arc<LoginService>,
}

impl LoginSessionHandler {
    pub fn new(service: Arc<LoginService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl SessionHandler for LoginSessionHandler {
    async fn on_opened(&self, _session: &Arc<Session>) {}

    async fn on_message(&self, session: &Arc<Session>, envelope: Envelope) {
        if envelope.op != LOGIN_REQ {
            return;
        }
        let req: LoginReq = match serde_json::from_slice(&envelope.payload) {
            Ok(r) => r,
            Err(_) => return,
        };

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let res = match self.service.login(&req.login_type, &req.credentials, now).await {
            Ok(result) => LoginRes {
                code: ErrorCode::Success as u16,
                token: result.token,
                uid: result.uid,
                nickname: result.nickname,
                gateway_addr: result.gateway_addr,
            },
            Err(LoginError::AuthFailed) => {
                LoginRes { code: ErrorCode::TokenInvalid as u16, token: String::new(), uid: 0, nickname: String::new(), gateway_addr: String::new() }
            }
            Err(LoginError::UnknownLoginType(kind)) => {
                warn!(login_type = kind, "unknown login_type");
                LoginRes { code: ErrorCode::Internal as u16, token: String::new(), uid: 0, nickname: String::new(), gateway_addr: String::new() }
            }
        };

        match serde_json::to_vec(&res) {
            Ok(bytes) => {
                let env = Envelope::new(response_of(LOGIN_REQ), Bytes::from(bytes)).with_seq(envelope.seq_id);
                let _ = session.send(env);
            }
            Err(e) => warn!(error = %e, "failed to encode login response"),
        }

        session.close();
    }

    async fn on_closed(&self, _session_id: Uuid) {}

    async fn on_error(&self, _session_id: Uuid, _error: SessionError) {}
}
