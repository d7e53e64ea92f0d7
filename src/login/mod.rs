pub mod password_auth;
pub mod session_handler;
pub mod token;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::balancer::Balancer;
use crate::metrics::LOGIN_ATTEMPTS_TOTAL;
use crate::registry::{Resolver, ServiceInfo};
use token::TokenSigner;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub uid: i64,
    pub nickname: String,
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("unknown login_type: {0}")]
    UnknownLoginType(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResult {
    pub token: String,
    pub uid: i64,
    pub nickname: String,
    pub gateway_addr: String,
}

/// One plug-in per `login_type` (password, OAuth, device-id, ...). A
/// capability trait per §9 Dynamic dispatch.
#[async_trait]
pub trait LoginAuthenticator: Send + Sync {
    async fn authenticate(&self, credentials: &str) -> Result<Identity, LoginError>;
}

/// §4.5 Login -> Gateway handoff. Holds a background-refreshed cache of
/// `gateway` service nodes — resolved once synchronously at startup, then
/// kept current purely from the `Resolver::watch` stream so `login()` never
/// blocks on service discovery in its hot path.
pub struct LoginService {
    authenticators: HashMap<String, Arc<dyn LoginAuthenticator>>,
    signer: Arc<TokenSigner>,
    gateway_cache: Arc<RwLock<Vec<ServiceInfo>>>,
    balancer: Arc<dyn Balancer>,
}

impl LoginService {
    pub async fn new(
        authenticators: HashMap<String, Arc<dyn LoginAuthenticator>>,
        signer: Arc<TokenSigner>,
        resolver: Arc<dyn Resolver>,
        balancer: Arc<dyn Balancer>,
        gateway_service_name: String,
    ) -> Self {
        let initial = resolver.snapshot(&gateway_service_name).await;
        let gateway_cache = Arc::new(RwLock::new(initial));

        let cache_for_task = gateway_cache.clone();
        let mut watch_rx = resolver.watch(&gateway_service_name);
        tokio::spawn(async move {
            loop {
                if watch_rx.changed().await.is_err() {
                    break;
                }
                let snapshot = watch_rx.borrow_and_update().clone();
                *cache_for_task.write() = snapshot;
            }
        });

        Self { authenticators, signer, gateway_cache, balancer }
    }

    pub async fn login(&self, login_type: &str, credentials: &str, now_unix: i64) -> Result<LoginResult, LoginError> {
        let authenticator = self
            .authenticators
            .get(login_type)
            .ok_or_else(|| LoginError::UnknownLoginType(login_type.to_string()))?;

        let identity = match authenticator.authenticate(credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                LOGIN_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();
                return Err(e);
            }
        };

        let token = self.signer.issue(identity.uid, now_unix);
        let gateway_addr = {
            let cache = self.gateway_cache.read();
            self.balancer.pick(&cache).map(|s| s.address.clone()).unwrap_or_default()
        };

        if gateway_addr.is_empty() {
            warn!(uid = identity.uid, "no gateway nodes available at login time");
        }

        LOGIN_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
        info!(uid = identity.uid, login_type, "login succeeded");

        Ok(LoginResult { token, uid: identity.uid, nickname: identity.nickname, gateway_addr })
    }
}

/// Convenience helper matching the teacher's periodic-task idiom: a loop
/// with a fixed tick used where a push-based watch isn't applicable.
pub async fn tick_every(interval: Duration, mut on_tick: impl FnMut()) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        on_tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::RoundRobin;
    use std::collections::HashMap as Map;
    use tokio::sync::watch;

    struct FakeAuth;

    #[async_trait]
    impl LoginAuthenticator for FakeAuth {
        async fn authenticate(&self, credentials: &str) -> Result<Identity, LoginError> {
            if credentials == "good" {
                Ok(Identity { uid: 42, nickname: "alice".into(), extra: Map::new() })
            } else {
                Err(LoginError::AuthFailed)
            }
        }
    }

    struct FakeResolver {
        initial: Vec<ServiceInfo>,
    }

    #[async_trait]
    impl Resolver for FakeResolver {
        async fn snapshot(&self, _name: &str) -> Vec<ServiceInfo> {
            self.initial.clone()
        }
        fn watch(&self, _name: &str) -> watch::Receiver<Vec<ServiceInfo>> {
            let (_tx, rx) = watch::channel(self.initial.clone());
            rx
        }
    }

    #[tokio::test]
    async fn login_happy_path_returns_token_and_gateway_addr() {
        let mut authenticators: HashMap<String, Arc<dyn LoginAuthenticator>> = HashMap::new();
        authenticators.insert("password".into(), Arc::new(FakeAuth));

        let resolver = Arc::new(FakeResolver {
            initial: vec![ServiceInfo { name: "gateway".into(), address: "10.0.0.1:9000".into(), metadata: Map::new() }],
        });

        let service = LoginService::new(
            authenticators,
            Arc::new(TokenSigner::new(b"secret", 3600)),
            resolver,
            Arc::new(RoundRobin::default()),
            "gateway".into(),
        )
        .await;

        let result = service.login("password", "good", 1_700_000_000).await.unwrap();
        assert_eq!(result.uid, 42);
        assert_eq!(result.gateway_addr, "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn login_with_empty_gateway_cache_returns_empty_address_not_error() {
        let mut authenticators: HashMap<String, Arc<dyn LoginAuthenticator>> = HashMap::new();
        authenticators.insert("password".into(), Arc::new(FakeAuth));
        let resolver = Arc::new(FakeResolver { initial: vec![] });

        let service = LoginService::new(
            authenticators,
            Arc::new(TokenSigner::new(b"secret", 3600)),
            resolver,
            Arc::new(RoundRobin::default()),
            "gateway".into(),
        )
        .await;

        let result = service.login("password", "good", 1_700_000_000).await.unwrap();
        assert_eq!(result.gateway_addr, "");
    }

    #[tokio::test]
    async fn unknown_login_type_is_rejected() {
        let service = LoginService::new(
            HashMap::new(),
            Arc::new(TokenSigner::new(b"secret", 3600)),
            Arc::new(FakeResolver { initial: vec![] }),
            Arc::new(RoundRobin::default()),
            "gateway".into(),
        )
        .await;

        let err = service.login("sso", "good", 1_700_000_000).await.unwrap_err();
        assert!(matches!(err, LoginError::UnknownLoginType(_)));
    }
}
