//! Integration test for the production `password` login backend
//! ([`PasswordAuthenticator`]) plugged into [`LoginService`] end to end —
//! the in-crate `login::tests` module exercises `LoginService` against a
//! fake authenticator; this exercises the real sled+Argon2id one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use xdooria_fabric::login::password_auth::PasswordAuthenticator;
use xdooria_fabric::login::token::TokenSigner;
use xdooria_fabric::login::{LoginAuthenticator, LoginError, LoginService};
use xdooria_fabric::registry::{Resolver, ServiceInfo};

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

async fn service_with(dir: &std::path::Path) -> LoginService {
    let mut authenticators: HashMap<String, Arc<dyn LoginAuthenticator>> = HashMap::new();
    authenticators.insert("password".into(), Arc::new(PasswordAuthenticator::open(dir).unwrap()));

    let resolver = Arc::new(FakeResolver {
        initial: vec![ServiceInfo { name: "gateway".into(), address: "10.0.0.7:9000".into(), metadata: HashMap::new() }],
    });

    LoginService::new(
        authenticators,
        Arc::new(TokenSigner::new(b"integration-test-secret", 3600)),
        resolver,
        Arc::new(xdooria_fabric::balancer::RoundRobin::default()),
        "gateway".into(),
    )
    .await
}

#[tokio::test]
async fn first_seen_credentials_provision_an_account_and_log_in() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path()).await;

    let result = service.login("password", "alice:hunter2", 1_700_000_000).await.unwrap();
    assert_eq!(result.nickname, "alice");
    assert_eq!(result.gateway_addr, "10.0.0.7:9000");
    assert!(!result.token.is_empty());
}

#[tokio::test]
async fn same_account_logs_in_with_a_stable_uid_across_separate_service_instances() {
    let dir = tempfile::tempdir().unwrap();

    let first_uid = service_with(dir.path()).await.login("password", "bob:correcthorse", 1_700_000_000).await.unwrap().uid;

    // A fresh `LoginService`/`PasswordAuthenticator` over the same data
    // directory must resolve the same account, not re-provision it.
    let second_uid = service_with(dir.path()).await.login("password", "bob:correcthorse", 1_700_000_100).await.unwrap().uid;

    assert_eq!(first_uid, second_uid);
}

#[tokio::test]
async fn wrong_password_fails_the_whole_login_call() {
    let dir = tempfile::tempdir().unwrap();
    service_with(dir.path()).await.login("password", "carol:right", 1_700_000_000).await.unwrap();

    let err = service_with(dir.path()).await.login("password", "carol:wrong", 1_700_000_100).await.unwrap_err();
    assert!(matches!(err, LoginError::AuthFailed));
}
