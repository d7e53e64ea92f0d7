//! Production `login_type = "password"` backend: credentials are
//! `uid:password`, hashes are Argon2id-salted and persisted in `sled`
//! under `{data_dir}/accounts.db`. First-seen uid/password pairs are
//! provisioned on the fly — there is no separate account-creation flow
//! (§4.5 doesn't define one, and a game client typically treats first
//! login as registration).

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Identity, LoginAuthenticator, LoginError};

#[derive(Debug, Serialize, Deserialize)]
struct AccountRow {
    uid: i64,
    nickname: String,
    password_hash: String,
}

pub struct PasswordAuthenticator {
    accounts: sled::Tree,
    next_uid: std::sync::atomic::AtomicI64,
}

impl PasswordAuthenticator {
    pub fn open(data_dir: &std::path::Path) -> anyhow::Result<Self> {
        let db = sled::open(data_dir.join("accounts.db"))?;
        let accounts = db.open_tree("accounts")?;
        let next_uid = accounts
            .iter()
            .values()
            .filter_map(Result::ok)
            .filter_map(|v| serde_json::from_slice::<AccountRow>(&v).ok())
            .map(|row| row.uid)
            .max()
            .map(|m| m + 1)
            .unwrap_or(1);
        Ok(Self { accounts, next_uid: std::sync::atomic::AtomicI64::new(next_uid) })
    }

    fn load(&self, username: &str) -> Option<AccountRow> {
        self.accounts.get(username.as_bytes()).ok().flatten().and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    fn provision(&self, username: &str, password: &str) -> Result<AccountRow, LoginError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|_| LoginError::AuthFailed)?
            .to_string();
        let uid = self.next_uid.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let row = AccountRow { uid, nickname: username.to_string(), password_hash: hash };
        let encoded = serde_json::to_vec(&row).map_err(|_| LoginError::AuthFailed)?;
        self.accounts.insert(username.as_bytes(), encoded).map_err(|_| LoginError::AuthFailed)?;
        Ok(row)
    }
}

#[async_trait]
impl LoginAuthenticator for PasswordAuthenticator {
    async fn authenticate(&self, credentials: &str) -> Result<Identity, LoginError> {
        let (username, password) = credentials.split_once(':').ok_or(LoginError::AuthFailed)?;
        if username.is_empty() || password.is_empty() {
            return Err(LoginError::AuthFailed);
        }

        let row = match self.load(username) {
            Some(row) => {
                let parsed = PasswordHash::new(&row.password_hash).map_err(|_| LoginError::AuthFailed)?;
                Argon2::default().verify_password(password.as_bytes(), &parsed).map_err(|_| {
                    warn!(username, "password mismatch");
                    LoginError::AuthFailed
                })?;
                row
            }
            None => self.provision(username, password)?,
        };

        Ok(Identity { uid: row.uid, nickname: row.nickname, extra: Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_login_provisions_account_and_subsequent_login_verifies_it() {
        let dir = tempfile::tempdir().unwrap();
        let auth = PasswordAuthenticator::open(dir.path()).unwrap();

        let first = auth.authenticate("alice:hunter2").await.unwrap();
        let second = auth.authenticate("alice:hunter2").await.unwrap();
        assert_eq!(first.uid, second.uid);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_after_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let auth = PasswordAuthenticator::open(dir.path()).unwrap();

        auth.authenticate("alice:hunter2").await.unwrap();
        let err = auth.authenticate("alice:wrong").await.unwrap_err();
        assert!(matches!(err, LoginError::AuthFailed));
    }

    #[tokio::test]
    async fn malformed_credentials_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let auth = PasswordAuthenticator::open(dir.path()).unwrap();
        assert!(matches!(auth.authenticate("no-colon").await.unwrap_err(), LoginError::AuthFailed));
    }
}
