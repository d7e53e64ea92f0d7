//! Production [`RoleStore`](super::handler::RoleStore): role rows
//! persisted in `sled` (the same embedded store the Raft log uses, §4.9),
//! under `{data_dir}/roles.db`. Nickname uniqueness is enforced
//! account-globally via a dedicated `nickname -> ()` tree so
//! `nickname_exists` never requires a full scan.
//!
//! Role rows are Gateway-local, per-process state — not replicated. A
//! production deployment would put this behind the same Raft-replicated
//! state machine the rest of the cluster uses; kept as a local store here
//! because role storage's replication story is out of scope.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gateway::handler::RoleStore;
use crate::opcode::RoleSummary;

const TREE_ROLES: &str = "roles";
const TREE_NICKNAMES: &str = "nicknames";
const TREE_OWNERSHIP: &str = "ownership";

#[derive(Debug, Serialize, Deserialize)]
struct RoleRow {
    role_id: i64,
    uid: i64,
    nickname: String,
    gender: u8,
    appearance: String,
}

pub struct SledRoleStore {
    roles: sled::Tree,
    nicknames: sled::Tree,
    ownership: sled::Tree,
    next_role_id: AtomicI64,
}

impl SledRoleStore {
    pub fn open(data_dir: &std::path::Path) -> anyhow::Result<Self> {
        let db = sled::open(data_dir.join("roles.db"))?;
        let roles = db.open_tree(TREE_ROLES)?;
        let nicknames = db.open_tree(TREE_NICKNAMES)?;
        let ownership = db.open_tree(TREE_OWNERSHIP)?;

        let next_role_id = roles
            .iter()
            .keys()
            .filter_map(Result::ok)
            .filter_map(|k| k.as_ref().try_into().ok().map(i64::from_be_bytes))
            .max()
            .map(|m| m + 1)
            .unwrap_or(1);

        Ok(Self { roles, nicknames, ownership, next_role_id: AtomicI64::new(next_role_id) })
    }
}

fn to_summary(row: &RoleRow) -> RoleSummary {
    RoleSummary {
        role_id: row.role_id,
        nickname: row.nickname.clone(),
        gender: row.gender,
        appearance: row.appearance.clone(),
    }
}

#[async_trait]
impl RoleStore for SledRoleStore {
    async fn list_roles(&self, uid: i64) -> Vec<RoleSummary> {
        let prefix = format!("{uid}:");
        self.ownership
            .scan_prefix(prefix.as_bytes())
            .filter_map(Result::ok)
            .filter_map(|(_, role_id_bytes)| {
                let role_id = i64::from_be_bytes(role_id_bytes.as_ref().try_into().ok()?);
                self.roles.get(role_id.to_be_bytes()).ok().flatten()
            })
            .filter_map(|bytes| serde_json::from_slice::<RoleRow>(&bytes).ok())
            .map(|row| to_summary(&row))
            .collect()
    }

    async fn nickname_exists(&self, nickname: &str) -> bool {
        self.nicknames.contains_key(nickname.as_bytes()).unwrap_or(false)
    }

    async fn create_role(&self, uid: i64, nickname: String, gender: u8, appearance: String) -> RoleSummary {
        let role_id = self.next_role_id.fetch_add(1, Ordering::SeqCst);
        let row = RoleRow { role_id, uid, nickname: nickname.clone(), gender, appearance };

        let encoded = serde_json::to_vec(&row).unwrap_or_default();
        let _ = self.roles.insert(role_id.to_be_bytes(), encoded);
        let _ = self.nicknames.insert(nickname.as_bytes(), &[]);
        let _ = self.ownership.insert(format!("{uid}:{role_id}").as_bytes(), role_id.to_be_bytes().to_vec());

        to_summary(&row)
    }

    async fn owns_role(&self, uid: i64, role_id: i64) -> bool {
        self.ownership.contains_key(format!("{uid}:{role_id}").as_bytes()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_role_is_listed_and_owned() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledRoleStore::open(dir.path()).unwrap();

        let summary = store.create_role(42, "alice".into(), 0, "".into()).await;
        assert!(store.nickname_exists("alice").await);
        assert!(store.owns_role(42, summary.role_id).await);
        assert_eq!(store.list_roles(42).await.len(), 1);
        assert!(!store.owns_role(99, summary.role_id).await);
    }
}
