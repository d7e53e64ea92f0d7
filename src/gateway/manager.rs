//! Session manager (§3 Session index, §4.4).
//!
//! Three indices behind a single reader-writer lock:
//!   `by_session`: session-id -> GatewaySession (authoritative)
//!   `by_uid`:     uid -> set<session-id>        (only while authenticated)
//!   `by_role`:    role-id -> session-id          (only while role_selected)
//!
//! Readers never hold the lock while invoking handlers (§5 Locking
//! discipline); all three indices are mutated together under one writer
//! acquisition so Register/Unregister/UpdateAuthState/UpdateRoleState are
//! each atomic with respect to concurrent lookups.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::errors::ManagerError;
use crate::gateway::session::GatewaySession;
use crate::session::Session;

#[derive(Default)]
struct Indices {
    by_session: HashMap<Uuid, Arc<GatewaySession>>,
    by_uid: HashMap<i64, HashSet<Uuid>>,
    by_role: HashMap<i64, Uuid>,
}

/// The authoritative registry of connected Gateway sessions (§4.4). All
/// operations are O(1) average; the lock is held only for the duration of
/// the index mutation/lookup itself.
#[derive(Default)]
pub struct SessionManager {
    indices: RwLock<Indices>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) -> Arc<GatewaySession> {
        let gs = Arc::new(GatewaySession::new(session));
        let mut w = self.indices.write();
        w.by_session.insert(gs.id(), gs.clone());
        gs
    }

    /// Removes the session from all three indices atomically. A concurrent
    /// second unregister on the same id finds nothing left to remove and
    /// simply returns (first caller wins, §3).
    pub fn unregister(&self, id: Uuid) {
        let mut w = self.indices.write();
        if let Some(gs) = w.by_session.remove(&id) {
            let uid = gs.uid();
            if gs.is_authenticated() {
                if let Some(set) = w.by_uid.get_mut(&uid) {
                    set.remove(&id);
                    if set.is_empty() {
                        w.by_uid.remove(&uid);
                    }
                }
            }
            if gs.is_role_selected() {
                let role_id = gs.role_id();
                if w.by_role.get(&role_id) == Some(&id) {
                    w.by_role.remove(&role_id);
                }
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<GatewaySession>> {
        self.indices.read().by_session.get(&id).cloned()
    }

    /// Sets `authenticated=true`, `uid=uid`, and inserts into `by_uid`.
    /// Fails with `SessionNotFound` if the session isn't registered (§4.4).
    pub fn update_auth_state(&self, id: Uuid, uid: i64) -> Result<(), ManagerError> {
        let mut w = self.indices.write();
        let gs = w
            .by_session
            .get(&id)
            .cloned()
            .ok_or(ManagerError::SessionNotFound)?;
        gs.set_authenticated(uid);
        w.by_uid.entry(uid).or_default().insert(id);
        Ok(())
    }

    /// Requires `authenticated`; if a previous role was selected its
    /// `by_role` entry is removed first, then the new role is inserted
    /// (§4.4).
    pub fn update_role_state(&self, id: Uuid, role_id: i64) -> Result<(), ManagerError> {
        let mut w = self.indices.write();
        let gs = w
            .by_session
            .get(&id)
            .cloned()
            .ok_or(ManagerError::SessionNotFound)?;
        if !gs.is_authenticated() {
            return Err(ManagerError::NotAuthenticated);
        }
        if gs.is_role_selected() {
            let old_role = gs.role_id();
            if w.by_role.get(&old_role) == Some(&id) {
                w.by_role.remove(&old_role);
            }
        }
        gs.set_role(role_id);
        w.by_role.insert(role_id, id);
        Ok(())
    }

    pub fn get_by_uid(&self, uid: i64) -> Vec<Arc<GatewaySession>> {
        let r = self.indices.read();
        r.by_uid
            .get(&uid)
            .into_iter()
            .flatten()
            .filter_map(|id| r.by_session.get(id).cloned())
            .collect()
    }

    pub fn get_by_role_id(&self, role_id: i64) -> Option<Arc<GatewaySession>> {
        let r = self.indices.read();
        let id = r.by_role.get(&role_id)?;
        r.by_session.get(id).cloned()
    }

    /// Every role-selected session known to this Gateway; used for the
    /// fleet-wide `GAME_BROADCAST` with empty `role_ids` (§C.3).
    pub fn all_role_selected(&self) -> Vec<Arc<GatewaySession>> {
        let r = self.indices.read();
        r.by_role.values().filter_map(|id| r.by_session.get(id).cloned()).collect()
    }

    pub fn count(&self) -> usize {
        self.indices.read().by_session.len()
    }

    pub fn online_user_count(&self) -> usize {
        self.indices.read().by_uid.len()
    }

    pub fn online_role_count(&self) -> usize {
        self.indices.read().by_role.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::detached_session;

    fn registered(mgr: &SessionManager) -> Uuid {
        let (session, _rx) = detached_session(4);
        let gs = mgr.register(Arc::new(session));
        gs.id()
    }

    #[test]
    fn register_then_unregister_restores_pre_register_state() {
        let mgr = SessionManager::new();
        assert_eq!(mgr.count(), 0);
        let id = registered(&mgr);
        mgr.update_auth_state(id, 42).unwrap();
        mgr.update_role_state(id, 100).unwrap();
        assert_eq!(mgr.count(), 1);
        assert_eq!(mgr.online_user_count(), 1);
        assert_eq!(mgr.online_role_count(), 1);

        mgr.unregister(id);
        assert_eq!(mgr.count(), 0);
        assert_eq!(mgr.online_user_count(), 0);
        assert_eq!(mgr.online_role_count(), 0);
        assert!(mgr.get(id).is_none());
        assert!(mgr.get_by_uid(42).is_empty());
        assert!(mgr.get_by_role_id(100).is_none());
    }

    #[test]
    fn update_role_state_without_auth_fails() {
        let mgr = SessionManager::new();
        let id = registered(&mgr);
        let err = mgr.update_role_state(id, 100).unwrap_err();
        assert_eq!(err, ManagerError::NotAuthenticated);
    }

    #[test]
    fn reselecting_role_moves_by_role_entry() {
        let mgr = SessionManager::new();
        let id = registered(&mgr);
        mgr.update_auth_state(id, 42).unwrap();
        mgr.update_role_state(id, 100).unwrap();
        mgr.update_role_state(id, 200).unwrap();
        assert!(mgr.get_by_role_id(100).is_none());
        assert_eq!(mgr.get_by_role_id(200).unwrap().id(), id);
    }

    #[test]
    fn unknown_session_operations_fail_cleanly() {
        let mgr = SessionManager::new();
        let bogus = Uuid::new_v4();
        assert_eq!(
            mgr.update_auth_state(bogus, 1).unwrap_err(),
            ManagerError::SessionNotFound
        );
    }
}
