//! Redis presence coordinator (§4.8).
//!
//! Single-role-per-account-per-zone is enforced by one Lua script so the
//! check-then-set never races across Gateways. `RoleSession` is the JSON
//! body stored at `role:{zone}:{role}:session`; `account:{zone}:{uid}:role`
//! is the per-zone uniqueness guard; `account:{uid}:zones` is the owner's
//! inventory of `{zone}:{role}` pairs.

use std::sync::Arc;

use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::PresenceError;

pub const ROLE_SESSION_TTL_SECS: usize = 3600;
pub const KICK_CHANNEL_PREFIX: &str = "kick:role:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSession {
    pub zone_id: String,
    pub role_id: i64,
    pub uid: i64,
    pub gateway_id: String,
    pub session_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickCommand {
    pub role_id: i64,
    pub reason: String,
    pub message: String,
}

fn role_key(zone_id: &str, role_id: i64) -> String {
    format!("role:{zone_id}:{role_id}:session")
}

fn account_role_key(zone_id: &str, uid: i64) -> String {
    format!("account:{zone_id}:{uid}:role")
}

fn account_zones_key(uid: i64) -> String {
    format!("account:{uid}:zones")
}

pub fn kick_channel(role_id: i64) -> String {
    format!("{KICK_CHANNEL_PREFIX}{role_id}")
}

/// Outcome of `register_role_session`: whether a stale session on a
/// different gateway was evicted, and the JSON of that stale record so the
/// caller can target the kick.
pub enum RegisterOutcome {
    Registered { previous_session: Option<RoleSession> },
    RejectedAlreadyOnline { other_role_id: i64 },
}

// KEYS[1]=role_key KEYS[2]=account_role_key KEYS[3]=account_zones_key
// ARGV[1]=role_id ARGV[2]=session_json ARGV[3]=ttl ARGV[4]=zone_role_member
const REGISTER_SCRIPT: &str = r#"
local old_session = redis.call('GET', KEYS[1])
local other_role = redis.call('GET', KEYS[2])
if other_role and other_role ~= ARGV[1] then
  return {-1, other_role}
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[3])
redis.call('SADD', KEYS[3], ARGV[4])
if old_session then
  return {1, old_session}
else
  return {0, ''}
end
"#;

// KEYS[1]=role_key KEYS[2]=account_role_key KEYS[3]=account_zones_key
// ARGV[1]=role_id ARGV[2]=zone_role_member
const UNREGISTER_SCRIPT: &str = r#"
local current_role = redis.call('GET', KEYS[2])
if current_role == ARGV[1] then
  redis.call('DEL', KEYS[2])
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[3], ARGV[2])
return 1
"#;

/// Redis-backed presence coordinator (§4.8). One instance is shared by all
/// Gateway worker tasks; `redis::Client` is cheap to clone and multiplexes
/// connections internally.
pub struct PresenceCoordinator {
    client: redis::Client,
    register_script: Script,
    unregister_script: Script,
}

impl PresenceCoordinator {
    pub fn new(redis_url: &str) -> Result<Arc<Self>, PresenceError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Arc::new(Self {
            client,
            register_script: Script::new(REGISTER_SCRIPT),
            unregister_script: Script::new(UNREGISTER_SCRIPT),
        }))
    }

    pub async fn register_role_session(&self, session: &RoleSession) -> Result<RegisterOutcome, PresenceError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let session_json = serde_json::to_string(session)?;
        let zone_role_member = format!("{}:{}", session.zone_id, session.role_id);

        let result: (i64, String) = self
            .register_script
            .key(role_key(&session.zone_id, session.role_id))
            .key(account_role_key(&session.zone_id, session.uid))
            .key(account_zones_key(session.uid))
            .arg(session.role_id)
            .arg(&session_json)
            .arg(ROLE_SESSION_TTL_SECS)
            .arg(&zone_role_member)
            .invoke_async(&mut conn)
            .await?;

        match result.0 {
            -1 => {
                let other_role_id: i64 = result.1.parse().unwrap_or_default();
                Ok(RegisterOutcome::RejectedAlreadyOnline { other_role_id })
            }
            0 => Ok(RegisterOutcome::Registered { previous_session: None }),
            _ => {
                let previous: RoleSession = serde_json::from_str(&result.1)?;
                Ok(RegisterOutcome::Registered { previous_session: Some(previous) })
            }
        }
    }

    pub async fn unregister_role_session(&self, zone_id: &str, role_id: i64, uid: i64) -> Result<(), PresenceError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let zone_role_member = format!("{zone_id}:{role_id}");
        let _: i64 = self
            .unregister_script
            .key(role_key(zone_id, role_id))
            .key(account_role_key(zone_id, uid))
            .key(account_zones_key(uid))
            .arg(role_id)
            .arg(&zone_role_member)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn publish_kick_command(&self, cmd: &KickCommand) -> Result<(), PresenceError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(cmd)?;
        let _: i64 = conn.publish(kick_channel(cmd.role_id), payload).await?;
        Ok(())
    }

    /// Subscribes to every `kick:role:*` command and invokes `on_kick` for
    /// each one. Runs until the connection drops; callers wrap this in a
    /// reconnect loop the way `gateway::game_stream` does for its own
    /// stream.
    pub async fn subscribe_kicks<F>(&self, on_kick: F) -> Result<(), PresenceError>
    where
        F: Fn(KickCommand) + Send + Sync + 'static,
    {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{KICK_CHANNEL_PREFIX}*")).await?;
        let mut stream = pubsub.on_message();
        use tokio_stream::StreamExt;
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "malformed kick pubsub payload");
                    continue;
                }
            };
            match serde_json::from_str::<KickCommand>(&payload) {
                Ok(cmd) => on_kick(cmd),
                Err(e) => warn!(error = %e, "failed to decode kick command"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_matches_the_documented_pattern() {
        assert_eq!(role_key("z1", 100), "role:z1:100:session");
        assert_eq!(account_role_key("z1", 42), "account:z1:42:role");
        assert_eq!(account_zones_key(42), "account:42:zones");
        assert_eq!(kick_channel(100), "kick:role:100");
    }

    #[test]
    fn role_session_round_trips_through_json() {
        let session = RoleSession {
            zone_id: "z1".into(),
            role_id: 100,
            uid: 42,
            gateway_id: "gw-1".into(),
            session_id: "s1".into(),
            timestamp: 1690000000,
        };
        let json = serde_json::to_string(&session).unwrap();
        let back: RoleSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role_id, 100);
        assert_eq!(back.uid, 42);
    }
}
