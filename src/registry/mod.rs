//! Service registry (§4.10/§6): an opaque key/value store with watch,
//! etcd-like. Keys live under `/services/{name}/{instance}` and hold
//! `{address, metadata}`. Two capabilities, kept as traits per the
//! "dynamic dispatch for plug-in strategies" design note (§9): `Resolver`
//! (snapshot + watch) and `Registrar` (register/deregister).
//!
//! The production backend is Redis (already a dependency for presence
//! coordination, §4.8): each instance is a key with a short TTL refreshed
//! by a heartbeat task, and `watch` is a poll-and-diff loop over `KEYS
//! services:{name}:*` — simpler than standing up etcd/Consul for a single
//! extra KV use case.

pub mod gossip;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub address: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Current known instances of `name`.
    async fn snapshot(&self, name: &str) -> Vec<ServiceInfo>;
    /// A channel that emits a fresh snapshot whenever membership changes.
    fn watch(&self, name: &str) -> watch::Receiver<Vec<ServiceInfo>>;
}

#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, instance_id: &str, info: ServiceInfo) -> Result<(), redis::RedisError>;
    async fn deregister(&self, name: &str, instance_id: &str) -> Result<(), redis::RedisError>;
}

const INSTANCE_TTL_SECS: u64 = 15;
const POLL_INTERVAL: Duration = Duration::from_secs(5);

fn instance_key(name: &str, instance_id: &str) -> String {
    format!("services:{name}:{instance_id}")
}

/// Redis-backed registry. `register` sets a TTL'd key and spawns a
/// heartbeat refresh task; `watch` spawns a poll-and-diff loop per `name`
/// the first time it's requested and shares the resulting channel with
/// later callers.
pub struct RedisRegistry {
    client: redis::Client,
    watches: parking_lot::Mutex<HashMap<String, watch::Receiver<Vec<ServiceInfo>>>>,
    lifetime: CancellationToken,
}

impl RedisRegistry {
    pub fn new(redis_url: &str) -> Result<Arc<Self>, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Arc::new(Self {
            client,
            watches: parking_lot::Mutex::new(HashMap::new()),
            lifetime: CancellationToken::new(),
        }))
    }

    pub fn shutdown(&self) {
        self.lifetime.cancel();
    }

    async fn scan_snapshot(client: &redis::Client, name: &str) -> Vec<ServiceInfo> {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "registry snapshot: redis connection failed");
                return Vec::new();
            }
        };
        let pattern = format!("services:{name}:*");
        let keys: Vec<String> = conn.keys(pattern).await.unwrap_or_default();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Ok(json) = conn.get::<_, String>(&key).await {
                if let Ok(info) = serde_json::from_str::<ServiceInfo>(&json) {
                    out.push(info);
                }
            }
        }
        out
    }
}

#[async_trait]
impl Registrar for RedisRegistry {
    async fn register(&self, instance_id: &str, info: ServiceInfo) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = instance_key(&info.name, instance_id);
        let json = serde_json::to_string(&info).unwrap_or_default();
        let _: () = conn.set_ex(&key, json.clone(), INSTANCE_TTL_SECS).await?;

        let client = self.client.clone();
        let lifetime = self.lifetime.clone();
        let key_for_task = key.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(INSTANCE_TTL_SECS / 3));
            loop {
                tokio::select! {
                    _ = lifetime.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                            let _: Result<(), _> = conn.expire(&key_for_task, INSTANCE_TTL_SECS as i64).await;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn deregister(&self, name: &str, instance_id: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(instance_key(name, instance_id)).await?;
        Ok(())
    }
}

#[async_trait]
impl Resolver for RedisRegistry {
    async fn snapshot(&self, name: &str) -> Vec<ServiceInfo> {
        Self::scan_snapshot(&self.client, name).await
    }

    fn watch(&self, name: &str) -> watch::Receiver<Vec<ServiceInfo>> {
        if let Some(rx) = self.watches.lock().get(name) {
            return rx.clone();
        }

        let (tx, rx) = watch::channel(Vec::new());
        self.watches.lock().insert(name.to_string(), rx.clone());

        let client = self.client.clone();
        let lifetime = self.lifetime.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut last: Vec<ServiceInfo> = Vec::new();
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = lifetime.cancelled() => break,
                    _ = ticker.tick() => {
                        let current = Self::scan_snapshot(&client, &name).await;
                        if current != last {
                            last = current.clone();
                            let _ = tx.send(current);
                        }
                    }
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_key_matches_documented_layout() {
        assert_eq!(instance_key("gateway", "gw-1"), "services:gateway:gw-1");
    }
}
