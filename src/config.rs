//! Configuration (§6 Process surface, §A.3): one YAML document per process
//! (`gateway.yaml` / `login.yaml` / `game.yaml`), with every field
//! overridable by an `XDOORIA_`-prefixed environment variable, validated
//! before a binary starts serving traffic, and hot-reloadable via the same
//! file-watch pattern this module's predecessor used for its own YAML
//! config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse YAML config {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("invalid env override for {var}: {message}")]
    InvalidEnvOverride { var: String, message: String },
    #[error("validation failed: {0}")]
    Invalid(String),
}

fn env_override<T>(prefix: &str, field: &str, current: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let var = format!("{prefix}_{field}");
    match std::env::var(&var) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidEnvOverride { var, message: e.to_string() }),
        Err(_) => Ok(current),
    }
}

fn env_override_string(prefix: &str, field: &str, current: String) -> String {
    std::env::var(format!("{prefix}_{field}")).unwrap_or(current)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: "redis://127.0.0.1:6379".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub gateway_service_name: String,
    pub game_service_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { gateway_service_name: "gateway".to_string(), game_service_name: "game".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub node_id: String,
    pub data_dir: PathBuf,
    pub raft_bind_addr: String,
    pub gossip_bind_addr: String,
    pub seed_addrs: Vec<String>,
    pub expect_nodes: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            data_dir: PathBuf::from("./data"),
            raft_bind_addr: "0.0.0.0:9100".to_string(),
            gossip_bind_addr: "0.0.0.0:9200".to_string(),
            seed_addrs: Vec::new(),
            expect_nodes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub zone_id: String,
    pub game_addr: String,
    pub metrics_port: u16,
    pub send_queue_depth: usize,
    pub recv_queue_depth: usize,
    pub task_queue_depth: usize,
    pub heartbeat_interval_secs: u64,
    pub send_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7000".to_string(),
            zone_id: "zone-1".to_string(),
            game_addr: "127.0.0.1:7100".to_string(),
            metrics_port: 9090,
            send_queue_depth: 1024,
            recv_queue_depth: 1024,
            task_queue_depth: 1024,
            heartbeat_interval_secs: 30,
            send_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub bind_addr: String,
    pub token_secret: String,
    pub token_ttl_secs: i64,
    pub metrics_port: u16,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7200".to_string(),
            token_secret: String::new(),
            token_ttl_secs: 3600,
            metrics_port: 9091,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub bind_addr: String,
    pub metrics_port: u16,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self { bind_addr: "0.0.0.0:7100".to_string(), metrics_port: 9092 }
    }
}

/// The root document loaded from `--config`. Every leaf is independently
/// overridable by `XDOORIA_{SECTION}_{FIELD}` (e.g. `XDOORIA_GATEWAY_BIND_ADDR`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FabricConfig {
    pub gateway: GatewayConfig,
    pub login: LoginConfig,
    pub game: GameConfig,
    pub cluster: ClusterConfig,
    pub redis: RedisConfig,
    pub registry: RegistryConfig,
    pub log_path: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

impl FabricConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read { path: path.to_path_buf(), source: e })?;
        let mut config: FabricConfig =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path: path.to_path_buf(), source: e })?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        const P: &str = "XDOORIA";
        self.gateway.bind_addr = env_override_string(P, "GATEWAY_BIND_ADDR", self.gateway.bind_addr.clone());
        self.gateway.zone_id = env_override_string(P, "GATEWAY_ZONE_ID", self.gateway.zone_id.clone());
        self.gateway.game_addr = env_override_string(P, "GATEWAY_GAME_ADDR", self.gateway.game_addr.clone());
        self.gateway.metrics_port = env_override(P, "GATEWAY_METRICS_PORT", self.gateway.metrics_port)?;

        self.login.bind_addr = env_override_string(P, "LOGIN_BIND_ADDR", self.login.bind_addr.clone());
        self.login.token_secret = env_override_string(P, "LOGIN_TOKEN_SECRET", self.login.token_secret.clone());
        self.login.token_ttl_secs = env_override(P, "LOGIN_TOKEN_TTL_SECS", self.login.token_ttl_secs)?;

        self.game.bind_addr = env_override_string(P, "GAME_BIND_ADDR", self.game.bind_addr.clone());

        self.cluster.node_id = env_override_string(P, "CLUSTER_NODE_ID", self.cluster.node_id.clone());
        self.cluster.raft_bind_addr = env_override_string(P, "CLUSTER_RAFT_BIND_ADDR", self.cluster.raft_bind_addr.clone());
        self.cluster.gossip_bind_addr =
            env_override_string(P, "CLUSTER_GOSSIP_BIND_ADDR", self.cluster.gossip_bind_addr.clone());
        self.cluster.expect_nodes = env_override(P, "CLUSTER_EXPECT_NODES", self.cluster.expect_nodes)?;

        self.redis.url = env_override_string(P, "REDIS_URL", self.redis.url.clone());
        Ok(())
    }

    /// Validated before a binary starts serving: catches the config
    /// mistakes that would otherwise surface only as a confusing runtime
    /// failure deep inside the Raft or Redis layer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.login.token_secret.is_empty() {
            return Err(ConfigError::Invalid("login.token_secret must not be empty".into()));
        }
        if self.gateway.zone_id.is_empty() {
            return Err(ConfigError::Invalid("gateway.zone_id must not be empty".into()));
        }
        if self.cluster.expect_nodes == 1 {
            return Err(ConfigError::Invalid(
                "cluster.expect_nodes must be 0 (single-node bootstrap) or >= 2, never 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Hot reload ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReloadEvent {
    pub timestamp: SystemTime,
    pub path: PathBuf,
    pub config: FabricConfig,
    pub error: Option<String>,
}

impl ReloadEvent {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Channel-backed notifier consumers poll (or block on) for reload events,
/// matching the watcher/notifier split this module's config-hot-reload
/// predecessor used.
pub struct ReloadNotifier {
    sender: Sender<ReloadEvent>,
    receiver: Mutex<Receiver<ReloadEvent>>,
}

impl Default for ReloadNotifier {
    fn default() -> Self {
        let (sender, receiver) = channel();
        Self { sender, receiver: Mutex::new(receiver) }
    }
}

impl ReloadNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, event: ReloadEvent) {
        if self.sender.send(event).is_err() {
            error!("reload event receiver dropped");
        }
    }

    pub fn try_recv(&self) -> Option<ReloadEvent> {
        match self.receiver.lock().unwrap().try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Watches `path` for writes and re-parses + re-validates on every change,
/// publishing a [`ReloadEvent`] (successful or not) through `notifier`.
/// Invalid reloads are reported but never applied — the caller decides
/// whether/how to swap in `event.config`.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn start(path: PathBuf, notifier: Arc<ReloadNotifier>) -> notify::Result<Self> {
        let watch_path = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "config watcher error");
                    return;
                }
            };
            if !matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                return;
            }

            let reload = match FabricConfig::from_file(&watch_path) {
                Ok(config) => ReloadEvent { timestamp: now(), path: watch_path.clone(), config, error: None },
                Err(e) => {
                    warn!(path = %watch_path.display(), error = %e, "config reload rejected");
                    ReloadEvent { timestamp: now(), path: watch_path.clone(), config: FabricConfig::default(), error: Some(e.to_string()) }
                }
            };
            info!(path = %watch_path.display(), success = reload.is_success(), "config file changed");
            notifier.notify(reload);
        })?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        Ok(Self { _watcher: watcher })
    }
}

fn now() -> SystemTime {
    SystemTime::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fail_validation_on_empty_token_secret() {
        let config = FabricConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn expect_nodes_of_one_is_rejected() {
        let mut config = FabricConfig::default();
        config.login.token_secret = "s".into();
        config.cluster.expect_nodes = 1;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    #[serial_test::serial]
    fn from_file_applies_env_override_over_yaml_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(&path, "login:\n  token_secret: yaml-secret\ngateway:\n  zone_id: yaml-zone\n").unwrap();

        std::env::set_var("XDOORIA_GATEWAY_ZONE_ID", "env-zone");
        let config = FabricConfig::from_file(&path).unwrap();
        std::env::remove_var("XDOORIA_GATEWAY_ZONE_ID");

        assert_eq!(config.gateway.zone_id, "env-zone");
        assert_eq!(config.login.token_secret, "yaml-secret");
    }
}
