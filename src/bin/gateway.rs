//! Gateway process entry point (§6 Process surface). Accepts player TCP
//! connections, authenticates and tracks them via [`GatewayHandler`], and
//! forwards gameplay traffic to one assigned Game node over the bidi
//! stream in [`GameStreamConnector`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use xdooria_fabric::app::{Application, Closer, Server};
use xdooria_fabric::backoff::Backoff;
use xdooria_fabric::config::FabricConfig;
use xdooria_fabric::envelope::{Envelope, Framer};
use xdooria_fabric::gateway::{GameStreamConnector, GatewayHandler, SessionManager, SledRoleStore, TokenAuthenticator};
use xdooria_fabric::login::token::TokenSigner;
use xdooria_fabric::metrics;
use xdooria_fabric::opcode::{client::KICK_NOTICE, KickNotice};
use xdooria_fabric::presence::PresenceCoordinator;
use xdooria_fabric::registry::{RedisRegistry, Registrar, ServiceInfo};
use xdooria_fabric::session::run_session;

#[derive(Parser, Debug)]
#[command(name = "xdooria-gateway")]
struct Args {
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,
    #[arg(long = "log.path")]
    log_path: Option<PathBuf>,
}

struct TcpAcceptServer<H: xdooria_fabric::session::SessionHandler + 'static> {
    bind_addr: String,
    framer: Arc<Framer>,
    handler: Arc<H>,
    queue_depth: usize,
}

#[async_trait]
impl<H: xdooria_fabric::session::SessionHandler + 'static> Server for TcpAcceptServer<H> {
    async fn start(&self, lifetime: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "gateway TCP listener bound");

        let framer = self.framer.clone();
        let handler = self.handler.clone();
        let queue_depth = self.queue_depth;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = lifetime.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, remote_addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        let framer = framer.clone();
                        let handler = handler.clone();
                        let child_lifetime = lifetime.clone();
                        tokio::spawn(run_session(stream, remote_addr, framer, handler, child_lifetime, queue_depth));
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {}
}

struct MetricsServer {
    port: u16,
}

#[async_trait]
impl Server for MetricsServer {
    async fn start(&self, _lifetime: CancellationToken) -> anyhow::Result<()> {
        let port = self.port;
        tokio::spawn(metrics::start_metrics_server(port));
        Ok(())
    }
    async fn stop(&self) {}
}

/// Consumes `kick:role:*` pub/sub commands (§4.8 Presence, §8 scenario 4)
/// published by whichever Gateway/Game node won the presence register race
/// for a role already held by one of this Gateway's own sessions, and
/// closes the stale local session the same way a `GAME_KICK_CLIENT` coming
/// down the Game stream does.
struct KickSubscriberServer {
    manager: Arc<SessionManager>,
    presence: Arc<PresenceCoordinator>,
}

#[async_trait]
impl Server for KickSubscriberServer {
    async fn start(&self, lifetime: CancellationToken) -> anyhow::Result<()> {
        let manager = self.manager.clone();
        let presence = self.presence.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(30));
            loop {
                if lifetime.is_cancelled() {
                    break;
                }
                let manager = manager.clone();
                let subscribed = tokio::select! {
                    _ = lifetime.cancelled() => break,
                    result = presence.subscribe_kicks(move |cmd| {
                        if let Some(session) = manager.get_by_role_id(cmd.role_id) {
                            let notice = KickNotice { reason: cmd.reason, message: cmd.message };
                            if let Ok(bytes) = serde_json::to_vec(&notice) {
                                let _ = session.session.send(Envelope::new(KICK_NOTICE, bytes.into()));
                            }
                            session.session.close();
                        }
                    }) => result,
                };
                if let Err(e) = subscribed {
                    warn!(error = %e, "kick subscription dropped, reconnecting");
                }
                tokio::time::sleep(backoff.next_delay()).await;
            }
        });
        Ok(())
    }

    async fn stop(&self) {}
}

struct RegistryCloser {
    registry: Arc<RedisRegistry>,
    service_name: String,
    instance_id: String,
}

#[async_trait]
impl Closer for RegistryCloser {
    async fn close(&self) {
        if let Err(e) = Registrar::deregister(self.registry.as_ref(), &self.service_name, &self.instance_id).await {
            warn!(error = %e, "failed to deregister gateway instance");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).json().init();

    let config = match FabricConfig::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load gateway config");
            std::process::exit(1);
        }
    };

    metrics::register_all().ok();

    let manager = Arc::new(SessionManager::new());
    let connector = GameStreamConnector::new(manager.clone(), config.cluster.node_id.clone(), config.gateway.zone_id.clone(), config.gateway.game_addr.clone());
    connector.clone().spawn_connection_loop();

    let presence = PresenceCoordinator::new(&config.redis.url)?;

    let signer = TokenSigner::new(config.login.token_secret.as_bytes(), config.login.token_ttl_secs);
    let authenticator = Arc::new(TokenAuthenticator::new(signer));
    let roles = Arc::new(SledRoleStore::open(&config.cluster.data_dir)?);

    let handler = Arc::new(GatewayHandler::new(
        manager.clone(),
        authenticator,
        roles,
        connector,
        config.cluster.node_id.clone(),
        config.gateway.zone_id.clone(),
    ));

    let registry = RedisRegistry::new(&config.redis.url)?;
    let instance_id = Uuid::new_v4().to_string();
    let mut metadata = std::collections::HashMap::new();
    metadata.insert("zone_id".to_string(), config.gateway.zone_id.clone());
    Registrar::register(
        registry.as_ref(),
        &instance_id,
        ServiceInfo { name: config.registry.gateway_service_name.clone(), address: config.gateway.bind_addr.clone(), metadata },
    )
    .await?;

    let mut app = Application::new("gateway");
    app.append_server(Box::new(TcpAcceptServer {
        bind_addr: config.gateway.bind_addr.clone(),
        framer: Arc::new(Framer::plain()),
        handler,
        queue_depth: config.gateway.recv_queue_depth,
    }));
    app.append_server(Box::new(MetricsServer { port: config.gateway.metrics_port }));
    app.append_server(Box::new(KickSubscriberServer { manager, presence }));
    app.append_closer(Box::new(RegistryCloser {
        registry,
        service_name: config.registry.gateway_service_name.clone(),
        instance_id,
    }));

    app.run().await?;
    Ok(())
}
