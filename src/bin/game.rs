//! Game process entry point (§6 Process surface). Runs the `GameStream`
//! traffic endpoint (on `game.bind_addr`, the address Gateways dial), the
//! `RaftTransport` endpoint (on `cluster.raft_bind_addr`, the address Raft
//! peers dial), the gossip participant bootstrap uses to find peers, and
//! the Autopilot dead-server reconciler.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server as TonicServer;
use tracing::{error, info, warn};
use uuid::Uuid;

use xdooria_fabric::app::{Application, Server};
use xdooria_fabric::config::FabricConfig;
use xdooria_fabric::game::{GameStreamService, RaftTransportService};
use xdooria_fabric::metrics;
use xdooria_fabric::pb::game_stream_server::GameStreamServer;
use xdooria_fabric::pb::raft_transport_server::RaftTransportServer;
use xdooria_fabric::presence::PresenceCoordinator;
use xdooria_fabric::raft::{self, membership};
use xdooria_fabric::registry::gossip::GossipMembership;
use xdooria_fabric::registry::{RedisRegistry, Registrar, ServiceInfo};
use xdooria_fabric::router::Router;

#[derive(Parser, Debug)]
#[command(name = "xdooria-game")]
struct Args {
    #[arg(short, long, default_value = "game.yaml")]
    config: PathBuf,
    #[arg(long = "log.path")]
    log_path: Option<PathBuf>,
}

/// Serves `GameStream` on `game.bind_addr` — the address Gateways dial.
struct GameStreamServerTask {
    bind_addr: String,
    game_stream: GameStreamService,
}

#[async_trait]
impl Server for GameStreamServerTask {
    async fn start(&self, lifetime: CancellationToken) -> anyhow::Result<()> {
        let addr = self.bind_addr.parse()?;
        let game_stream = self.game_stream.clone();

        tokio::spawn(async move {
            let shutdown = async move { lifetime.cancelled().await };
            let result = TonicServer::builder().add_service(GameStreamServer::new(game_stream)).serve_with_shutdown(addr, shutdown).await;
            if let Err(e) = result {
                warn!(error = %e, "game stream server exited with error");
            }
        });
        Ok(())
    }

    async fn stop(&self) {}
}

/// Serves `RaftTransport` on `cluster.raft_bind_addr` — a separate listener
/// from the Gateway-facing `GameStream` endpoint, bound to the address
/// gossip/bootstrap advertise as this node's Raft peer address.
struct RaftTransportServerTask {
    bind_addr: String,
    raft_transport: Arc<RaftTransportService>,
}

#[async_trait]
impl Server for RaftTransportServerTask {
    async fn start(&self, lifetime: CancellationToken) -> anyhow::Result<()> {
        let addr = self.bind_addr.parse()?;
        let raft_transport = self.raft_transport.clone();

        tokio::spawn(async move {
            let shutdown = async move { lifetime.cancelled().await };
            let result =
                TonicServer::builder().add_service(RaftTransportServer::from_arc(raft_transport)).serve_with_shutdown(addr, shutdown).await;
            if let Err(e) = result {
                warn!(error = %e, "raft transport server exited with error");
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).json().init();

    let config = match FabricConfig::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load game config");
            std::process::exit(1);
        }
    };

    metrics::register_all().ok();

    let node_uuid = raft::load_or_create_node_id(&config.cluster.data_dir)?;
    let self_id = raft::node_id_from_str(&node_uuid.to_string());

    let gossip_addr = config.cluster.gossip_bind_addr.parse()?;
    let raft_addr = config.cluster.raft_bind_addr.parse()?;
    let gossip = Arc::new(
        GossipMembership::spawn(node_uuid.to_string(), gossip_addr, raft_addr, config.cluster.seed_addrs.clone()).await?,
    );

    let raft_node = raft::start_raft_node(&config.cluster.data_dir, self_id, gossip.clone(), openraft::Config::default()).await?;

    let self_node = raft::Node { addr: config.cluster.raft_bind_addr.clone() };
    if config.cluster.expect_nodes == 0 {
        membership::bootstrap_single(&raft_node.raft, self_id, self_node).await?;
        info!("bootstrapped as single-node raft cluster");
    } else {
        match membership::bootstrap_expect(&raft_node.raft, self_id, self_node, &gossip, config.cluster.expect_nodes).await {
            Ok(()) => info!(expect_nodes = config.cluster.expect_nodes, "bootstrapped multi-node raft cluster"),
            Err(e) => warn!(error = %e, "raft bootstrap did not complete (may not be this node's turn to bootstrap)"),
        }
    }

    let presence = PresenceCoordinator::new(&config.redis.url)?;
    let game_stream = GameStreamService::new(config.gateway.zone_id.clone(), presence, Router::new());
    let raft_transport = Arc::new(RaftTransportService::new(raft_node.clone()));

    let registry = RedisRegistry::new(&config.redis.url)?;
    let instance_id = Uuid::new_v4().to_string();
    Registrar::register(
        registry.as_ref(),
        &instance_id,
        ServiceInfo { name: config.registry.game_service_name.clone(), address: config.game.bind_addr.clone(), metadata: Default::default() },
    )
    .await?;

    let mut app = Application::new("game");
    app.append_server(Box::new(GameStreamServerTask { bind_addr: config.game.bind_addr.clone(), game_stream }));
    app.append_server(Box::new(RaftTransportServerTask { bind_addr: config.cluster.raft_bind_addr.clone(), raft_transport }));
    app.append_server(Box::new(MetricsServer { port: config.game.metrics_port }));

    tokio::spawn(raft::autopilot::run(
        raft_node.raft.clone(),
        self_id,
        gossip.clone(),
        raft::autopilot::AutopilotConfig::default(),
        app.lifetime(),
    ));

    app.run().await?;
    Ok(())
}
