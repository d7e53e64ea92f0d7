//! Login process entry point (§6 Process surface). Authenticates
//! `LOGIN_REQ` credentials, mints a signed session token, and hands back
//! the address of a Gateway node picked from the service registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use xdooria_fabric::app::{Application, Closer, Server};
use xdooria_fabric::balancer::RoundRobin;
use xdooria_fabric::config::FabricConfig;
use xdooria_fabric::envelope::Framer;
use xdooria_fabric::login::password_auth::PasswordAuthenticator;
use xdooria_fabric::login::session_handler::LoginSessionHandler;
use xdooria_fabric::login::token::TokenSigner;
use xdooria_fabric::login::{LoginAuthenticator, LoginService};
use xdooria_fabric::metrics;
use xdooria_fabric::registry::{RedisRegistry, Registrar, ServiceInfo};
use xdooria_fabric::session::run_session;

#[derive(Parser, Debug)]
#[command(name = "xdooria-login")]
struct Args {
    #[arg(short, long, default_value = "login.yaml")]
    config: PathBuf,
    #[arg(long = "log.path")]
    log_path: Option<PathBuf>,
}

struct LoginAcceptServer {
    bind_addr: String,
    handler: Arc<LoginSessionHandler>,
}

#[async_trait]
impl Server for LoginAcceptServer {
    async fn start(&self, lifetime: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "login TCP listener bound");

        let handler = self.handler.clone();
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
                        let handler = handler.clone();
                        let child_lifetime = lifetime.clone();
                        tokio::spawn(run_session(stream, remote_addr, Arc::new(Framer::plain()), handler, child_lifetime, 16));
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

struct RegistryCloser {
    registry: Arc<RedisRegistry>,
    service_name: String,
    instance_id: String,
}

#[async_trait]
impl Closer for RegistryCloser {
    async fn close(&self) {
        if let Err(e) = Registrar::deregister(self.registry.as_ref(), &self.service_name, &self.instance_id).await {
            warn!(error = %e, "failed to deregister login instance");
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
            error!(error = %e, "failed to load login config");
            std::process::exit(1);
        }
    };

    metrics::register_all().ok();

    let mut authenticators: HashMap<String, Arc<dyn LoginAuthenticator>> = HashMap::new();
    authenticators.insert("password".into(), Arc::new(PasswordAuthenticator::open(&config.cluster.data_dir)?));

    let registry = RedisRegistry::new(&config.redis.url)?;
    let signer = Arc::new(TokenSigner::new(config.login.token_secret.as_bytes(), config.login.token_ttl_secs));

    let service = Arc::new(
        LoginService::new(authenticators, signer, registry.clone(), Arc::new(RoundRobin::default()), config.registry.gateway_service_name.clone()).await,
    );
    let handler = Arc::new(LoginSessionHandler::new(service));

    let instance_id = Uuid::new_v4().to_string();
    Registrar::register(
        registry.as_ref(),
        &instance_id,
        ServiceInfo { name: config.registry.gateway_service_name.clone() + "-login", address: config.login.bind_addr.clone(), metadata: HashMap::new() },
    )
    .await?;

    let mut app = Application::new("login");
    app.append_server(Box::new(LoginAcceptServer { bind_addr: config.login.bind_addr.clone(), handler }));
    app.append_server(Box::new(MetricsServer { port: config.login.metrics_port }));
    app.append_closer(Box::new(RegistryCloser {
        registry,
        service_name: config.registry.gateway_service_name.clone() + "-login",
        instance_id,
    }));

    app.run().await?;
    Ok(())
}
