//! Application harness (§4.10): ordered startup, SIGINT/SIGTERM-driven
//! shutdown, a bounded stop budget, and LIFO teardown of anything that
//! needs to flush or close after every server has stopped.
//!
//! Each binary (`gateway`, `login`, `game`) builds one [`Application`],
//! registers its servers and closers in dependency order, then calls
//! [`Application::run`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("application is already running")]
    AlreadyRunning,
}

/// A long-lived component with an explicit start/stop lifecycle (e.g. the
/// TCP listener, the gRPC server, the metrics HTTP endpoint).
#[async_trait]
pub trait Server: Send + Sync {
    async fn start(&self, lifetime: CancellationToken) -> anyhow::Result<()>;
    /// Preferred over a hard stop when available (e.g. tonic's
    /// `Server::serve_with_shutdown` already drains in-flight RPCs).
    async fn stop(&self);
}

/// Something that needs one last chance to flush or release a resource
/// after every [`Server`] has stopped — closed in reverse registration
/// order (LIFO), matching the teardown-order guarantee §4.10 names.
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self);
}

/// Drives the ordered Start -> block-until-signalled -> Stop -> Close
/// sequence. Double-`run` returns `AlreadyRunning`; double-`shutdown` is a
/// no-op (the second caller's signal/cancel just observes `running` already
/// false).
pub struct Application {
    name: String,
    servers: Vec<Box<dyn Server>>,
    closers: Vec<Box<dyn Closer>>,
    stop_timeout: Duration,
    lifetime: CancellationToken,
    running: AtomicBool,
}

impl Application {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: Vec::new(),
            closers: Vec::new(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            lifetime: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Servers are started in registration order; `shutdown` stops them in
    /// the same order, all within one shared `stop_timeout` budget.
    pub fn append_server(&mut self, server: Box<dyn Server>) {
        self.servers.push(server);
    }

    /// Closed in reverse of registration order once every server is down.
    pub fn append_closer(&mut self, closer: Box<dyn Closer>) {
        self.closers.push(closer);
    }

    pub fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    /// Starts every registered server in order, then blocks until SIGINT,
    /// SIGTERM, or an external cancel of `self.lifetime()` — whichever
    /// comes first — before running `shutdown`.
    pub async fn run(&self) -> Result<(), AppError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(AppError::AlreadyRunning);
        }

        info!(app = %self.name, servers = self.servers.len(), "starting application");
        for server in &self.servers {
            if let Err(e) = server.start(self.lifetime.clone()).await {
                error!(app = %self.name, error = %e, "server failed to start");
            }
        }

        wait_for_shutdown_signal(&self.lifetime).await;
        self.shutdown().await;
        Ok(())
    }

    /// Stops every server concurrently within `stop_timeout`, then closes
    /// every closer in LIFO order. Safe to call more than once — the
    /// second call is a no-op because `lifetime` is already cancelled.
    pub async fn shutdown(&self) {
        if self.lifetime.is_cancelled() {
            return;
        }
        self.lifetime.cancel();

        info!(app = %self.name, timeout_secs = self.stop_timeout.as_secs(), "shutting down application");
        let stop_all = async {
            for server in &self.servers {
                server.stop().await;
            }
        };
        if tokio::time::timeout(self.stop_timeout, stop_all).await.is_err() {
            warn!(app = %self.name, "stop timeout elapsed before all servers reported stopped");
        }

        for closer in self.closers.iter().rev() {
            closer.close().await;
        }
        info!(app = %self.name, "application shut down");
    }
}

async fn wait_for_shutdown_signal(lifetime: &CancellationToken) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending().await
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = lifetime.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingServer {
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Server for CountingServer {
        async fn start(&self, _lifetime: CancellationToken) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct OrderRecordingCloser {
        id: u32,
        order: Arc<parking_lot::Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl Closer for OrderRecordingCloser {
        async fn close(&self) {
            self.order.lock().push(self.id);
        }
    }

    #[tokio::test]
    async fn shutdown_stops_servers_and_closes_closers_in_lifo_order() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut app = Application::new("test-app");
        app.append_server(Box::new(CountingServer { started: started.clone(), stopped: stopped.clone() }));
        app.append_closer(Box::new(OrderRecordingCloser { id: 1, order: order.clone() }));
        app.append_closer(Box::new(OrderRecordingCloser { id: 2, order: order.clone() }));

        for server in &app.servers {
            server.start(app.lifetime()).await.unwrap();
        }
        app.shutdown().await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock(), vec![2, 1]);
    }

    #[tokio::test]
    async fn double_shutdown_is_a_noop() {
        let app = Application::new("test-app");
        app.shutdown().await;
        app.shutdown().await; // must not panic or double-close
    }

    #[tokio::test]
    async fn double_run_returns_already_running() {
        let app = Application::new("test-app");
        app.lifetime().cancel(); // make the first run() return immediately
        app.run().await.unwrap();
        let err = app.run().await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyRunning));
    }
}
