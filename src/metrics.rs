//! Prometheus metrics (§A.6). Registries are static, namespaced through the
//! `METRIC_NAMESPACE` env var the same way as every other service here.

use std::env;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "xdooria_fabric".to_string());

    // === Gateway ===

    pub static ref SESSIONS_OPEN: IntGauge =
        IntGauge::with_opts(Opts::new("gateway_sessions_open", "Currently open Gateway sessions")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();

    pub static ref SESSIONS_AUTHENTICATED: IntGauge =
        IntGauge::with_opts(Opts::new("gateway_sessions_authenticated", "Authenticated sessions")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();

    pub static ref SESSIONS_ROLE_SELECTED: IntGauge =
        IntGauge::with_opts(Opts::new("gateway_sessions_role_selected", "Role-selected sessions")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();

    pub static ref ENVELOPES_DROPPED_TOTAL: IntCounterVec =
        IntCounterVec::new(Opts::new("gateway_envelopes_dropped_total", "Envelopes dropped due to backpressure")
            .namespace(METRIC_NAMESPACE.as_str()), &["reason"]).unwrap();

    // === Login ===

    pub static ref LOGIN_ATTEMPTS_TOTAL: IntCounterVec =
        IntCounterVec::new(Opts::new("login_attempts_total", "Login attempts by outcome")
            .namespace(METRIC_NAMESPACE.as_str()), &["outcome"]).unwrap();

    pub static ref LOGIN_LATENCY_SECONDS: Histogram =
        Histogram::with_opts(HistogramOpts::new("login_latency_seconds", "Login request latency")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();

    // === Raft ===

    pub static ref RAFT_TERM: IntGauge =
        IntGauge::with_opts(Opts::new("raft_term", "Current Raft term")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();

    pub static ref RAFT_APPLIED_INDEX: IntGauge =
        IntGauge::with_opts(Opts::new("raft_applied_index", "Last applied log index")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();

    pub static ref RAFT_SNAPSHOTS_TOTAL: IntCounterVec =
        IntCounterVec::new(Opts::new("raft_snapshots_total", "Snapshots taken, by codec")
            .namespace(METRIC_NAMESPACE.as_str()), &["codec"]).unwrap();
}

/// Registers every metric above with the default registry. Call once at
/// process startup before binding the metrics listener.
pub fn register_all() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(SESSIONS_OPEN.clone()))?;
    registry.register(Box::new(SESSIONS_AUTHENTICATED.clone()))?;
    registry.register(Box::new(SESSIONS_ROLE_SELECTED.clone()))?;
    registry.register(Box::new(ENVELOPES_DROPPED_TOTAL.clone()))?;
    registry.register(Box::new(LOGIN_ATTEMPTS_TOTAL.clone()))?;
    registry.register(Box::new(LOGIN_LATENCY_SECONDS.clone()))?;
    registry.register(Box::new(RAFT_TERM.clone()))?;
    registry.register(Box::new(RAFT_APPLIED_INDEX.clone()))?;
    registry.register(Box::new(RAFT_SNAPSHOTS_TOTAL.clone()))?;
    Ok(())
}

async fn metrics_handler(_req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    Ok(Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap())
}

/// Serves `/metrics` on `port` until the process exits. Every binary
/// (gateway/login/game) starts one of these alongside its main listener.
pub async fn start_metrics_server(port: u16) {
    let addr = ([0, 0, 0, 0], port).into();
    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, hyper::Error>(service_fn(metrics_handler))
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port, "metrics server listening");
    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

pub fn gather_metrics_string() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!(error = %e, "metrics encoding produced invalid utf8");
        String::new()
    })
}
