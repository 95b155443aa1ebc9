//! Status HTTP listener.
//!
//! - `GET /healthz` — always 200 (process is running)
//! - `GET /readyz`  — 200 once DB and the TCP listener are up, 503 with a
//!   reason otherwise; reports `degraded` when redis is configured off or
//!   unreachable (the gateway keeps serving local-only)
//! - `GET /metrics` — Prometheus text exposition
//!
//! Readiness reflects this instance's own prerequisites only.

use crate::metrics::Metrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

// ---------------------------------------------------------------------------
// Readiness state
// ---------------------------------------------------------------------------

pub struct Readiness {
    db_ready: AtomicBool,
    tcp_ready: AtomicBool,
    redis_enabled: bool,
    redis_connected: AtomicBool,
}

impl Readiness {
    pub fn new(redis_enabled: bool) -> Arc<Readiness> {
        Arc::new(Readiness {
            db_ready: AtomicBool::new(false),
            tcp_ready: AtomicBool::new(false),
            redis_enabled,
            redis_connected: AtomicBool::new(false),
        })
    }

    pub fn set_db_ready(&self, ready: bool) {
        self.db_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_tcp_ready(&self, ready: bool) {
        self.tcp_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_redis_connected(&self, connected: bool) {
        self.redis_connected.store(connected, Ordering::SeqCst);
    }

    fn report(&self) -> (bool, String) {
        let db = self.db_ready.load(Ordering::SeqCst);
        let tcp = self.tcp_ready.load(Ordering::SeqCst);
        if !db {
            return (false, "database not ready".to_owned());
        }
        if !tcp {
            return (false, "tcp listener not ready".to_owned());
        }
        if !self.redis_enabled {
            return (true, "ready (degraded: redis disabled)".to_owned());
        }
        if !self.redis_connected.load(Ordering::SeqCst) {
            return (true, "ready (degraded: redis unreachable)".to_owned());
        }
        (true, "ready".to_owned())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct HttpState {
    readiness: Arc<Readiness>,
    metrics: Arc<Metrics>,
}

pub struct StatusServer {
    local_addr: SocketAddr,
}

impl StatusServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn start(
        bind: &str,
        readiness: Arc<Readiness>,
        metrics: Arc<Metrics>,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<StatusServer> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;

        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .route("/metrics", get(metrics_text))
            .with_state(HttpState { readiness, metrics });

        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "status http server failed");
            }
        });

        info!(addr = %local_addr, "status http listening");
        Ok(StatusServer { local_addr })
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<HttpState>) -> impl IntoResponse {
    let (ready, reason) = state.readiness.report();
    if ready {
        (StatusCode::OK, reason)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, reason)
    }
}

async fn metrics_text(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
