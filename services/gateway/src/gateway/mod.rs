//! TCP gateway: listener, admission, per-connection loops.
//!
//! One task per connection runs the read loop, a second drains the write
//! queue. The admission permit is released only after both loops finish,
//! so the connection cap counts sockets that are truly gone as free.

use crate::admission::{CircuitBreaker, ConnLimiter, RateLimiter};
use crate::config::{LimitingConfig, TcpConfig};
use crate::gateway::conn::{run_write_loop, ConnContext, ConnWriter};
use crate::gateway::mux::ProtocolMux;
use crate::metrics::Metrics;
use crate::session::SessionRegistry;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub mod conn;
pub mod mux;

/// Back-off after a transient accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

const READ_BUF_SIZE: usize = 4096;

pub struct GatewayServer {
    tcp: TcpConfig,
    limiting: LimitingConfig,
    mux: Arc<ProtocolMux>,
    registry: Arc<dyn SessionRegistry>,
    limiter: Arc<ConnLimiter>,
    rate: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    next_conn_id: AtomicU64,
}

impl GatewayServer {
    pub fn new(
        tcp: TcpConfig,
        limiting: LimitingConfig,
        mux: Arc<ProtocolMux>,
        registry: Arc<dyn SessionRegistry>,
        metrics: Arc<Metrics>,
    ) -> Arc<GatewayServer> {
        let limiter = ConnLimiter::new(tcp.max_connections, limiting.acquire_timeout);
        let rate = RateLimiter::new(limiting.rate_per_second, limiting.rate_burst);
        let breaker_metrics = metrics.clone();
        let breaker = Arc::new(
            CircuitBreaker::new(
                limiting.breaker_threshold,
                limiting.breaker_timeout,
                limiting.breaker_half_open_max,
            )
            .with_transition_hook(move |_, to| {
                breaker_metrics
                    .breaker_transition_total
                    .with_label_values(&[to.as_str()])
                    .inc();
            }),
        );
        Arc::new(GatewayServer {
            tcp,
            limiting,
            mux,
            registry,
            limiter,
            rate,
            breaker,
            metrics,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn listen_addr(&self) -> &str {
        &self.tcp.addr
    }

    /// Bind the listener. Separate from `run` so startup can hard-fail on a
    /// bind error before anything else spins up.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.tcp.addr).await
    }

    /// Accept loop; returns when shutdown flips.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) {
        info!(addr = %self.tcp.addr, "gateway listening");
        let mut shutdown_rx = shutdown.clone();
        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("accept loop stopping");
                        return;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            self.metrics.tcp_accept_total.inc();
                            self.admit(socket, peer, shutdown.clone()).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed, backing off");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    /// Apply the admission gates and spawn the connection task. A denied
    /// socket is dropped on the spot, which closes it.
    async fn admit(
        self: &Arc<Self>,
        socket: TcpStream,
        peer: std::net::SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        if self.limiting.enabled {
            if !self.rate.allow() {
                self.metrics
                    .conn_rejected_total
                    .with_label_values(&["rate"])
                    .inc();
                debug!(%peer, "connection rate-limited");
                return;
            }
            if !self.breaker.allow() {
                self.metrics
                    .conn_rejected_total
                    .with_label_values(&["breaker"])
                    .inc();
                debug!(%peer, "connection denied by open breaker");
                return;
            }
        }
        let permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                self.metrics
                    .conn_rejected_total
                    .with_label_values(&["limit"])
                    .inc();
                warn!(%peer, "connection limit saturated");
                return;
            }
        };
        self.metrics.conn_active.set(self.limiter.active_count() as i64);

        let server = self.clone();
        tokio::spawn(async move {
            server.handle_connection(socket, peer, shutdown).await;
            // Permit released only after both loops are done.
            drop(permit);
            server
                .metrics
                .conn_active
                .set(server.limiter.active_count() as i64);
        });
    }

    async fn handle_connection(
        self: &Arc<Self>,
        socket: TcpStream,
        peer: std::net::SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        debug!(conn_id, %peer, "connection opened");

        let (read_half, write_half) = socket.into_split();
        let (conn, write_rx) = ConnContext::new(conn_id, peer, self.tcp.write_timeout);

        let (done_tx, done_rx) = watch::channel(false);
        let write_timeout = self.tcp.write_timeout;
        let writer = tokio::spawn(run_write_loop(write_half, write_rx, write_timeout, done_rx));

        self.read_loop(read_half, conn.clone(), &mut shutdown).await;

        // Teardown: stop new sends, let the write loop drain, then record
        // the disconnect against the session ledger.
        conn.mark_closed();
        let _ = done_tx.send(true);
        let _ = writer.await;

        if let Some(device_id) = conn.device_id() {
            let now = Utc::now();
            self.registry.on_tcp_closed(&device_id, now).await;
            self.registry.unbind(&device_id, conn_id).await;
            self.metrics
                .session_offline_total
                .with_label_values(&["tcp_down"])
                .inc();
            info!(conn_id, device_id = %device_id, "device connection closed");
        } else {
            debug!(conn_id, "unidentified connection closed");
        }
    }

    /// Two timeout regimes: a short identification window until the first
    /// bytes arrive, then the long-lived read deadline (a timeout there
    /// merely refreshes the deadline).
    async fn read_loop(
        self: &Arc<Self>,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        conn: Arc<ConnContext>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut mux_conn = self.mux.for_conn(conn.clone());
        let mut identified = false;
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let idle = if identified {
                self.tcp.read_timeout
            } else {
                self.tcp.ident_timeout
            };
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(conn_id = conn.conn_id(), "read loop stopping for shutdown");
                        return;
                    }
                }
                read = tokio::time::timeout(idle, read_half.read(&mut buf)) => {
                    match read {
                        Err(_) if !identified => {
                            debug!(conn_id = conn.conn_id(), "no bytes within identification window");
                            return;
                        }
                        Err(_) => continue,
                        Ok(Ok(0)) => {
                            debug!(conn_id = conn.conn_id(), "peer closed");
                            return;
                        }
                        Ok(Ok(n)) => {
                            identified = true;
                            self.metrics.tcp_bytes_received_total.inc_by(n as u64);
                            match mux_conn.on_read(&buf[..n]).await {
                                Ok(()) => self.breaker.record_success(),
                                Err(e) => {
                                    self.breaker.record_failure();
                                    warn!(conn_id = conn.conn_id(), error = %e, "protocol hand-off failed");
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            debug!(conn_id = conn.conn_id(), error = %e, "read error");
                            return;
                        }
                    }
                }
            }
        }
    }
}

