// gateway: charging-pile TCP gateway binary.
//
// Staged startup: logging -> config -> database -> shared store -> core
// components -> TCP listener -> status HTTP. Config and database failures
// abort with a diagnostic; a missing redis degrades to local-only sessions.

use gateway::adapters::{AdapterDeps, Ap3000Adapter, BkvAdapter, ProtocolAdapter};
use gateway::config;
use gateway::driver::DriverCore;
use gateway::gateway::mux::ProtocolMux;
use gateway::gateway::GatewayServer;
use gateway::metrics::Metrics;
use gateway::outbound::{OutboundQueue, OutboundWorker};
use gateway::push::{EventPusher, NoopPusher, WebhookPusher};
use gateway::session::{DistRegistry, LocalRegistry, OnlinePolicy, RedisKv, SessionRegistry};
use gateway::status_http::{Readiness, StatusServer};
use gateway::store::{PgStore, Store};
use gw_protocol::ProtocolFamily;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/gateway/gateway.toml".to_owned());
    let cfg = match config::load_config_from_path(Path::new(&config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config '{config_path}': {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config::validate_heartbeat_timeout(&cfg.session) {
        eprintln!("FATAL: invalid config: {e}");
        std::process::exit(1);
    }
    info!(
        server_id = %cfg.server_id,
        tcp_addr = %cfg.tcp.addr,
        family_a = cfg.protocols.enable_a,
        family_b = cfg.protocols.enable_b,
        redis = cfg.redis.enabled,
        "config loaded"
    );

    let metrics = Metrics::new();
    let readiness = Readiness::new(cfg.redis.enabled);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Status HTTP comes up first so orchestrators can watch readiness.
    let _status = match StatusServer::start(
        &cfg.status_http.bind,
        readiness.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            eprintln!("FATAL: status http bind '{}': {e}", cfg.status_http.bind);
            std::process::exit(1);
        }
    };

    // Database: unreachable at startup is a hard abort.
    let pool = match gateway::db::create_pool(&cfg.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("FATAL: database connect: {e}");
            std::process::exit(1);
        }
    };
    if cfg.database.auto_migrate {
        if let Err(e) = gateway::db::run_migrations(&pool).await {
            eprintln!("FATAL: database migrate: {e}");
            std::process::exit(1);
        }
    }
    readiness.set_db_ready(true);
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    // Session registry: shared store when redis is enabled and reachable,
    // local-only (degraded) otherwise.
    let registry: Arc<dyn SessionRegistry> = if cfg.redis.enabled {
        match RedisKv::connect(&cfg.redis).await {
            Ok(kv) => {
                readiness.set_redis_connected(true);
                info!(addr = %cfg.redis.addr, "redis connected, distributed sessions enabled");
                DistRegistry::new(
                    &cfg.server_id,
                    cfg.session.heartbeat_timeout,
                    Arc::new(kv),
                )
            }
            Err(e) => {
                warn!(error = %e, "redis unreachable, falling back to local sessions");
                LocalRegistry::new(&cfg.server_id, cfg.session.heartbeat_timeout)
            }
        }
    } else {
        LocalRegistry::new(&cfg.server_id, cfg.session.heartbeat_timeout)
    };

    let pusher: Arc<dyn EventPusher> = if cfg.push.webhook_url.is_empty() {
        Arc::new(NoopPusher)
    } else {
        WebhookPusher::start(cfg.push.clone(), metrics.clone())
    };
    let sink = DriverCore::new(store.clone(), pusher, cfg.push.push_session_events);

    let queue = OutboundQueue::new(store.clone(), metrics.clone(), cfg.outbound.clone());
    let deps = Arc::new(AdapterDeps {
        sink,
        registry: registry.clone(),
        queue: queue.clone(),
        store: store.clone(),
        metrics: metrics.clone(),
        reason_map: cfg.protocols.reason_map.clone(),
    });

    let mut adapter_list: Vec<Arc<dyn ProtocolAdapter>> = Vec::new();
    let mut adapter_map: HashMap<ProtocolFamily, Arc<dyn ProtocolAdapter>> = HashMap::new();
    if cfg.protocols.enable_a {
        let adapter = Ap3000Adapter::new(deps.clone());
        adapter_map.insert(ProtocolFamily::A, adapter.clone());
        adapter_list.push(adapter);
    }
    if cfg.protocols.enable_b {
        let adapter = BkvAdapter::new(deps.clone());
        adapter_map.insert(ProtocolFamily::B, adapter.clone());
        adapter_list.push(adapter);
    }
    let mux = ProtocolMux::new(adapter_list);

    let online_policy =
        OnlinePolicy::from_config(cfg.session.heartbeat_timeout, &cfg.session.weighted);
    let worker = OutboundWorker::new(
        queue.clone(),
        registry.clone(),
        adapter_map.clone(),
        metrics.clone(),
        online_policy,
    );
    let worker_task = tokio::spawn(worker.run(shutdown_rx.clone()));

    let server = GatewayServer::new(
        cfg.tcp.clone(),
        cfg.limiting.clone(),
        mux,
        registry.clone(),
        metrics.clone(),
    );
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: tcp bind '{}': {e}", cfg.tcp.addr);
            std::process::exit(1);
        }
    };
    readiness.set_tcp_ready(true);
    let accept_task = tokio::spawn(server.run(listener, shutdown_rx.clone()));

    wait_for_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    // Overall drain deadline: components not done in time are abandoned;
    // in-flight outbound rows stay pending for the next process.
    let drain = async {
        let _ = accept_task.await;
        let _ = worker_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        error!("shutdown deadline exceeded, abandoning remaining tasks");
    }
    info!("gateway stopped");
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "SIGTERM handler install failed, ctrl-c only");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = ctrl_c => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
