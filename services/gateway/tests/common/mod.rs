//! Shared fixture: a full gateway stack on a loopback listener with the
//! in-memory store, a recording pusher, and a fast outbound worker.
#![allow(dead_code)]

use async_trait::async_trait;
use gateway::adapters::{AdapterDeps, Ap3000Adapter, BkvAdapter, ProtocolAdapter};
use gateway::commands::CommandSender;
use gateway::config::{LimitingConfig, OutboundConfig, TcpConfig};
use gateway::driver::DriverCore;
use gateway::gateway::mux::ProtocolMux;
use gateway::gateway::GatewayServer;
use gateway::metrics::Metrics;
use gateway::outbound::{OutboundQueue, OutboundWorker};
use gateway::push::{EventPusher, PushEvent};
use gateway::session::{LocalRegistry, OnlinePolicy, SessionRegistry};
use gateway::store::MemStore;
use gw_protocol::ProtocolFamily;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

pub struct RecordingPusher {
    events: Mutex<Vec<PushEvent>>,
}

impl RecordingPusher {
    pub fn new() -> Arc<RecordingPusher> {
        Arc::new(RecordingPusher {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }
}

#[async_trait]
impl EventPusher for RecordingPusher {
    async fn push(&self, event: PushEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub addr: SocketAddr,
    pub store: Arc<MemStore>,
    pub registry: Arc<LocalRegistry>,
    pub pusher: Arc<RecordingPusher>,
    pub queue: Arc<OutboundQueue>,
    pub sender: Arc<CommandSender>,
    pub metrics: Arc<Metrics>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub fn fast_outbound() -> OutboundConfig {
    OutboundConfig {
        throttle: Duration::from_millis(0),
        retry_max: 3,
        dead_retention_days: 7,
        batch_size: 50,
        tick: Duration::from_millis(25),
        ack_timeout_sec: 30,
    }
}

/// Spin up listener + worker with the given outbound pacing.
pub async fn start_gateway(outbound: OutboundConfig) -> Harness {
    start_gateway_custom(outbound, 64).await
}

/// Same, with a custom connection cap.
pub async fn start_gateway_custom(outbound: OutboundConfig, max_connections: usize) -> Harness {
    let store: Arc<MemStore> = Arc::new(MemStore::new());
    let metrics = Metrics::new();
    let pusher = RecordingPusher::new();
    let registry = LocalRegistry::new("srv-test", Duration::from_secs(60));
    let queue = OutboundQueue::new(store.clone(), metrics.clone(), outbound);
    let sink = DriverCore::new(store.clone(), pusher.clone(), true);
    let deps = Arc::new(AdapterDeps {
        sink,
        registry: registry.clone(),
        queue: queue.clone(),
        store: store.clone(),
        metrics: metrics.clone(),
        reason_map: HashMap::new(),
    });

    let adapter_a = Ap3000Adapter::new(deps.clone());
    let adapter_b = BkvAdapter::new(deps);
    let mut adapter_map: HashMap<ProtocolFamily, Arc<dyn ProtocolAdapter>> = HashMap::new();
    adapter_map.insert(ProtocolFamily::A, adapter_a.clone());
    adapter_map.insert(ProtocolFamily::B, adapter_b.clone());
    let mux = ProtocolMux::new(vec![adapter_a, adapter_b]);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = OutboundWorker::new(
        queue.clone(),
        registry.clone(),
        adapter_map.clone(),
        metrics.clone(),
        OnlinePolicy::heartbeat_only(Duration::from_secs(60)),
    );
    tokio::spawn(worker.run(shutdown_rx.clone()));

    let tcp = TcpConfig {
        addr: "127.0.0.1:0".to_owned(),
        read_timeout: Duration::from_secs(300),
        ident_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(2),
        max_connections,
    };
    let limiting = LimitingConfig {
        enabled: true,
        rate_per_second: 1000.0,
        rate_burst: 1000,
        breaker_threshold: 5,
        breaker_timeout: Duration::from_millis(100),
        breaker_half_open_max: 4,
        acquire_timeout: Duration::from_millis(200),
    };
    let server = GatewayServer::new(tcp, limiting, mux, registry.clone(), metrics.clone());
    let listener = server.bind().await.expect("loopback bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(server.run(listener, shutdown_rx));

    let sender = CommandSender::new(registry.clone(), adapter_map, queue.clone(), 30);

    Harness {
        addr,
        store,
        registry,
        pusher,
        queue,
        sender,
        metrics,
        shutdown_tx,
    }
}

// ---------------------------------------------------------------------------
// Device-side helpers
// ---------------------------------------------------------------------------

pub struct DeviceClient {
    stream: TcpStream,
}

impl DeviceClient {
    pub async fn connect(addr: SocketAddr) -> DeviceClient {
        let stream = TcpStream::connect(addr).await.expect("device connect");
        DeviceClient { stream }
    }

    pub async fn send(&mut self, frame: &[u8]) {
        self.stream.write_all(frame).await.expect("device write");
    }

    /// Read whatever the gateway sends within `wait`; empty if nothing came.
    pub async fn read_bytes(&mut self, wait: Duration) -> Vec<u8> {
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        let mut buf = [0u8; 2048];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        collected
    }
}

/// Poll `probe` until it returns true or `wait` elapses.
pub async fn eventually<F, Fut>(wait: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
