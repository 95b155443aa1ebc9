//! Two-instance session routing over the shared store: the owner's worker
//! sends, the other instance defers.

mod common;

use async_trait::async_trait;
use common::RecordingPusher;
use gateway::adapters::{AdapterDeps, BkvAdapter, ProtocolAdapter};
use gateway::commands::{CommandSender, CommandSource};
use gateway::config::OutboundConfig;
use gateway::driver::DriverCore;
use gateway::gateway::conn::{ConnError, ConnWriter};
use gateway::metrics::Metrics;
use gateway::outbound::{OutboundQueue, OutboundWorker};
use gateway::session::{ConnLookup, DistRegistry, MemKv, OnlinePolicy, SessionRegistry};
use gateway::store::{MemStore, OutboundStatus, Store};
use gw_protocol::{CoreCommand, ProtocolFamily};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEVICE: &str = "82241218000382";

struct RecordingConn {
    id: u64,
    frames: Mutex<Vec<Vec<u8>>>,
}

impl RecordingConn {
    fn new(id: u64) -> Arc<RecordingConn> {
        Arc::new(RecordingConn {
            id,
            frames: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnWriter for RecordingConn {
    fn conn_id(&self) -> u64 {
        self.id
    }
    fn family(&self) -> Option<ProtocolFamily> {
        Some(ProtocolFamily::B)
    }
    fn is_closed(&self) -> bool {
        false
    }
    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), ConnError> {
        self.frames.lock().unwrap().push(bytes);
        Ok(())
    }
}

struct Instance {
    registry: Arc<DistRegistry>,
    worker: OutboundWorker,
    sender: Arc<CommandSender>,
}

fn outbound_cfg() -> OutboundConfig {
    OutboundConfig {
        throttle: Duration::from_millis(0),
        retry_max: 3,
        dead_retention_days: 7,
        batch_size: 20,
        tick: Duration::from_millis(20),
        ack_timeout_sec: 30,
    }
}

/// One gateway instance sharing the queue store and the session kv.
fn instance(server_id: &str, store: Arc<MemStore>, kv: Arc<MemKv>) -> Instance {
    let metrics = Metrics::new();
    let registry = DistRegistry::new(server_id, Duration::from_secs(60), kv);
    let queue = OutboundQueue::new(store.clone() as Arc<dyn Store>, metrics.clone(), outbound_cfg());
    let sink = DriverCore::new(
        store.clone() as Arc<dyn Store>,
        RecordingPusher::new(),
        true,
    );
    let deps = Arc::new(AdapterDeps {
        sink,
        registry: registry.clone(),
        queue: queue.clone(),
        store: store as Arc<dyn Store>,
        metrics: metrics.clone(),
        reason_map: HashMap::new(),
    });
    let adapter = BkvAdapter::new(deps);
    let mut adapters: HashMap<ProtocolFamily, Arc<dyn ProtocolAdapter>> = HashMap::new();
    adapters.insert(ProtocolFamily::B, adapter);
    let worker = OutboundWorker::new(
        queue.clone(),
        registry.clone(),
        adapters.clone(),
        metrics,
        OnlinePolicy::heartbeat_only(Duration::from_secs(60)),
    );
    let sender = CommandSender::new(registry.clone(), adapters, queue, 30);
    Instance {
        registry,
        worker,
        sender,
    }
}

#[tokio::test]
async fn command_issued_on_one_instance_is_sent_by_the_owner() {
    let store = Arc::new(MemStore::new());
    let kv = MemKv::new();
    let mut instance_a = instance("srv-a", store.clone(), kv.clone());
    let mut instance_b = instance("srv-b", store.clone(), kv.clone());

    // Device X is connected to instance A.
    let conn = RecordingConn::new(101);
    instance_a
        .registry
        .bind(DEVICE, conn.clone(), ProtocolFamily::B, chrono::Utc::now())
        .await;

    // Instance B resolves the device as remote, owned by A.
    match instance_b.registry.get_conn(DEVICE).await {
        ConnLookup::Remote { server_id, conn_id } => {
            assert_eq!(server_id, "srv-a");
            assert_eq!(conn_id, 101);
        }
        _ => panic!("expected remote ownership"),
    }

    // The HTTP plane hits instance B; the command lands in the shared queue.
    let id = instance_b
        .sender
        .send_core_command(CoreCommand::StopCharge {
            device_id: DEVICE.to_owned(),
            port_no: 0,
            business_no: "10C3".to_owned(),
        })
        .await
        .expect("command accepted on the non-owning instance");

    // B's worker must defer: the row stays pending, untouched.
    instance_b.worker.run_tick().await;
    let row = store.outbound_row(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboundStatus::Pending);
    assert_eq!(row.attempt_count, 0, "deferral must not burn an attempt");

    // A's worker owns the connection and sends.
    instance_a.worker.run_tick().await;
    let row = store.outbound_row(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboundStatus::Sent);

    let frames = conn.sent();
    assert_eq!(frames.len(), 1);
    let frame = bkv_core::Frame::parse(&frames[0]).expect("downlink frame");
    assert_eq!(frame.cmd, 0x2002);
    assert_eq!(frame.device_id, DEVICE);
    assert_eq!(frame.direction, bkv_core::Direction::Downlink);
}
