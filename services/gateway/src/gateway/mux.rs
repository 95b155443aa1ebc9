//! Protocol multiplexer.
//!
//! Both wire families share one listening port; the first bytes of a
//! connection decide which adapter owns it. Until a sniffer matches, each
//! read is broadcast to per-adapter probing handlers (a magic split across
//! reads must not strand the connection), and the decision is retried on
//! the next read. Once decided, every byte goes straight to the bound
//! handler with no further sniffing.

use crate::adapters::{AdapterError, ConnHandler, ProtocolAdapter};
use crate::gateway::conn::{ConnContext, ConnWriter};
use gw_protocol::ProtocolFamily;
use std::sync::Arc;
use tracing::debug;

/// Sniff window: the longest family magic fits well within 8 bytes.
const PREFIX_WINDOW: usize = 8;

pub struct ProtocolMux {
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
}

impl ProtocolMux {
    pub fn new(adapters: Vec<Arc<dyn ProtocolAdapter>>) -> Arc<ProtocolMux> {
        Arc::new(ProtocolMux { adapters })
    }

    pub fn adapters(&self) -> &[Arc<dyn ProtocolAdapter>] {
        &self.adapters
    }

    /// Per-connection demux state.
    pub fn for_conn(self: &Arc<Self>, conn: Arc<ConnContext>) -> ConnMux {
        let probing = self.adapters.iter().map(|_| None).collect();
        ConnMux {
            mux: self.clone(),
            conn,
            bound: None,
            probing,
            prefix: Vec::with_capacity(PREFIX_WINDOW),
        }
    }
}

pub struct ConnMux {
    mux: Arc<ProtocolMux>,
    conn: Arc<ConnContext>,
    bound: Option<Box<dyn ConnHandler>>,
    /// Lazily created handlers fed during the undecided phase, indexed like
    /// the adapter list. The winning adapter's probe becomes the bound
    /// handler so no bytes are lost.
    probing: Vec<Option<Box<dyn ConnHandler>>>,
    prefix: Vec<u8>,
}

impl ConnMux {
    pub fn decided(&self) -> bool {
        self.bound.is_some()
    }

    pub fn family(&self) -> Option<ProtocolFamily> {
        self.conn.family()
    }

    /// Feed one read's worth of bytes.
    pub async fn on_read(&mut self, data: &[u8]) -> Result<(), AdapterError> {
        if let Some(handler) = &mut self.bound {
            return handler.process_bytes(data).await;
        }

        if self.prefix.len() < PREFIX_WINDOW {
            let take = (PREFIX_WINDOW - self.prefix.len()).min(data.len());
            self.prefix.extend_from_slice(&data[..take]);
        }

        let adapters = self.mux.adapters.clone();
        for (i, adapter) in adapters.iter().enumerate() {
            if adapter.sniff(&self.prefix) {
                debug!(family = %adapter.family(), "protocol decided");
                self.conn.set_family(adapter.family());
                let mut handler = self.probing[i]
                    .take()
                    .unwrap_or_else(|| adapter.bind(self.conn.clone()));
                self.probing.clear();
                self.probing.shrink_to_fit();
                let result = handler.process_bytes(data).await;
                self.bound = Some(handler);
                return result;
            }
        }

        // No sniffer matched yet (possibly a partial magic): hand the bytes
        // to every adapter once and retry the decision on the next read.
        for (i, adapter) in adapters.iter().enumerate() {
            let handler =
                self.probing[i].get_or_insert_with(|| adapter.bind(self.conn.clone()));
            if let Err(e) = handler.process_bytes(data).await {
                debug!(family = %adapter.family(), error = %e, "probe handler error");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterDeps, Ap3000Adapter, BkvAdapter};
    use crate::config::OutboundConfig;
    use crate::driver::DriverCore;
    use crate::metrics::Metrics;
    use crate::outbound::OutboundQueue;
    use crate::session::SessionRegistry;
    use crate::store::Store;
    use crate::push::NoopPusher;
    use crate::session::LocalRegistry;
    use crate::store::MemStore;
    use std::collections::HashMap;
    use std::time::Duration;

    fn mux_fixture() -> (Arc<ProtocolMux>, Arc<MemStore>, Arc<LocalRegistry>) {
        let store: Arc<MemStore> = Arc::new(MemStore::new());
        let metrics = Metrics::new();
        let registry = LocalRegistry::new("srv-test", Duration::from_secs(60));
        let queue = OutboundQueue::new(
            store.clone(),
            metrics.clone(),
            OutboundConfig {
                throttle: Duration::from_millis(0),
                retry_max: 3,
                dead_retention_days: 7,
                batch_size: 20,
                tick: Duration::from_millis(20),
                ack_timeout_sec: 30,
            },
        );
        let sink = DriverCore::new(store.clone(), Arc::new(NoopPusher), true);
        let deps = Arc::new(AdapterDeps {
            sink,
            registry: registry.clone(),
            queue,
            store: store.clone(),
            metrics,
            reason_map: HashMap::new(),
        });
        let mux = ProtocolMux::new(vec![
            Ap3000Adapter::new(deps.clone()),
            BkvAdapter::new(deps),
        ]);
        (mux, store, registry)
    }

    fn test_conn(id: u64) -> Arc<ConnContext> {
        ConnContext::new(
            id,
            "127.0.0.1:1".parse().unwrap(),
            Duration::from_millis(100),
        )
        .0
    }

    #[tokio::test]
    async fn family_a_frame_binds_family_a() {
        let (mux, store, _) = mux_fixture();
        let conn = test_conn(1);
        let mut cm = mux.for_conn(conn.clone());
        cm.on_read(&gw_test_utils::ap_heartbeat("1234567", 1))
            .await
            .unwrap();
        assert!(cm.decided());
        assert_eq!(conn.family(), Some(ProtocolFamily::A));
        assert!(store.device("1234567").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn family_b_frame_binds_family_b() {
        let (mux, store, _) = mux_fixture();
        let conn = test_conn(2);
        let mut cm = mux.for_conn(conn.clone());
        cm.on_read(&gw_test_utils::bkv_heartbeat("82241218000382", 1))
            .await
            .unwrap();
        assert!(cm.decided());
        assert_eq!(conn.family(), Some(ProtocolFamily::B));
        assert!(store.device("82241218000382").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn split_magic_decides_on_later_read() {
        let (mux, _store, registry) = mux_fixture();
        let conn = test_conn(3);
        let mut cm = mux.for_conn(conn.clone());
        let frame = gw_test_utils::bkv_heartbeat("82241218000382", 2);
        // First read carries a single magic byte; no sniffer can match yet.
        cm.on_read(&frame[..1]).await.unwrap();
        assert!(!cm.decided());
        cm.on_read(&frame[1..]).await.unwrap();
        assert!(cm.decided());
        assert_eq!(conn.family(), Some(ProtocolFamily::B));
        // The probe handler kept the first byte: the frame still decoded.
        assert!(registry.ledger("82241218000382").await.last_seen.is_some());
    }

    #[tokio::test]
    async fn undecided_garbage_keeps_retrying() {
        let (mux, _store, _) = mux_fixture();
        let conn = test_conn(4);
        let mut cm = mux.for_conn(conn.clone());
        cm.on_read(&[0x00, 0x01, 0x02]).await.unwrap();
        assert!(!cm.decided());
        // Prefix window already holds garbage; a later A frame cannot match
        // the 8-byte prefix but must still be consumed by the probe handlers.
        cm.on_read(&gw_test_utils::ap_heartbeat("1234567", 3))
            .await
            .unwrap();
        assert!(!cm.decided());
    }

    #[tokio::test]
    async fn two_connections_do_not_cross_contaminate() {
        let (mux, _store, registry) = mux_fixture();
        let conn_a = test_conn(5);
        let conn_b = test_conn(6);
        let mut cm_a = mux.for_conn(conn_a.clone());
        let mut cm_b = mux.for_conn(conn_b.clone());

        cm_a.on_read(&gw_test_utils::ap_heartbeat("1111111", 1))
            .await
            .unwrap();
        cm_b.on_read(&gw_test_utils::bkv_heartbeat("2222222", 1))
            .await
            .unwrap();

        assert_eq!(conn_a.family(), Some(ProtocolFamily::A));
        assert_eq!(conn_b.family(), Some(ProtocolFamily::B));
        assert_eq!(registry.family_of("1111111").await, Some(ProtocolFamily::A));
        assert_eq!(registry.family_of("2222222").await, Some(ProtocolFamily::B));
    }
}
