//! In-memory session registry for single-instance deployments.

use super::{is_online, ConnLookup, LivenessLedger, OnlinePolicy, SessionRegistry};
use crate::gateway::conn::ConnWriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gw_protocol::ProtocolFamily;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

struct Binding {
    conn: Arc<dyn ConnWriter>,
    family: ProtocolFamily,
    #[allow(dead_code)]
    bound_at: DateTime<Utc>,
}

#[derive(Default)]
struct Maps {
    ledgers: HashMap<String, LivenessLedger>,
    conns: HashMap<String, Binding>,
}

pub struct LocalRegistry {
    server_id: String,
    heartbeat_timeout: Duration,
    maps: RwLock<Maps>,
}

impl LocalRegistry {
    pub fn new(server_id: &str, heartbeat_timeout: Duration) -> Arc<LocalRegistry> {
        Arc::new(LocalRegistry {
            server_id: server_id.to_owned(),
            heartbeat_timeout,
            maps: RwLock::new(Maps::default()),
        })
    }

    /// Snapshot of a device's liveness ledger.
    pub async fn ledger(&self, device_id: &str) -> LivenessLedger {
        self.maps
            .read()
            .await
            .ledgers
            .get(device_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn bound_count(&self) -> usize {
        self.maps.read().await.conns.len()
    }

    fn heartbeat_policy(&self) -> OnlinePolicy {
        OnlinePolicy::heartbeat_only(self.heartbeat_timeout)
    }
}

#[async_trait]
impl SessionRegistry for LocalRegistry {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn bind(
        &self,
        device_id: &str,
        conn: Arc<dyn ConnWriter>,
        family: ProtocolFamily,
        at: DateTime<Utc>,
    ) {
        let mut maps = self.maps.write().await;
        debug!(device_id, conn_id = conn.conn_id(), family = %family, "bind");
        maps.conns.insert(
            device_id.to_owned(),
            Binding {
                conn,
                family,
                bound_at: at,
            },
        );
        let ledger = maps.ledgers.entry(device_id.to_owned()).or_default();
        ledger.last_seen = Some(ledger.last_seen.map_or(at, |prev| prev.max(at)));
    }

    async fn unbind(&self, device_id: &str, conn_id: u64) {
        let mut maps = self.maps.write().await;
        if maps
            .conns
            .get(device_id)
            .is_some_and(|b| b.conn.conn_id() == conn_id)
        {
            maps.conns.remove(device_id);
            debug!(device_id, conn_id, "unbind");
        }
    }

    async fn on_heartbeat(&self, device_id: &str, at: DateTime<Utc>) {
        let mut maps = self.maps.write().await;
        let ledger = maps.ledgers.entry(device_id.to_owned()).or_default();
        ledger.last_seen = Some(ledger.last_seen.map_or(at, |prev| prev.max(at)));
    }

    async fn on_tcp_closed(&self, device_id: &str, at: DateTime<Utc>) {
        let mut maps = self.maps.write().await;
        maps.ledgers
            .entry(device_id.to_owned())
            .or_default()
            .last_tcp_down = Some(at);
    }

    async fn on_ack_timeout(&self, device_id: &str, at: DateTime<Utc>) {
        let mut maps = self.maps.write().await;
        maps.ledgers
            .entry(device_id.to_owned())
            .or_default()
            .last_ack_timeout = Some(at);
    }

    async fn get_conn(&self, device_id: &str) -> ConnLookup {
        match self.maps.read().await.conns.get(device_id) {
            Some(binding) if !binding.conn.is_closed() => {
                ConnLookup::Local(binding.conn.clone())
            }
            _ => ConnLookup::NotFound,
        }
    }

    async fn family_of(&self, device_id: &str) -> Option<ProtocolFamily> {
        self.maps
            .read()
            .await
            .conns
            .get(device_id)
            .map(|b| b.family)
    }

    async fn is_online(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        self.is_online_weighted(device_id, now, &self.heartbeat_policy())
            .await
    }

    async fn is_online_weighted(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
        policy: &OnlinePolicy,
    ) -> bool {
        let ledger = self.ledger(device_id).await;
        is_online(&ledger, now, policy)
    }

    async fn online_count(&self, now: DateTime<Utc>) -> usize {
        self.online_count_weighted(now, &self.heartbeat_policy())
            .await
    }

    async fn online_count_weighted(&self, now: DateTime<Utc>, policy: &OnlinePolicy) -> usize {
        self.maps
            .read()
            .await
            .ledgers
            .values()
            .filter(|ledger| is_online(ledger, now, policy))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::conn::ConnError;

    struct FakeConn {
        id: u64,
        closed: std::sync::atomic::AtomicBool,
    }

    impl FakeConn {
        fn new(id: u64) -> Arc<FakeConn> {
            Arc::new(FakeConn {
                id,
                closed: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ConnWriter for FakeConn {
        fn conn_id(&self) -> u64 {
            self.id
        }
        fn family(&self) -> Option<ProtocolFamily> {
            Some(ProtocolFamily::A)
        }
        fn is_closed(&self) -> bool {
            self.closed.load(std::sync::atomic::Ordering::SeqCst)
        }
        async fn send_bytes(&self, _bytes: Vec<u8>) -> Result<(), ConnError> {
            Ok(())
        }
    }

    fn registry() -> Arc<LocalRegistry> {
        LocalRegistry::new("srv-1", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn bind_then_lookup_returns_local_conn() {
        let reg = registry();
        let conn = FakeConn::new(7);
        reg.bind("dev1", conn, ProtocolFamily::A, Utc::now()).await;
        match reg.get_conn("dev1").await {
            ConnLookup::Local(c) => assert_eq!(c.conn_id(), 7),
            _ => panic!("expected local binding"),
        }
        assert_eq!(reg.family_of("dev1").await, Some(ProtocolFamily::A));
    }

    #[tokio::test]
    async fn rebind_replaces_stale_binding() {
        let reg = registry();
        reg.bind("dev1", FakeConn::new(1), ProtocolFamily::A, Utc::now())
            .await;
        reg.bind("dev1", FakeConn::new(2), ProtocolFamily::B, Utc::now())
            .await;
        match reg.get_conn("dev1").await {
            ConnLookup::Local(c) => assert_eq!(c.conn_id(), 2),
            _ => panic!("expected local binding"),
        }
        // Old connection's teardown must not remove the new binding.
        reg.unbind("dev1", 1).await;
        assert!(matches!(reg.get_conn("dev1").await, ConnLookup::Local(_)));
        reg.unbind("dev1", 2).await;
        assert!(matches!(reg.get_conn("dev1").await, ConnLookup::NotFound));
    }

    #[tokio::test]
    async fn closed_conn_reads_as_not_found() {
        let reg = registry();
        let conn = FakeConn::new(3);
        reg.bind("dev1", conn.clone(), ProtocolFamily::A, Utc::now())
            .await;
        conn.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(reg.get_conn("dev1").await, ConnLookup::NotFound));
    }

    #[tokio::test]
    async fn heartbeat_timestamps_are_monotonic() {
        let reg = registry();
        let now = Utc::now();
        reg.on_heartbeat("dev1", now).await;
        reg.on_heartbeat("dev1", now - chrono::Duration::seconds(30))
            .await;
        assert_eq!(reg.ledger("dev1").await.last_seen, Some(now));
    }

    #[tokio::test]
    async fn online_counts_follow_heartbeat_freshness() {
        let reg = registry();
        let now = Utc::now();
        reg.on_heartbeat("fresh", now - chrono::Duration::seconds(10))
            .await;
        reg.on_heartbeat("stale", now - chrono::Duration::seconds(120))
            .await;
        assert!(reg.is_online("fresh", now).await);
        assert!(!reg.is_online("stale", now).await);
        assert_eq!(reg.online_count(now).await, 1);
    }
}
