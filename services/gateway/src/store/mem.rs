//! In-memory store.
//!
//! Backs unit and integration tests, and doubles as the reference semantics
//! for the Postgres implementation: every conditional transition here must
//! match a `WHERE status = ...` clause in `repo/outbound.rs`.

use super::*;
use gw_protocol::PortStatus;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    devices: HashMap<String, DeviceRow>,
    ports: HashMap<(String, u32), PortRow>,
    cmd_log: Vec<CmdLogEntry>,
    audit: Vec<AuditEntry>,
    outbound: Vec<OutboundRow>,
    next_id: i64,
}

/// Mutex-guarded maps; one lock keeps multi-row writes atomic the way the
/// Postgres transactions do.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    /// Test hook: seed a row directly, bypassing queue admission.
    pub async fn seed_outbound(&self, new: NewOutbound) -> i64 {
        self.insert_outbound(new).await.expect("mem store insert")
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.audit.clone()
    }

    pub async fn cmd_log_entries(&self) -> Vec<CmdLogEntry> {
        self.inner.lock().await.cmd_log.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn ensure_device(&self, phy_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .devices
            .entry(phy_id.to_owned())
            .or_insert_with(|| DeviceRow {
                phy_id: phy_id.to_owned(),
                lifecycle: "active".to_owned(),
                last_seen_at: at,
                created_at: at,
            });
        Ok(())
    }

    async fn touch_last_seen(&self, phy_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.devices.get_mut(phy_id) {
            Some(row) => {
                if at > row.last_seen_at {
                    row.last_seen_at = at;
                }
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn device(&self, phy_id: &str) -> Result<Option<DeviceRow>, StoreError> {
        Ok(self.inner.lock().await.devices.get(phy_id).cloned())
    }

    async fn upsert_port(&self, up: PortUpsert) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (up.phy_id.clone(), up.port_no);
        let status = PortStatus::from_raw(up.raw_status);
        let row = inner.ports.entry(key).or_insert_with(|| PortRow {
            phy_id: up.phy_id.clone(),
            port_no: up.port_no,
            status,
            raw_status: up.raw_status,
            readings: PortReadings::default(),
            business_no: None,
            session_id: None,
            energy_cwh: None,
            duration_sec: None,
            updated_at: up.at,
        });
        row.status = status;
        row.raw_status = up.raw_status;
        if up.readings.power_w.is_some() {
            row.readings.power_w = up.readings.power_w;
        }
        if up.readings.voltage_dv.is_some() {
            row.readings.voltage_dv = up.readings.voltage_dv;
        }
        if up.readings.current_ma.is_some() {
            row.readings.current_ma = up.readings.current_ma;
        }
        if up.readings.temperature_c.is_some() {
            row.readings.temperature_c = up.readings.temperature_c;
        }
        if up.business_no.is_some() {
            row.business_no = up.business_no;
        }
        if up.session_id.is_some() {
            row.session_id = up.session_id;
        }
        if up.energy_cwh.is_some() {
            row.energy_cwh = up.energy_cwh;
        }
        if up.duration_sec.is_some() {
            row.duration_sec = up.duration_sec;
        }
        row.updated_at = up.at;
        Ok(())
    }

    async fn port(&self, phy_id: &str, port_no: u32) -> Result<Option<PortRow>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .ports
            .get(&(phy_id.to_owned(), port_no))
            .cloned())
    }

    async fn append_cmd_log(&self, entry: CmdLogEntry) -> Result<(), StoreError> {
        self.inner.lock().await.cmd_log.push(entry);
        Ok(())
    }

    async fn cmd_log_count(&self, phy_id: &str) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .cmd_log
            .iter()
            .filter(|e| e.phy_id == phy_id)
            .count() as i64)
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.inner.lock().await.audit.push(entry);
        Ok(())
    }

    async fn insert_outbound(&self, new: NewOutbound) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.outbound.push(OutboundRow {
            id,
            phy_id: new.phy_id,
            family: new.family,
            cmd: new.cmd,
            payload: new.payload,
            priority: new.priority,
            status: OutboundStatus::Pending,
            msg_id: new.msg_id,
            attempt_count: 0,
            not_before: new.at,
            timeout_sec: new.timeout_sec,
            last_error: None,
            created_at: new.at,
            sent_at: None,
        });
        Ok(id)
    }

    async fn outbound_depth(&self) -> Result<i64, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .outbound
            .iter()
            .filter(|r| r.status == OutboundStatus::Pending)
            .count() as i64)
    }

    async fn due_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboundRow>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<OutboundRow> = inner
            .outbound
            .iter()
            .filter(|r| r.status == OutboundStatus::Pending && r.not_before <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn set_sent(&self, id: i64, msg_id: u32, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.outbound.iter_mut().find(|r| r.id == id) {
            Some(row) if row.status == OutboundStatus::Pending => {
                row.status = OutboundStatus::Sent;
                row.msg_id = Some(msg_id);
                row.sent_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound),
        }
    }

    async fn requeue(
        &self,
        id: i64,
        not_before: DateTime<Utc>,
        attempt_count: u32,
        last_error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.outbound.iter_mut().find(|r| r.id == id) {
            Some(row)
                if row.status == OutboundStatus::Pending
                    || row.status == OutboundStatus::Sent =>
            {
                row.status = OutboundStatus::Pending;
                row.not_before = not_before;
                row.attempt_count = attempt_count;
                row.last_error = Some(last_error.to_owned());
                row.msg_id = None;
                row.sent_at = None;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn mark_dead(&self, id: i64, reason: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.outbound.iter_mut().find(|r| r.id == id) {
            Some(row)
                if row.status == OutboundStatus::Pending
                    || row.status == OutboundStatus::Sent =>
            {
                row.status = OutboundStatus::Dead;
                row.last_error = Some(reason.to_owned());
                row.not_before = at;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn mark_done(&self, id: i64, _at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.outbound.iter_mut().find(|r| r.id == id) {
            Some(row) if row.status == OutboundStatus::Sent => {
                row.status = OutboundStatus::Done;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn oldest_sent_by_msg_id(
        &self,
        phy_id: &str,
        msg_id: u32,
    ) -> Result<Option<OutboundRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .outbound
            .iter()
            .filter(|r| {
                r.status == OutboundStatus::Sent
                    && r.phy_id == phy_id
                    && r.msg_id == Some(msg_id)
            })
            .min_by_key(|r| (r.sent_at, r.id))
            .cloned())
    }

    async fn sent_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<OutboundRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .outbound
            .iter()
            .filter(|r| {
                r.status == OutboundStatus::Sent
                    && r.sent_at.is_some_and(|s| {
                        s + chrono::Duration::seconds(i64::from(r.timeout_sec)) <= now
                    })
            })
            .cloned()
            .collect())
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let inner = self.inner.lock().await;
        let mut counts = StatusCounts::default();
        for row in &inner.outbound {
            match row.status {
                OutboundStatus::Pending => counts.pending += 1,
                OutboundStatus::Sent => counts.sent += 1,
                OutboundStatus::Done => counts.done += 1,
                OutboundStatus::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }

    async fn purge_dead_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.outbound.len();
        inner
            .outbound
            .retain(|r| !(r.status == OutboundStatus::Dead && r.not_before < cutoff));
        Ok((before - inner.outbound.len()) as u64)
    }

    async fn outbound_row(&self, id: i64) -> Result<Option<OutboundRow>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .outbound
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
