//! Driver core: the event sink behind every protocol adapter.
//!
//! Consumes normalized [`CoreEvent`]s and turns them into idempotent store
//! writes plus push events for the business plane. Handlers never talk to
//! the wire; replies and downlinks go through the outbound queue.
//!
//! A session-ended report is persisted exactly as the device states it,
//! including a still-charging next-status; whether that triggers settlement
//! is the push consumer's decision, gated here only by the single
//! `push_session_events` predicate.

use crate::push::{EventPusher, PushEvent};
use crate::store::{AuditEntry, PortUpsert, Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gw_protocol::{CoreEvent, PortReadings};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Upper bound on any single event's storage work.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// EventSink trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle_core_event(&self, event: CoreEvent) -> Result<(), DriverError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("store write timed out")]
    Timeout,
}

// ---------------------------------------------------------------------------
// DriverCore
// ---------------------------------------------------------------------------

pub struct DriverCore {
    store: Arc<dyn Store>,
    pusher: Arc<dyn EventPusher>,
    push_session_events: bool,
}

impl DriverCore {
    pub fn new(
        store: Arc<dyn Store>,
        pusher: Arc<dyn EventPusher>,
        push_session_events: bool,
    ) -> Arc<DriverCore> {
        Arc::new(DriverCore {
            store,
            pusher,
            push_session_events,
        })
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, DriverError> {
        match tokio::time::timeout(WRITE_TIMEOUT, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DriverError::Timeout),
        }
    }

    async fn ensure_and_touch(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DriverError> {
        self.bounded(self.store.ensure_device(device_id, at)).await?;
        self.bounded(self.store.touch_last_seen(device_id, at))
            .await?;
        Ok(())
    }

    async fn push_session(&self, event: PushEvent) {
        if self.push_session_events {
            self.pusher.push(event).await;
        }
    }
}

#[async_trait]
impl EventSink for DriverCore {
    async fn handle_core_event(&self, event: CoreEvent) -> Result<(), DriverError> {
        debug!(kind = event.kind(), device_id = event.device_id(), "core event");
        match event {
            CoreEvent::DeviceHeartbeat { device_id, at } => {
                self.ensure_and_touch(&device_id, at).await
            }

            CoreEvent::DeviceRegistered {
                device_id,
                firmware,
                port_count,
                at,
            } => {
                self.ensure_and_touch(&device_id, at).await?;
                self.bounded(self.store.append_audit(AuditEntry {
                    phy_id: device_id.clone(),
                    kind: "device_registered".to_owned(),
                    detail: serde_json::json!({
                        "firmware": firmware,
                        "port_count": port_count,
                    }),
                    at,
                }))
                .await
            }

            CoreEvent::PortSnapshot {
                device_id,
                port_no,
                raw_status,
                readings,
                at,
            } => {
                self.ensure_and_touch(&device_id, at).await?;
                self.bounded(self.store.upsert_port(PortUpsert {
                    phy_id: device_id,
                    port_no,
                    raw_status,
                    readings,
                    business_no: None,
                    session_id: None,
                    energy_cwh: None,
                    duration_sec: None,
                    at,
                }))
                .await
            }

            CoreEvent::SessionStarted {
                device_id,
                port_no,
                business_no,
                session_id,
                raw_status,
                at,
            } => {
                self.ensure_and_touch(&device_id, at).await?;
                self.bounded(self.store.upsert_port(PortUpsert {
                    phy_id: device_id.clone(),
                    port_no,
                    raw_status,
                    readings: PortReadings::default(),
                    business_no: Some(business_no.clone()),
                    session_id: session_id.clone(),
                    energy_cwh: None,
                    duration_sec: None,
                    at,
                }))
                .await?;
                self.push_session(PushEvent::new(
                    "session_started",
                    &device_id,
                    serde_json::json!({
                        "port_no": port_no,
                        "business_no": business_no,
                        "session_id": session_id,
                        "raw_status": raw_status,
                    }),
                ))
                .await;
                Ok(())
            }

            CoreEvent::SessionProgress {
                device_id,
                port_no,
                business_no,
                raw_status,
                energy_cwh,
                duration_sec,
                power_w,
                at,
            } => {
                self.ensure_and_touch(&device_id, at).await?;
                self.bounded(self.store.upsert_port(PortUpsert {
                    phy_id: device_id,
                    port_no,
                    raw_status,
                    readings: PortReadings {
                        power_w,
                        ..PortReadings::default()
                    },
                    business_no: Some(business_no),
                    session_id: None,
                    energy_cwh,
                    duration_sec,
                    at,
                }))
                .await
            }

            CoreEvent::SessionEnded {
                device_id,
                port_no,
                business_no,
                next_raw_status,
                duration_sec,
                energy_cwh,
                reason,
                reason_label,
                at,
            } => {
                self.ensure_and_touch(&device_id, at).await?;
                // Persist whatever next-status the device reports, even a
                // still-charging bitfield.
                self.bounded(self.store.upsert_port(PortUpsert {
                    phy_id: device_id.clone(),
                    port_no,
                    raw_status: next_raw_status,
                    readings: PortReadings::default(),
                    business_no: Some(business_no.clone()),
                    session_id: None,
                    energy_cwh,
                    duration_sec,
                    at,
                }))
                .await?;
                self.push_session(PushEvent::new(
                    "session_ended",
                    &device_id,
                    serde_json::json!({
                        "port_no": port_no,
                        "business_no": business_no,
                        "next_raw_status": next_raw_status,
                        "duration_sec": duration_sec,
                        "energy_cwh": energy_cwh,
                        "reason": reason,
                        "reason_label": reason_label,
                    }),
                ))
                .await;
                Ok(())
            }

            CoreEvent::ParamResult {
                device_id,
                msg_id,
                success,
                entries,
                at,
            } => {
                self.ensure_and_touch(&device_id, at).await?;
                let detail = serde_json::json!({
                    "msg_id": msg_id,
                    "success": success,
                    "entries": entries.iter().map(|e| {
                        serde_json::json!({"tag": e.tag, "value": hex::encode(&e.value)})
                    }).collect::<Vec<_>>(),
                });
                self.bounded(self.store.append_audit(AuditEntry {
                    phy_id: device_id.clone(),
                    kind: "param_result".to_owned(),
                    detail: detail.clone(),
                    at,
                }))
                .await?;
                self.pusher
                    .push(PushEvent::new("param_result", &device_id, detail))
                    .await;
                Ok(())
            }

            CoreEvent::ParamSync {
                device_id,
                entries,
                at,
            } => {
                self.ensure_and_touch(&device_id, at).await?;
                let detail = serde_json::json!({
                    "entries": entries.iter().map(|e| {
                        serde_json::json!({"tag": e.tag, "value": hex::encode(&e.value)})
                    }).collect::<Vec<_>>(),
                });
                self.bounded(self.store.append_audit(AuditEntry {
                    phy_id: device_id.clone(),
                    kind: "param_sync".to_owned(),
                    detail: detail.clone(),
                    at,
                }))
                .await?;
                self.pusher
                    .push(PushEvent::new("param_sync", &device_id, detail))
                    .await;
                Ok(())
            }

            CoreEvent::OtaProgress {
                device_id,
                percent,
                status,
                at,
            } => {
                self.ensure_and_touch(&device_id, at).await?;
                let detail = serde_json::json!({"percent": percent, "status": status});
                self.bounded(self.store.append_audit(AuditEntry {
                    phy_id: device_id.clone(),
                    kind: "ota_progress".to_owned(),
                    detail: detail.clone(),
                    at,
                }))
                .await?;
                self.pusher
                    .push(PushEvent::new("ota_progress", &device_id, detail))
                    .await;
                Ok(())
            }

            CoreEvent::NetworkTopology {
                device_id,
                nodes,
                at,
            } => {
                self.ensure_and_touch(&device_id, at).await?;
                let detail = serde_json::json!({"nodes": nodes});
                self.bounded(self.store.append_audit(AuditEntry {
                    phy_id: device_id.clone(),
                    kind: "network_topology".to_owned(),
                    detail: detail.clone(),
                    at,
                }))
                .await?;
                self.pusher
                    .push(PushEvent::new("network_topology", &device_id, detail))
                    .await;
                Ok(())
            }

            CoreEvent::Exception {
                device_id,
                code,
                detail,
                at,
            } => {
                self.ensure_and_touch(&device_id, at).await?;
                let body = serde_json::json!({"code": code, "detail": detail});
                self.bounded(self.store.append_audit(AuditEntry {
                    phy_id: device_id.clone(),
                    kind: "exception".to_owned(),
                    detail: body.clone(),
                    at,
                }))
                .await?;
                self.pusher
                    .push(PushEvent::new("exception", &device_id, body))
                    .await;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use gw_protocol::PortStatus;
    use std::sync::Mutex;

    struct RecordingPusher {
        events: Mutex<Vec<PushEvent>>,
    }

    impl RecordingPusher {
        fn new() -> Arc<RecordingPusher> {
            Arc::new(RecordingPusher {
                events: Mutex::new(Vec::new()),
            })
        }

        fn kinds(&self) -> Vec<String> {
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

    fn sample_started(at: DateTime<Utc>) -> CoreEvent {
        CoreEvent::SessionStarted {
            device_id: "82241218000382".to_owned(),
            port_no: 0,
            business_no: "10C3".to_owned(),
            session_id: None,
            raw_status: 0xA0,
            at,
        }
    }

    #[tokio::test]
    async fn heartbeat_creates_device_and_touches_last_seen() {
        let store = Arc::new(MemStore::new());
        let pusher = RecordingPusher::new();
        let driver = DriverCore::new(store.clone(), pusher, true);
        let at = Utc::now();
        driver
            .handle_core_event(CoreEvent::DeviceHeartbeat {
                device_id: "d1".to_owned(),
                at,
            })
            .await
            .unwrap();
        let device = store.device("d1").await.unwrap().unwrap();
        assert_eq!(device.last_seen_at, at);
    }

    #[tokio::test]
    async fn heartbeat_is_idempotent() {
        let store = Arc::new(MemStore::new());
        let driver = DriverCore::new(store.clone(), RecordingPusher::new(), true);
        let at = Utc::now();
        for _ in 0..3 {
            driver
                .handle_core_event(CoreEvent::DeviceHeartbeat {
                    device_id: "d1".to_owned(),
                    at,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.device("d1").await.unwrap().unwrap().created_at, at);
    }

    #[tokio::test]
    async fn session_started_upserts_port_and_pushes_once() {
        let store = Arc::new(MemStore::new());
        let pusher = RecordingPusher::new();
        let driver = DriverCore::new(store.clone(), pusher.clone(), true);
        driver
            .handle_core_event(sample_started(Utc::now()))
            .await
            .unwrap();
        let port = store.port("82241218000382", 0).await.unwrap().unwrap();
        assert_eq!(port.status, PortStatus::Charging);
        assert_eq!(port.business_no.as_deref(), Some("10C3"));
        assert_eq!(pusher.kinds(), vec!["session_started"]);
    }

    #[tokio::test]
    async fn session_push_predicate_gates_lifecycle_events() {
        let store = Arc::new(MemStore::new());
        let pusher = RecordingPusher::new();
        let driver = DriverCore::new(store, pusher.clone(), false);
        driver
            .handle_core_event(sample_started(Utc::now()))
            .await
            .unwrap();
        assert!(pusher.kinds().is_empty());
    }

    #[tokio::test]
    async fn session_ended_persists_reported_next_status() {
        let store = Arc::new(MemStore::new());
        let driver = DriverCore::new(store.clone(), RecordingPusher::new(), true);
        let at = Utc::now();
        driver.handle_core_event(sample_started(at)).await.unwrap();
        driver
            .handle_core_event(CoreEvent::SessionEnded {
                device_id: "82241218000382".to_owned(),
                port_no: 0,
                business_no: "10C3".to_owned(),
                // Device claims it is still charging after the stop; persist
                // it as reported.
                next_raw_status: 0xA0,
                duration_sec: Some(300),
                energy_cwh: Some(50),
                reason: 1,
                reason_label: None,
                at: at + chrono::Duration::seconds(300),
            })
            .await
            .unwrap();
        let port = store.port("82241218000382", 0).await.unwrap().unwrap();
        assert_eq!(port.raw_status, 0xA0);
        assert_eq!(port.status, PortStatus::Charging);
        assert_eq!(port.duration_sec, Some(300));
    }

    #[tokio::test]
    async fn exception_appends_audit_and_pushes() {
        let store = Arc::new(MemStore::new());
        let pusher = RecordingPusher::new();
        let driver = DriverCore::new(store.clone(), pusher.clone(), true);
        driver
            .handle_core_event(CoreEvent::Exception {
                device_id: "d1".to_owned(),
                code: 0x0102,
                detail: Some("meter read failed".to_owned()),
                at: Utc::now(),
            })
            .await
            .unwrap();
        let audit = store.audit_entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].kind, "exception");
        assert_eq!(pusher.kinds(), vec!["exception"]);
    }
}
