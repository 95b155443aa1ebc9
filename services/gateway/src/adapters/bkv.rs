//! Family B (BKV) adapter.
//!
//! Uplink cmds: 0x0000 heartbeat (replied with a 7-byte BCD timestamp),
//! 0x0001 register, 0x0003 exception, 0x0004 network topology, 0x1000 TLV
//! sub-protocol (session lifecycle, port status, parameter sync), 0x3001
//! OTA progress. Downlinks (0x2001 start, 0x2002 stop, 0x2003 param write,
//! 0x2004 param read, 0x3000 OTA push) are acknowledged with the same cmd
//! and msg id; payload byte 0 carries the result, and a param-read ACK
//! carries TLV records behind it.

use super::{
    log_handler_error, AdapterDeps, AdapterError, ConnHandler, ProtocolAdapter, RouteFuture,
    Router,
};
use crate::gateway::conn::ConnContext;
use crate::store::{CmdDirection, CmdLogEntry};
use async_trait::async_trait;
use bkv_core::tlv::{self, SubPacket, Tlv};
use bkv_core::{bcd_timestamp, Direction, Frame, StreamDecoder, MAGIC};
use chrono::{Datelike, Timelike, Utc};
use gw_protocol::{CoreCommand, CoreEvent, ParamEntry, PortReadings, ProtocolFamily};
use std::sync::Arc;
use tracing::{debug, warn};

pub const CMD_HEARTBEAT: u16 = 0x0000;
pub const CMD_REGISTER: u16 = 0x0001;
pub const CMD_EXCEPTION: u16 = 0x0003;
pub const CMD_TOPOLOGY: u16 = 0x0004;
pub const CMD_SUB_PROTOCOL: u16 = 0x1000;
pub const CMD_START_CHARGE: u16 = 0x2001;
pub const CMD_STOP_CHARGE: u16 = 0x2002;
pub const CMD_PARAM_WRITE: u16 = 0x2003;
pub const CMD_PARAM_READ: u16 = 0x2004;
pub const CMD_OTA_PUSH: u16 = 0x3000;
pub const CMD_OTA_PROGRESS: u16 = 0x3001;

/// Sniff on the `FC FE` magic.
pub fn sniff_prefix(prefix: &[u8]) -> bool {
    prefix.len() >= MAGIC.len() && prefix[..MAGIC.len()] == MAGIC
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct BkvAdapter {
    deps: Arc<AdapterDeps>,
    router: Arc<Router<Frame>>,
}

impl BkvAdapter {
    pub fn new(deps: Arc<AdapterDeps>) -> Arc<BkvAdapter> {
        let mut router = Router::new(ProtocolFamily::B);
        router.register(CMD_HEARTBEAT, handle_heartbeat);
        router.register(CMD_REGISTER, handle_register);
        router.register(CMD_EXCEPTION, handle_exception);
        router.register(CMD_TOPOLOGY, handle_topology);
        router.register(CMD_SUB_PROTOCOL, handle_sub_protocol);
        router.register(CMD_OTA_PROGRESS, handle_ota_progress);
        for cmd in [CMD_START_CHARGE, CMD_STOP_CHARGE, CMD_PARAM_WRITE, CMD_OTA_PUSH] {
            router.register(cmd, handle_downlink_ack);
        }
        router.register(CMD_PARAM_READ, handle_param_read_ack);
        Arc::new(BkvAdapter {
            deps,
            router: Arc::new(router),
        })
    }
}

impl ProtocolAdapter for BkvAdapter {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::B
    }

    fn sniff(&self, prefix: &[u8]) -> bool {
        sniff_prefix(prefix)
    }

    fn bind(&self, conn: Arc<ConnContext>) -> Box<dyn ConnHandler> {
        Box::new(BkvConn {
            deps: self.deps.clone(),
            router: self.router.clone(),
            conn,
            decoder: StreamDecoder::new(),
            slides_seen: 0,
        })
    }

    fn encode_command(&self, command: &CoreCommand) -> Result<(u16, Vec<u8>), AdapterError> {
        match command {
            CoreCommand::StartCharge {
                port_no,
                business_no,
                duration_sec,
                energy_limit_cwh,
                ..
            } => {
                let mut records = vec![
                    Tlv::new(tlv::TAG_PORT_NO, vec![*port_no as u8]),
                    Tlv::new(tlv::TAG_BUSINESS_NO, business_no.as_bytes().to_vec()),
                ];
                if let Some(duration) = duration_sec {
                    records.push(Tlv::new(tlv::TAG_DURATION, duration.to_be_bytes().to_vec()));
                }
                if let Some(energy) = energy_limit_cwh {
                    records.push(Tlv::new(tlv::TAG_ENERGY, energy.to_be_bytes().to_vec()));
                }
                Ok((CMD_START_CHARGE, tlv::encode_records(&records)))
            }
            CoreCommand::StopCharge {
                port_no,
                business_no,
                ..
            } => {
                let records = vec![
                    Tlv::new(tlv::TAG_PORT_NO, vec![*port_no as u8]),
                    Tlv::new(tlv::TAG_BUSINESS_NO, business_no.as_bytes().to_vec()),
                ];
                Ok((CMD_STOP_CHARGE, tlv::encode_records(&records)))
            }
            // A status query is a parameter read of the status tags.
            CoreCommand::QueryStatus { .. } => Ok((
                CMD_PARAM_READ,
                vec![tlv::TAG_RAW_STATUS, tlv::TAG_POWER],
            )),
            CoreCommand::WriteParams { entries, .. } => {
                let records: Vec<Tlv> = entries
                    .iter()
                    .map(|e| Tlv::new(e.tag, e.value.clone()))
                    .collect();
                Ok((CMD_PARAM_WRITE, tlv::encode_records(&records)))
            }
            CoreCommand::ReadParams { tags, .. } => Ok((CMD_PARAM_READ, tags.clone())),
            CoreCommand::PushOta { version, url, .. } => {
                let records = vec![
                    Tlv::new(tlv::TAG_FW_VERSION, version.as_bytes().to_vec()),
                    Tlv::new(tlv::TAG_FW_URL, url.as_bytes().to_vec()),
                ];
                Ok((CMD_OTA_PUSH, tlv::encode_records(&records)))
            }
        }
    }

    fn build_downlink(&self, device_id: &str, msg_id: u32, cmd: u16, payload: &[u8]) -> Vec<u8> {
        Frame::build(device_id, msg_id, Direction::Downlink, cmd, payload)
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

struct BkvConn {
    deps: Arc<AdapterDeps>,
    router: Arc<Router<Frame>>,
    conn: Arc<ConnContext>,
    decoder: StreamDecoder,
    slides_seen: u64,
}

#[async_trait]
impl ConnHandler for BkvConn {
    async fn process_bytes(&mut self, data: &[u8]) -> Result<(), AdapterError> {
        let frames = self.decoder.feed(data);

        let slides = self.decoder.corruption_slides();
        if slides > self.slides_seen {
            self.deps
                .metrics
                .parse_total
                .with_label_values(&["B", "error"])
                .inc_by(slides - self.slides_seen);
            self.slides_seen = slides;
        }

        for frame in frames {
            if frame.direction != Direction::Uplink {
                debug!(device_id = %frame.device_id, "downlink-direction frame from device, ignoring");
                continue;
            }
            self.deps
                .metrics
                .parse_total
                .with_label_values(&["B", "ok"])
                .inc();
            let now = Utc::now();

            if self.conn.device_id().as_deref() != Some(frame.device_id.as_str()) {
                self.conn.set_device_id(&frame.device_id);
                self.deps
                    .registry
                    .bind(&frame.device_id, self.conn.clone(), ProtocolFamily::B, now)
                    .await;
            }
            self.deps.registry.on_heartbeat(&frame.device_id, now).await;

            if let Err(e) = self
                .deps
                .store
                .append_cmd_log(CmdLogEntry {
                    phy_id: frame.device_id.clone(),
                    msg_id: frame.msg_id,
                    cmd: frame.cmd,
                    direction: CmdDirection::Uplink,
                    payload: frame.payload.clone(),
                    success: true,
                    at: now,
                })
                .await
            {
                warn!(error = %e, "cmd log append failed");
            }

            let cmd = frame.cmd;
            let result = self
                .router
                .dispatch(self.deps.clone(), self.conn.clone(), cmd, frame)
                .await;
            log_handler_error(ProtocolFamily::B, cmd, result);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Frame handlers
// ---------------------------------------------------------------------------

fn handle_heartbeat(deps: Arc<AdapterDeps>, _conn: Arc<ConnContext>, frame: Frame) -> RouteFuture {
    Box::pin(async move {
        deps.metrics.session_heartbeat_total.inc();
        deps.sink
            .handle_core_event(CoreEvent::DeviceHeartbeat {
                device_id: frame.device_id.clone(),
                at: Utc::now(),
            })
            .await
            .map_err(|e| AdapterError::Sink(e.to_string()))?;

        // Reply: the platform clock as 7 BCD bytes.
        let now = Utc::now();
        let payload = bcd_timestamp(
            now.year() as u16,
            now.month() as u8,
            now.day() as u8,
            now.hour() as u8,
            now.minute() as u8,
            now.second() as u8,
        );
        if let Err(e) = deps
            .queue
            .enqueue_reply(
                &frame.device_id,
                ProtocolFamily::B,
                CMD_HEARTBEAT,
                payload.to_vec(),
                frame.msg_id,
            )
            .await
        {
            warn!(device_id = %frame.device_id, error = %e, "heartbeat reply enqueue failed");
        }
        Ok(())
    })
}

fn handle_register(deps: Arc<AdapterDeps>, _conn: Arc<ConnContext>, frame: Frame) -> RouteFuture {
    Box::pin(async move {
        let firmware = (!frame.payload.is_empty())
            .then(|| String::from_utf8_lossy(&frame.payload).into_owned());
        deps.sink
            .handle_core_event(CoreEvent::DeviceRegistered {
                device_id: frame.device_id,
                firmware,
                port_count: None,
                at: Utc::now(),
            })
            .await
            .map_err(|e| AdapterError::Sink(e.to_string()))
    })
}

fn handle_exception(deps: Arc<AdapterDeps>, _conn: Arc<ConnContext>, frame: Frame) -> RouteFuture {
    Box::pin(async move {
        // code u16 BE | detail text
        let p = &frame.payload;
        if p.len() < 2 {
            debug!(device_id = %frame.device_id, "short exception payload, ignoring");
            return Ok(());
        }
        let detail = (p.len() > 2).then(|| String::from_utf8_lossy(&p[2..]).into_owned());
        deps.sink
            .handle_core_event(CoreEvent::Exception {
                device_id: frame.device_id,
                code: u16::from_be_bytes([p[0], p[1]]),
                detail,
                at: Utc::now(),
            })
            .await
            .map_err(|e| AdapterError::Sink(e.to_string()))
    })
}

fn handle_topology(deps: Arc<AdapterDeps>, _conn: Arc<ConnContext>, frame: Frame) -> RouteFuture {
    Box::pin(async move {
        // count u8 | (len u8, node id bytes)*
        let p = &frame.payload;
        let mut nodes = Vec::new();
        let mut at = 1usize;
        let count = p.first().copied().unwrap_or(0) as usize;
        for _ in 0..count {
            if at >= p.len() {
                break;
            }
            let len = p[at] as usize;
            at += 1;
            if at + len > p.len() {
                break;
            }
            nodes.push(String::from_utf8_lossy(&p[at..at + len]).into_owned());
            at += len;
        }
        deps.sink
            .handle_core_event(CoreEvent::NetworkTopology {
                device_id: frame.device_id,
                nodes,
                at: Utc::now(),
            })
            .await
            .map_err(|e| AdapterError::Sink(e.to_string()))
    })
}

fn handle_ota_progress(
    deps: Arc<AdapterDeps>,
    _conn: Arc<ConnContext>,
    frame: Frame,
) -> RouteFuture {
    Box::pin(async move {
        let p = &frame.payload;
        if p.len() < 2 {
            debug!(device_id = %frame.device_id, "short OTA progress payload, ignoring");
            return Ok(());
        }
        deps.sink
            .handle_core_event(CoreEvent::OtaProgress {
                device_id: frame.device_id,
                percent: p[0].min(100),
                status: p[1],
                at: Utc::now(),
            })
            .await
            .map_err(|e| AdapterError::Sink(e.to_string()))
    })
}

/// The nested sub-protocol: session lifecycle, port status and parameter
/// sync all arrive as TLV packets under cmd 0x1000.
fn handle_sub_protocol(
    deps: Arc<AdapterDeps>,
    _conn: Arc<ConnContext>,
    frame: Frame,
) -> RouteFuture {
    Box::pin(async move {
        let packet = match SubPacket::parse(&frame.payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(device_id = %frame.device_id, error = %e, "malformed TLV payload, ignoring");
                return Ok(());
            }
        };
        let now = Utc::now();
        let device_id = frame.device_id.clone();
        let port_no = packet
            .uint(tlv::TAG_PORT_NO)
            .or_else(|| packet.uint(tlv::TAG_SOCKET_NO))
            .unwrap_or(0) as u32;
        let business_no = packet
            .text(tlv::TAG_BUSINESS_NO)
            .unwrap_or_default()
            .to_owned();
        let raw_status = packet.uint(tlv::TAG_RAW_STATUS).unwrap_or(0) as u8;

        let event = match packet.selector() {
            Some(tlv::SUB_SESSION_STARTED) => CoreEvent::SessionStarted {
                device_id,
                port_no,
                business_no,
                session_id: None,
                raw_status,
                at: now,
            },
            Some(tlv::SUB_SESSION_PROGRESS) => CoreEvent::SessionProgress {
                device_id,
                port_no,
                business_no,
                raw_status,
                energy_cwh: packet.uint(tlv::TAG_ENERGY),
                duration_sec: packet.uint(tlv::TAG_DURATION),
                power_w: packet.uint(tlv::TAG_POWER).map(|v| v as u32),
                at: now,
            },
            Some(tlv::SUB_SESSION_ENDED) => {
                let reason = packet.uint(tlv::TAG_END_REASON).unwrap_or(0) as u8;
                CoreEvent::SessionEnded {
                    device_id,
                    port_no,
                    business_no,
                    next_raw_status: raw_status,
                    duration_sec: packet.uint(tlv::TAG_DURATION),
                    energy_cwh: packet.uint(tlv::TAG_ENERGY),
                    reason,
                    reason_label: deps.reason_map.get(&reason).cloned(),
                    at: now,
                }
            }
            Some(tlv::SUB_PORT_STATUS) => CoreEvent::PortSnapshot {
                device_id,
                port_no,
                raw_status,
                readings: PortReadings {
                    power_w: packet.uint(tlv::TAG_POWER).map(|v| v as u32),
                    voltage_dv: packet.uint(tlv::TAG_VOLTAGE).map(|v| v as u32),
                    current_ma: packet.uint(tlv::TAG_CURRENT).map(|v| v as u32),
                    temperature_c: packet.uint(tlv::TAG_TEMPERATURE).map(|v| v as i32),
                },
                at: now,
            },
            Some(tlv::SUB_PARAM_SYNC) => CoreEvent::ParamSync {
                device_id,
                entries: packet
                    .records
                    .iter()
                    .map(|r| ParamEntry {
                        tag: r.tag,
                        value: r.value.clone(),
                    })
                    .collect(),
                at: now,
            },
            other => {
                debug!(device_id = %frame.device_id, sub_cmd = ?other, "unknown sub-cmd, ignoring");
                return Ok(());
            }
        };
        deps.sink
            .handle_core_event(event)
            .await
            .map_err(|e| AdapterError::Sink(e.to_string()))
    })
}

fn handle_downlink_ack(
    deps: Arc<AdapterDeps>,
    _conn: Arc<ConnContext>,
    frame: Frame,
) -> RouteFuture {
    Box::pin(async move {
        let result = frame.payload.first().copied().unwrap_or(0);
        if let Err(e) = deps
            .queue
            .ack(
                &frame.device_id,
                frame.msg_id,
                result == 0,
                (result != 0).then_some(result),
            )
            .await
        {
            warn!(device_id = %frame.device_id, error = %e, "ack handling failed");
        }
        Ok(())
    })
}

/// A param-read ACK carries the result byte followed by TLV records; emit
/// them as a ParamResult event on top of the queue transition.
fn handle_param_read_ack(
    deps: Arc<AdapterDeps>,
    _conn: Arc<ConnContext>,
    frame: Frame,
) -> RouteFuture {
    Box::pin(async move {
        let result = frame.payload.first().copied().unwrap_or(0);
        if let Err(e) = deps
            .queue
            .ack(
                &frame.device_id,
                frame.msg_id,
                result == 0,
                (result != 0).then_some(result),
            )
            .await
        {
            warn!(device_id = %frame.device_id, error = %e, "ack handling failed");
        }

        let entries = if frame.payload.len() > 1 {
            match tlv::parse_records(&frame.payload[1..]) {
                Ok(records) => records
                    .into_iter()
                    .map(|r| ParamEntry {
                        tag: r.tag,
                        value: r.value,
                    })
                    .collect(),
                Err(e) => {
                    debug!(device_id = %frame.device_id, error = %e, "malformed param result TLVs");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        deps.sink
            .handle_core_event(CoreEvent::ParamResult {
                device_id: frame.device_id,
                msg_id: frame.msg_id,
                success: result == 0,
                entries,
                at: Utc::now(),
            })
            .await
            .map_err(|e| AdapterError::Sink(e.to_string()))
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterDeps;
    use crate::config::OutboundConfig;
    use crate::driver::DriverCore;
    use crate::metrics::Metrics;
    use crate::outbound::{wire_msg_id, OutboundQueue};
    use crate::store::Store;
    use crate::push::NoopPusher;
    use crate::session::LocalRegistry;
    use crate::store::{MemStore, NewOutbound, OutboundStatus};
    use gw_protocol::{PortStatus, Priority};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const DEVICE: &str = "82241218000382";

    struct Fixture {
        adapter: Arc<BkvAdapter>,
        store: Arc<MemStore>,
        conn: Arc<ConnContext>,
        _write_rx: mpsc::Receiver<Vec<u8>>,
    }

    fn fixture() -> Fixture {
        fixture_with_reasons(HashMap::new())
    }

    fn fixture_with_reasons(reason_map: HashMap<u8, String>) -> Fixture {
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
        let adapter = BkvAdapter::new(Arc::new(AdapterDeps {
            sink,
            registry,
            queue,
            store: store.clone(),
            metrics,
            reason_map,
        }));
        let (conn, write_rx) = ConnContext::new(
            1,
            "127.0.0.1:1".parse().unwrap(),
            Duration::from_millis(100),
        );
        Fixture {
            adapter,
            store,
            conn,
            _write_rx: write_rx,
        }
    }

    #[tokio::test]
    async fn heartbeat_enqueues_bcd_timestamp_reply() {
        let fx = fixture();
        let mut handler = fx.adapter.bind(fx.conn.clone());
        handler
            .process_bytes(&gw_test_utils::bkv_heartbeat(DEVICE, 5))
            .await
            .unwrap();

        let due = fx
            .store
            .due_pending(chrono::Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].cmd, CMD_HEARTBEAT);
        assert_eq!(due[0].timeout_sec, 0);
        assert_eq!(due[0].payload.len(), 7);
        // The first BCD byte of the year is 0x20 for this century.
        assert_eq!(due[0].payload[0], 0x20);
    }

    #[tokio::test]
    async fn session_ended_resolves_reason_label_from_dictionary() {
        let mut reasons = HashMap::new();
        reasons.insert(2u8, "balance exhausted".to_owned());
        let fx = fixture_with_reasons(reasons);
        let mut handler = fx.adapter.bind(fx.conn.clone());
        handler
            .process_bytes(&gw_test_utils::bkv_session_ended(
                DEVICE, 6, 0, "10C3", 0x90, 300, 50, 2,
            ))
            .await
            .unwrap();

        let port = fx.store.port(DEVICE, 0).await.unwrap().unwrap();
        assert_eq!(port.status, PortStatus::Idle);
        assert_eq!(port.raw_status, 0x90);
        assert_eq!(port.duration_sec, Some(300));
    }

    #[tokio::test]
    async fn exception_report_lands_in_the_audit_log() {
        let fx = fixture();
        let mut handler = fx.adapter.bind(fx.conn.clone());
        handler
            .process_bytes(&gw_test_utils::bkv_exception(
                DEVICE,
                7,
                0x0102,
                "meter read failed",
            ))
            .await
            .unwrap();

        let audit = fx.store.audit_entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].kind, "exception");
        assert_eq!(audit[0].detail["code"], 0x0102);
    }

    #[tokio::test]
    async fn ota_progress_is_audited() {
        let fx = fixture();
        let mut handler = fx.adapter.bind(fx.conn.clone());
        handler
            .process_bytes(&gw_test_utils::bkv_ota_progress(DEVICE, 8, 55, 1))
            .await
            .unwrap();

        let audit = fx.store.audit_entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].kind, "ota_progress");
        assert_eq!(audit[0].detail["percent"], 55);
    }

    #[tokio::test]
    async fn param_read_ack_completes_row_and_records_result() {
        let fx = fixture();
        let id = fx
            .store
            .seed_outbound(NewOutbound {
                phy_id: DEVICE.to_owned(),
                family: ProtocolFamily::B,
                cmd: CMD_PARAM_READ,
                payload: vec![tlv::TAG_RAW_STATUS],
                priority: Priority::Normal.as_i16(),
                timeout_sec: 30,
                msg_id: None,
                at: chrono::Utc::now(),
            })
            .await;
        let msg_id = wire_msg_id(ProtocolFamily::B, id);
        fx.store
            .set_sent(id, msg_id, chrono::Utc::now())
            .await
            .unwrap();

        // Result byte 0 (ok) followed by the requested TLV record.
        let mut payload = vec![0u8];
        payload.extend_from_slice(&tlv::encode_records(&[Tlv::new(
            tlv::TAG_RAW_STATUS,
            vec![0x80],
        )]));
        let ack = Frame::build(DEVICE, msg_id, Direction::Uplink, CMD_PARAM_READ, &payload);

        let mut handler = fx.adapter.bind(fx.conn.clone());
        handler.process_bytes(&ack).await.unwrap();

        assert_eq!(
            fx.store.outbound_row(id).await.unwrap().unwrap().status,
            OutboundStatus::Done
        );
        let audit = fx.store.audit_entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].kind, "param_result");
    }

    #[tokio::test]
    async fn downlink_direction_frames_from_devices_are_dropped() {
        let fx = fixture();
        let mut handler = fx.adapter.bind(fx.conn.clone());
        let spoofed = Frame::build(DEVICE, 9, Direction::Downlink, CMD_HEARTBEAT, &[]);
        handler.process_bytes(&spoofed).await.unwrap();
        assert!(fx.store.device(DEVICE).await.unwrap().is_none());
        assert_eq!(fx.store.cmd_log_count(DEVICE).await.unwrap(), 0);
    }

    #[test]
    fn encode_commands_produce_tlv_payloads() {
        let fx = fixture();
        let (cmd, payload) = fx
            .adapter
            .encode_command(&CoreCommand::StartCharge {
                device_id: DEVICE.to_owned(),
                port_no: 0,
                business_no: "10C3".to_owned(),
                duration_sec: Some(1800),
                energy_limit_cwh: Some(500),
            })
            .unwrap();
        assert_eq!(cmd, CMD_START_CHARGE);
        let records = tlv::parse_records(&payload).unwrap();
        assert_eq!(
            records
                .iter()
                .find(|r| r.tag == tlv::TAG_BUSINESS_NO)
                .and_then(Tlv::as_text),
            Some("10C3")
        );
        assert_eq!(
            records
                .iter()
                .find(|r| r.tag == tlv::TAG_DURATION)
                .and_then(Tlv::as_uint),
            Some(1800)
        );

        let (cmd, payload) = fx
            .adapter
            .encode_command(&CoreCommand::PushOta {
                device_id: DEVICE.to_owned(),
                version: "2.4.1".to_owned(),
                url: "https://fw.example/2.4.1.bin".to_owned(),
            })
            .unwrap();
        assert_eq!(cmd, CMD_OTA_PUSH);
        let records = tlv::parse_records(&payload).unwrap();
        assert!(records.iter().any(|r| r.tag == tlv::TAG_FW_URL));
    }
}
