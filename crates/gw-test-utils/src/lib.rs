//! Shared helpers for gateway integration tests.
//!
//! Builds valid wire frames for both protocol families (the same payload
//! layouts the adapters decode) and provides a small event collector that
//! tests can hand to the core as a recording sink.

use bkv_core::tlv::{self, SubPacket, Tlv};
use bkv_core::Direction;
use gw_protocol::CoreEvent;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Family A frame builders
// ---------------------------------------------------------------------------

pub fn ap_heartbeat(phy_id: &str, msg_id: u16) -> Vec<u8> {
    ap3000_core::Frame::build(phy_id, msg_id, 0x01, &[])
}

pub fn ap_register(phy_id: &str, msg_id: u16, port_count: u8, firmware: &str) -> Vec<u8> {
    let mut payload = vec![port_count];
    payload.extend_from_slice(firmware.as_bytes());
    ap3000_core::Frame::build(phy_id, msg_id, 0x02, &payload)
}

pub fn ap_port_status(
    phy_id: &str,
    msg_id: u16,
    port_no: u8,
    raw_status: u8,
    power_w: u16,
    voltage_dv: u16,
    current_ma: u16,
    temperature_c: i8,
) -> Vec<u8> {
    let mut payload = vec![port_no, raw_status];
    payload.extend_from_slice(&power_w.to_le_bytes());
    payload.extend_from_slice(&voltage_dv.to_le_bytes());
    payload.extend_from_slice(&current_ma.to_le_bytes());
    payload.push(temperature_c as u8);
    ap3000_core::Frame::build(phy_id, msg_id, 0x03, &payload)
}

pub fn ap_session_started(
    phy_id: &str,
    msg_id: u16,
    port_no: u8,
    business: u16,
    raw_status: u8,
) -> Vec<u8> {
    let mut payload = vec![port_no];
    payload.extend_from_slice(&business.to_le_bytes());
    payload.push(raw_status);
    ap3000_core::Frame::build(phy_id, msg_id, 0x04, &payload)
}

#[allow(clippy::too_many_arguments)]
pub fn ap_session_progress(
    phy_id: &str,
    msg_id: u16,
    port_no: u8,
    business: u16,
    raw_status: u8,
    energy_cwh: u32,
    duration_sec: u32,
    power_w: u16,
) -> Vec<u8> {
    let mut payload = vec![port_no];
    payload.extend_from_slice(&business.to_le_bytes());
    payload.push(raw_status);
    payload.extend_from_slice(&energy_cwh.to_le_bytes());
    payload.extend_from_slice(&duration_sec.to_le_bytes());
    payload.extend_from_slice(&power_w.to_le_bytes());
    ap3000_core::Frame::build(phy_id, msg_id, 0x05, &payload)
}

#[allow(clippy::too_many_arguments)]
pub fn ap_session_ended(
    phy_id: &str,
    msg_id: u16,
    port_no: u8,
    business: u16,
    next_raw_status: u8,
    duration_sec: u32,
    energy_cwh: u32,
    reason: u8,
) -> Vec<u8> {
    let mut payload = vec![port_no];
    payload.extend_from_slice(&business.to_le_bytes());
    payload.push(next_raw_status);
    payload.extend_from_slice(&duration_sec.to_le_bytes());
    payload.extend_from_slice(&energy_cwh.to_le_bytes());
    payload.push(reason);
    ap3000_core::Frame::build(phy_id, msg_id, 0x06, &payload)
}

/// Device reply to a downlink: same cmd, same msg_id, result in byte 0.
pub fn ap_ack(phy_id: &str, msg_id: u16, cmd: u8, result: u8) -> Vec<u8> {
    ap3000_core::Frame::build(phy_id, msg_id, cmd, &[result])
}

// ---------------------------------------------------------------------------
// Family B frame builders
// ---------------------------------------------------------------------------

pub fn bkv_heartbeat(device_id: &str, msg_id: u32) -> Vec<u8> {
    bkv_core::Frame::build(device_id, msg_id, Direction::Uplink, 0x0000, &[])
}

pub fn bkv_register(device_id: &str, msg_id: u32, firmware: &str) -> Vec<u8> {
    bkv_core::Frame::build(
        device_id,
        msg_id,
        Direction::Uplink,
        0x0001,
        firmware.as_bytes(),
    )
}

pub fn bkv_session_started(
    device_id: &str,
    msg_id: u32,
    port_no: u8,
    business: &str,
    raw_status: u8,
) -> Vec<u8> {
    let packet = SubPacket::new(
        tlv::SUB_SESSION_STARTED,
        vec![
            Tlv::new(tlv::TAG_PORT_NO, vec![port_no]),
            Tlv::new(tlv::TAG_BUSINESS_NO, business.as_bytes().to_vec()),
            Tlv::new(tlv::TAG_RAW_STATUS, vec![raw_status]),
        ],
    );
    bkv_core::Frame::build(device_id, msg_id, Direction::Uplink, 0x1000, &packet.encode())
}

#[allow(clippy::too_many_arguments)]
pub fn bkv_session_progress(
    device_id: &str,
    msg_id: u32,
    port_no: u8,
    business: &str,
    raw_status: u8,
    energy_cwh: u32,
    duration_sec: u32,
    power_w: u16,
) -> Vec<u8> {
    let packet = SubPacket::new(
        tlv::SUB_SESSION_PROGRESS,
        vec![
            Tlv::new(tlv::TAG_PORT_NO, vec![port_no]),
            Tlv::new(tlv::TAG_BUSINESS_NO, business.as_bytes().to_vec()),
            Tlv::new(tlv::TAG_RAW_STATUS, vec![raw_status]),
            Tlv::new(tlv::TAG_ENERGY, energy_cwh.to_be_bytes().to_vec()),
            Tlv::new(tlv::TAG_DURATION, duration_sec.to_be_bytes().to_vec()),
            Tlv::new(tlv::TAG_POWER, power_w.to_be_bytes().to_vec()),
        ],
    );
    bkv_core::Frame::build(device_id, msg_id, Direction::Uplink, 0x1000, &packet.encode())
}

#[allow(clippy::too_many_arguments)]
pub fn bkv_session_ended(
    device_id: &str,
    msg_id: u32,
    port_no: u8,
    business: &str,
    next_raw_status: u8,
    duration_sec: u32,
    energy_cwh: u32,
    reason: u8,
) -> Vec<u8> {
    let packet = SubPacket::new(
        tlv::SUB_SESSION_ENDED,
        vec![
            Tlv::new(tlv::TAG_PORT_NO, vec![port_no]),
            Tlv::new(tlv::TAG_BUSINESS_NO, business.as_bytes().to_vec()),
            Tlv::new(tlv::TAG_RAW_STATUS, vec![next_raw_status]),
            Tlv::new(tlv::TAG_DURATION, duration_sec.to_be_bytes().to_vec()),
            Tlv::new(tlv::TAG_ENERGY, energy_cwh.to_be_bytes().to_vec()),
            Tlv::new(tlv::TAG_END_REASON, vec![reason]),
        ],
    );
    bkv_core::Frame::build(device_id, msg_id, Direction::Uplink, 0x1000, &packet.encode())
}

pub fn bkv_port_status(
    device_id: &str,
    msg_id: u32,
    port_no: u8,
    raw_status: u8,
    power_w: u16,
) -> Vec<u8> {
    let packet = SubPacket::new(
        tlv::SUB_PORT_STATUS,
        vec![
            Tlv::new(tlv::TAG_PORT_NO, vec![port_no]),
            Tlv::new(tlv::TAG_RAW_STATUS, vec![raw_status]),
            Tlv::new(tlv::TAG_POWER, power_w.to_be_bytes().to_vec()),
        ],
    );
    bkv_core::Frame::build(device_id, msg_id, Direction::Uplink, 0x1000, &packet.encode())
}

/// Device reply to a downlink: same cmd, same msg_id, result in byte 0.
pub fn bkv_ack(device_id: &str, msg_id: u32, cmd: u16, result: u8) -> Vec<u8> {
    bkv_core::Frame::build(device_id, msg_id, Direction::Uplink, cmd, &[result])
}

pub fn bkv_exception(device_id: &str, msg_id: u32, code: u16, detail: &str) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(detail.as_bytes());
    bkv_core::Frame::build(device_id, msg_id, Direction::Uplink, 0x0003, &payload)
}

pub fn bkv_ota_progress(device_id: &str, msg_id: u32, percent: u8, status: u8) -> Vec<u8> {
    bkv_core::Frame::build(
        device_id,
        msg_id,
        Direction::Uplink,
        0x3001,
        &[percent, status],
    )
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Thread-safe CoreEvent collector for assertions.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<CoreEvent>>>,
}

impl EventLog {
    pub fn new() -> EventLog {
        EventLog::default()
    }

    pub fn push(&self, event: CoreEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<CoreEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll until at least `n` events arrived or `timeout` elapses.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<CoreEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len() >= n || tokio::time::Instant::now() >= deadline {
                return self.snapshot();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ap_builders_produce_parseable_frames() {
        let frame = ap3000_core::Frame::parse(&ap_session_started("123", 5, 0, 0x10C3, 0xA0))
            .expect("valid frame");
        assert_eq!(frame.cmd, 0x04);
        assert_eq!(frame.payload[0], 0);
    }

    #[test]
    fn bkv_builders_produce_parseable_frames() {
        let frame = bkv_core::Frame::parse(&bkv_session_ended(
            "82241218000382",
            9,
            0,
            "10C3",
            0x90,
            300,
            50,
            1,
        ))
        .expect("valid frame");
        assert_eq!(frame.cmd, 0x1000);
        let packet = SubPacket::parse(&frame.payload).expect("valid sub-packet");
        assert_eq!(packet.selector(), Some(tlv::SUB_SESSION_ENDED));
        assert_eq!(packet.uint(tlv::TAG_DURATION), Some(300));
    }
}
