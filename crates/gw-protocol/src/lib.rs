// gw-protocol: protocol-agnostic event and command types.
//
// Everything that crosses the adapter boundary is a tagged union with a
// top-level `kind` field for discriminated (de)serialization. Adapters
// normalize wire frames into `CoreEvent` and consume `CoreCommand`; nothing
// downstream of the adapters sees family-specific framing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod status;

pub use status::{PortStatus, RAW_CHARGING, RAW_FAULT_MASK, RAW_ONLINE};

// ---------------------------------------------------------------------------
// Protocol family
// ---------------------------------------------------------------------------

/// Wire protocol family a connection was bound to at sniff time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolFamily {
    /// Three-byte `DNY` magic.
    A,
    /// Two-byte `FC FE` magic with TLV sub-protocol.
    B,
}

impl ProtocolFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolFamily::A => "A",
            ProtocolFamily::B => "B",
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// One device parameter, tag/value as the wire carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub tag: u8,
    pub value: Vec<u8>,
}

/// Electrical readings attached to a port snapshot. All optional — Family A
/// status frames carry them, Family B only sends what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortReadings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_dv: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_ma: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<i32>,
}

// ---------------------------------------------------------------------------
// CoreEvent (adapter -> core)
// ---------------------------------------------------------------------------

/// Normalized uplink event. One enum variant per event type so dispatch
/// switches stay exhaustive and trivially auditable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreEvent {
    DeviceHeartbeat {
        device_id: String,
        at: DateTime<Utc>,
    },
    DeviceRegistered {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        firmware: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port_count: Option<u32>,
        at: DateTime<Utc>,
    },
    PortSnapshot {
        device_id: String,
        port_no: u32,
        /// Device bitfield, preserved verbatim for audit.
        raw_status: u8,
        #[serde(default)]
        readings: PortReadings,
        at: DateTime<Utc>,
    },
    SessionStarted {
        device_id: String,
        port_no: u32,
        /// Device-assigned order handle, hex text (e.g. `"10C3"`).
        business_no: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        raw_status: u8,
        at: DateTime<Utc>,
    },
    SessionProgress {
        device_id: String,
        port_no: u32,
        business_no: String,
        raw_status: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        energy_cwh: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_sec: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        power_w: Option<u32>,
        at: DateTime<Utc>,
    },
    SessionEnded {
        device_id: String,
        port_no: u32,
        business_no: String,
        /// Status the device reports the port settles into after the stop.
        next_raw_status: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_sec: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        energy_cwh: Option<u64>,
        reason: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason_label: Option<String>,
        at: DateTime<Utc>,
    },
    ParamResult {
        device_id: String,
        msg_id: u32,
        success: bool,
        #[serde(default)]
        entries: Vec<ParamEntry>,
        at: DateTime<Utc>,
    },
    ParamSync {
        device_id: String,
        #[serde(default)]
        entries: Vec<ParamEntry>,
        at: DateTime<Utc>,
    },
    OtaProgress {
        device_id: String,
        percent: u8,
        status: u8,
        at: DateTime<Utc>,
    },
    NetworkTopology {
        device_id: String,
        #[serde(default)]
        nodes: Vec<String>,
        at: DateTime<Utc>,
    },
    Exception {
        device_id: String,
        code: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        at: DateTime<Utc>,
    },
}

impl CoreEvent {
    /// Device the event belongs to.
    pub fn device_id(&self) -> &str {
        match self {
            CoreEvent::DeviceHeartbeat { device_id, .. }
            | CoreEvent::DeviceRegistered { device_id, .. }
            | CoreEvent::PortSnapshot { device_id, .. }
            | CoreEvent::SessionStarted { device_id, .. }
            | CoreEvent::SessionProgress { device_id, .. }
            | CoreEvent::SessionEnded { device_id, .. }
            | CoreEvent::ParamResult { device_id, .. }
            | CoreEvent::ParamSync { device_id, .. }
            | CoreEvent::OtaProgress { device_id, .. }
            | CoreEvent::NetworkTopology { device_id, .. }
            | CoreEvent::Exception { device_id, .. } => device_id,
        }
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreEvent::DeviceHeartbeat { .. } => "device_heartbeat",
            CoreEvent::DeviceRegistered { .. } => "device_registered",
            CoreEvent::PortSnapshot { .. } => "port_snapshot",
            CoreEvent::SessionStarted { .. } => "session_started",
            CoreEvent::SessionProgress { .. } => "session_progress",
            CoreEvent::SessionEnded { .. } => "session_ended",
            CoreEvent::ParamResult { .. } => "param_result",
            CoreEvent::ParamSync { .. } => "param_sync",
            CoreEvent::OtaProgress { .. } => "ota_progress",
            CoreEvent::NetworkTopology { .. } => "network_topology",
            CoreEvent::Exception { .. } => "exception",
        }
    }
}

// ---------------------------------------------------------------------------
// CoreCommand (core -> adapter)
// ---------------------------------------------------------------------------

/// Normalized downlink command. The adapter bound to the device's family
/// turns this into wire bytes at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreCommand {
    StartCharge {
        device_id: String,
        port_no: u32,
        business_no: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_sec: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        energy_limit_cwh: Option<u32>,
    },
    StopCharge {
        device_id: String,
        port_no: u32,
        business_no: String,
    },
    QueryStatus {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port_no: Option<u32>,
    },
    WriteParams {
        device_id: String,
        entries: Vec<ParamEntry>,
    },
    ReadParams {
        device_id: String,
        tags: Vec<u8>,
    },
    PushOta {
        device_id: String,
        version: String,
        url: String,
    },
}

impl CoreCommand {
    pub fn device_id(&self) -> &str {
        match self {
            CoreCommand::StartCharge { device_id, .. }
            | CoreCommand::StopCharge { device_id, .. }
            | CoreCommand::QueryStatus { device_id, .. }
            | CoreCommand::WriteParams { device_id, .. }
            | CoreCommand::ReadParams { device_id, .. }
            | CoreCommand::PushOta { device_id, .. } => device_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoreCommand::StartCharge { .. } => "start_charge",
            CoreCommand::StopCharge { .. } => "stop_charge",
            CoreCommand::QueryStatus { .. } => "query_status",
            CoreCommand::WriteParams { .. } => "write_params",
            CoreCommand::ReadParams { .. } => "read_params",
            CoreCommand::PushOta { .. } => "push_ota",
        }
    }

    /// The command's place on the priority ladder. Pure function of the
    /// command kind so every producer agrees.
    pub fn priority(&self) -> Priority {
        match self {
            CoreCommand::StopCharge { .. } => Priority::Emergency,
            CoreCommand::StartCharge { .. } | CoreCommand::QueryStatus { .. } => Priority::High,
            CoreCommand::WriteParams { .. } | CoreCommand::ReadParams { .. } => Priority::Normal,
            CoreCommand::PushOta { .. } => Priority::Low,
        }
    }
}

// ---------------------------------------------------------------------------
// Priority ladder
// ---------------------------------------------------------------------------

/// Outbound priority; smaller wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Emergency,
    High,
    Normal,
    Low,
    Background,
}

impl Priority {
    pub fn as_i16(self) -> i16 {
        match self {
            Priority::Emergency => 1,
            Priority::High => 2,
            Priority::Normal => 3,
            Priority::Low => 4,
            Priority::Background => 5,
        }
    }

    pub fn from_i16(v: i16) -> Priority {
        match v {
            i16::MIN..=1 => Priority::Emergency,
            2 => Priority::High,
            3 => Priority::Normal,
            4 => Priority::Low,
            _ => Priority::Background,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_i16())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn core_event_serializes_with_kind_tag() {
        let event = CoreEvent::DeviceHeartbeat {
            device_id: "82241218000382".to_owned(),
            at: Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"device_heartbeat\""));
        let back: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn device_id_accessor_covers_all_variants() {
        let at = Utc::now();
        let event = CoreEvent::Exception {
            device_id: "d1".to_owned(),
            code: 7,
            detail: None,
            at,
        };
        assert_eq!(event.device_id(), "d1");
        assert_eq!(event.kind(), "exception");
    }

    #[test]
    fn priority_ladder_matches_command_kinds() {
        let stop = CoreCommand::StopCharge {
            device_id: "d".to_owned(),
            port_no: 0,
            business_no: "10C3".to_owned(),
        };
        let start = CoreCommand::StartCharge {
            device_id: "d".to_owned(),
            port_no: 0,
            business_no: "10C3".to_owned(),
            duration_sec: None,
            energy_limit_cwh: None,
        };
        let ota = CoreCommand::PushOta {
            device_id: "d".to_owned(),
            version: "1.2".to_owned(),
            url: "http://example/fw.bin".to_owned(),
        };
        assert_eq!(stop.priority(), Priority::Emergency);
        assert_eq!(start.priority(), Priority::High);
        assert_eq!(ota.priority(), Priority::Low);
        assert!(stop.priority() < start.priority());
    }

    #[test]
    fn priority_round_trips_through_i16() {
        for p in [
            Priority::Emergency,
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::Background,
        ] {
            assert_eq!(Priority::from_i16(p.as_i16()), p);
        }
    }
}
