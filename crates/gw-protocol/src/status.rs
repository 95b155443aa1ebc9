//! Raw-status normalization.
//!
//! Devices report one status byte per port. The bitfield is preserved
//! verbatim in storage for audit; APIs and charge-admission decisions use
//! the normalized form.
//!
//! Bit layout: bit7 online, bit6 meter fault, bit5 charging, bit3 overtemp,
//! bit2 overcurrent, bit1 overpower. Bits 4 and 0 are reserved and ignored.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const RAW_ONLINE: u8 = 0x80;
pub const RAW_CHARGING: u8 = 0x20;
pub const RAW_FAULT_METER: u8 = 0x40;
pub const RAW_FAULT_OVERTEMP: u8 = 0x08;
pub const RAW_FAULT_OVERCURRENT: u8 = 0x04;
pub const RAW_FAULT_OVERPOWER: u8 = 0x02;

/// Any fault bit set forces the `fault` status.
pub const RAW_FAULT_MASK: u8 =
    RAW_FAULT_METER | RAW_FAULT_OVERTEMP | RAW_FAULT_OVERCURRENT | RAW_FAULT_OVERPOWER;

/// Normalized port status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Offline,
    Idle,
    Charging,
    Fault,
}

impl PortStatus {
    /// Normalize a device status byte. Precedence: offline, then fault,
    /// then charging, else idle.
    pub fn from_raw(raw: u8) -> PortStatus {
        if raw & RAW_ONLINE == 0 {
            PortStatus::Offline
        } else if raw & RAW_FAULT_MASK != 0 {
            PortStatus::Fault
        } else if raw & RAW_CHARGING != 0 {
            PortStatus::Charging
        } else {
            PortStatus::Idle
        }
    }

    /// Idle is the only status a start-charge command is admitted from.
    pub fn can_charge(self) -> bool {
        self == PortStatus::Idle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortStatus::Offline => "offline",
            PortStatus::Idle => "idle",
            PortStatus::Charging => "charging",
            PortStatus::Fault => "fault",
        }
    }

    pub fn parse(s: &str) -> Option<PortStatus> {
        match s {
            "offline" => Some(PortStatus::Offline),
            "idle" => Some(PortStatus::Idle),
            "charging" => Some(PortStatus::Charging),
            "fault" => Some(PortStatus::Fault),
            _ => None,
        }
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
