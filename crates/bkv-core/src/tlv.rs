//! TLV sub-protocol carried in cmd `0x1000` payloads.
//!
//! Payload layout: `sub_cmd_len u8 | sub_cmd[..] | records...` where each
//! record is `tag u8 | len | value[len]`. Tags below `0x80` use a one-byte
//! length; tags `0x80` and above use a two-byte big-endian length. Unknown
//! tags are carried through opaquely so newer device firmware does not break
//! older gateways.

use serde::{Deserialize, Serialize};

// Recognized tags.
pub const TAG_SOCKET_NO: u8 = 0x01;
pub const TAG_PORT_NO: u8 = 0x02;
pub const TAG_BUSINESS_NO: u8 = 0x03;
pub const TAG_RAW_STATUS: u8 = 0x04;
pub const TAG_ENERGY: u8 = 0x05;
pub const TAG_DURATION: u8 = 0x06;
pub const TAG_POWER: u8 = 0x07;
pub const TAG_END_REASON: u8 = 0x08;
pub const TAG_VOLTAGE: u8 = 0x09;
pub const TAG_CURRENT: u8 = 0x0A;
pub const TAG_TEMPERATURE: u8 = 0x0B;
pub const TAG_FW_VERSION: u8 = 0x10;
pub const TAG_FW_URL: u8 = 0x11;

/// Sub-command selectors (first byte of `sub_cmd`).
pub const SUB_SESSION_STARTED: u8 = 0x01;
pub const SUB_SESSION_PROGRESS: u8 = 0x02;
pub const SUB_SESSION_ENDED: u8 = 0x03;
pub const SUB_PORT_STATUS: u8 = 0x04;
pub const SUB_PARAM_SYNC: u8 = 0x05;

const RECOGNIZED: [u8; 13] = [
    TAG_SOCKET_NO,
    TAG_PORT_NO,
    TAG_BUSINESS_NO,
    TAG_RAW_STATUS,
    TAG_ENERGY,
    TAG_DURATION,
    TAG_POWER,
    TAG_END_REASON,
    TAG_VOLTAGE,
    TAG_CURRENT,
    TAG_TEMPERATURE,
    TAG_FW_VERSION,
    TAG_FW_URL,
];

pub fn is_recognized(tag: u8) -> bool {
    RECOGNIZED.contains(&tag)
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One tag/length/value record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tlv {
    pub tag: u8,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tag: u8, value: impl Into<Vec<u8>>) -> Tlv {
        Tlv {
            tag,
            value: value.into(),
        }
    }

    /// Value as big-endian unsigned integer, for the numeric tags.
    pub fn as_uint(&self) -> Option<u64> {
        if self.value.is_empty() || self.value.len() > 8 {
            return None;
        }
        let mut v: u64 = 0;
        for &b in &self.value {
            v = (v << 8) | u64::from(b);
        }
        Some(v)
    }

    /// Value as UTF-8 text (business numbers are hex text on the wire).
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// A decoded cmd-`0x1000` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPacket {
    pub sub_cmd: Vec<u8>,
    pub records: Vec<Tlv>,
}

impl SubPacket {
    pub fn new(sub_cmd: u8, records: Vec<Tlv>) -> SubPacket {
        SubPacket {
            sub_cmd: vec![sub_cmd],
            records,
        }
    }

    /// The event-selecting first byte of `sub_cmd`.
    pub fn selector(&self) -> Option<u8> {
        self.sub_cmd.first().copied()
    }

    pub fn find(&self, tag: u8) -> Option<&Tlv> {
        self.records.iter().find(|r| r.tag == tag)
    }

    pub fn uint(&self, tag: u8) -> Option<u64> {
        self.find(tag).and_then(Tlv::as_uint)
    }

    pub fn text(&self, tag: u8) -> Option<&str> {
        self.find(tag).and_then(Tlv::as_text)
    }

    // -----------------------------------------------------------------------
    // Wire codec
    // -----------------------------------------------------------------------

    pub fn parse(payload: &[u8]) -> Result<SubPacket, TlvError> {
        if payload.is_empty() {
            return Err(TlvError::Truncated);
        }
        let sub_cmd_len = payload[0] as usize;
        if 1 + sub_cmd_len > payload.len() {
            return Err(TlvError::Truncated);
        }
        let sub_cmd = payload[1..1 + sub_cmd_len].to_vec();
        let records = parse_records(&payload[1 + sub_cmd_len..])?;
        Ok(SubPacket { sub_cmd, records })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.sub_cmd.len() as u8);
        out.extend_from_slice(&self.sub_cmd);
        out.extend_from_slice(&encode_records(&self.records));
        out
    }
}

// ---------------------------------------------------------------------------
// Bare record codec
// ---------------------------------------------------------------------------

/// Parse a bare run of TLV records (downlink command payloads carry these
/// without the sub-cmd prefix).
pub fn parse_records(data: &[u8]) -> Result<Vec<Tlv>, TlvError> {
    let mut at = 0;
    let mut records = Vec::new();
    while at < data.len() {
        let tag = data[at];
        at += 1;
        let len = if tag < 0x80 {
            if at >= data.len() {
                return Err(TlvError::Truncated);
            }
            let l = data[at] as usize;
            at += 1;
            l
        } else {
            if at + 2 > data.len() {
                return Err(TlvError::Truncated);
            }
            let l = u16::from_be_bytes([data[at], data[at + 1]]) as usize;
            at += 2;
            l
        };
        if at + len > data.len() {
            return Err(TlvError::ValueOverrun { tag });
        }
        records.push(Tlv {
            tag,
            value: data[at..at + len].to_vec(),
        });
        at += len;
    }
    Ok(records)
}

pub fn encode_records(records: &[Tlv]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.push(record.tag);
        if record.tag < 0x80 {
            out.push(record.value.len() as u8);
        } else {
            out.extend_from_slice(&(record.value.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(&record.value);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TlvError {
    #[error("TLV payload truncated")]
    Truncated,
    #[error("TLV value overruns payload (tag {tag:#04x})")]
    ValueOverrun { tag: u8 },
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
