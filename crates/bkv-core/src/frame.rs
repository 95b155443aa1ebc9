//! Frame parse/build for the BKV family.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Leading magic.
pub const MAGIC: [u8; 2] = [0xFC, 0xFE];

/// Trailing constant.
pub const TAIL: [u8; 2] = [0x0D, 0x0A];

/// Shortest possible frame: magic + data_len + msg_id + direction +
/// device_id_len + cmd + checksum + tail with empty device id and payload.
pub const MIN_FRAME_LEN: usize = 2 + 2 + 4 + 1 + 1 + 2 + 2 + 2;

/// Hard cap on a whole frame; anything larger is treated as corruption.
pub const MAX_FRAME_LEN: usize = 4096;

/// Overhead outside `data_len`: magic, data_len itself, checksum, tail.
const ENVELOPE: usize = 8;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Frame direction byte. The device marks its frames `0x86`; the platform's
/// frames carry `0x00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Downlink,
    Uplink,
}

impl Direction {
    pub fn to_wire(self) -> u8 {
        match self {
            Direction::Downlink => 0x00,
            Direction::Uplink => 0x86,
        }
    }

    pub fn from_wire(b: u8) -> Option<Direction> {
        match b {
            0x00 => Some(Direction::Downlink),
            0x86 => Some(Direction::Uplink),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ParseError
// ---------------------------------------------------------------------------

/// Typed rejection reasons for [`Frame::parse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("frame shorter than minimum ({0} < {MIN_FRAME_LEN})")]
    ShortFrame(usize),
    #[error("magic mismatch")]
    BadMagic,
    #[error("declared data length {declared} does not match observed frame of {observed} bytes")]
    BadLength { declared: usize, observed: usize },
    #[error("unknown direction byte {0:#04x}")]
    BadDirection(u8),
    #[error("device id does not fit in frame")]
    BadDeviceId,
    #[error("device id is not valid UTF-8")]
    DeviceIdNotUtf8,
    #[error("checksum mismatch (computed {computed:#06x}, frame carries {carried:#06x})")]
    BadChecksum { computed: u16, carried: u16 },
    #[error("tail bytes mismatch")]
    BadTail,
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One parsed BKV frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub msg_id: u32,
    pub direction: Direction,
    pub device_id: String,
    pub cmd: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Parse one complete frame; the slice must contain exactly the frame.
    pub fn parse(data: &[u8]) -> Result<Frame, ParseError> {
        if data.len() < MIN_FRAME_LEN {
            return Err(ParseError::ShortFrame(data.len()));
        }
        if data[..2] != MAGIC {
            return Err(ParseError::BadMagic);
        }
        let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
        if declared + ENVELOPE != data.len() {
            return Err(ParseError::BadLength {
                declared,
                observed: data.len(),
            });
        }
        if data[data.len() - 2..] != TAIL {
            return Err(ParseError::BadTail);
        }
        let computed = checksum(&data[..data.len() - 4]);
        let carried = u16::from_be_bytes([data[data.len() - 4], data[data.len() - 3]]);
        if computed != carried {
            return Err(ParseError::BadChecksum { computed, carried });
        }
        let msg_id = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let direction = Direction::from_wire(data[8]).ok_or(ParseError::BadDirection(data[8]))?;
        let device_id_len = data[9] as usize;
        // device_id + cmd must fit before the checksum
        if 10 + device_id_len + 2 > data.len() - 4 {
            return Err(ParseError::BadDeviceId);
        }
        let device_id = std::str::from_utf8(&data[10..10 + device_id_len])
            .map_err(|_| ParseError::DeviceIdNotUtf8)?
            .to_owned();
        let cmd = u16::from_be_bytes([data[10 + device_id_len], data[11 + device_id_len]]);
        let payload = data[12 + device_id_len..data.len() - 4].to_vec();
        Ok(Frame {
            msg_id,
            direction,
            device_id,
            cmd,
            payload,
        })
    }

    /// Build the wire bytes for a frame. `parse(build(..))` round-trips.
    pub fn build(
        device_id: &str,
        msg_id: u32,
        direction: Direction,
        cmd: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let data_len = 4 + 1 + 1 + device_id.len() + 2 + payload.len();
        let mut out = Vec::with_capacity(data_len + ENVELOPE);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&(data_len as u16).to_be_bytes());
        out.extend_from_slice(&msg_id.to_be_bytes());
        out.push(direction.to_wire());
        out.push(device_id.len() as u8);
        out.extend_from_slice(device_id.as_bytes());
        out.extend_from_slice(&cmd.to_be_bytes());
        out.extend_from_slice(payload);
        let sum = checksum(&out);
        out.extend_from_slice(&sum.to_be_bytes());
        out.extend_from_slice(&TAIL);
        out
    }

    /// Wire bytes for this frame.
    pub fn encode(&self) -> Vec<u8> {
        Frame::build(
            &self.device_id,
            self.msg_id,
            self.direction,
            self.cmd,
            &self.payload,
        )
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "BKV device_id={} msg_id={} cmd={:#06x} dir={:?} payload={}B",
            self.device_id,
            self.msg_id,
            self.cmd,
            self.direction,
            self.payload.len()
        )
    }
}

/// Low 16 bits of the unsigned byte-sum.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().map(|&b| u32::from(b)).sum::<u32>() as u16
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
