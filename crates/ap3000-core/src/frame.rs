//! Frame parse/build for the AP3000 family.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Leading magic, `"DNY"` in ASCII.
pub const MAGIC: [u8; 3] = [0x44, 0x4E, 0x59];

/// Shortest possible frame: magic + len + phy_id_len + msg_id + cmd + checksum
/// with an empty phy_id and payload.
pub const MIN_FRAME_LEN: usize = 3 + 2 + 1 + 2 + 1 + 2;

/// Hard cap on a declared frame length; anything larger is treated as
/// stream corruption by the decoder.
pub const MAX_FRAME_LEN: usize = 1024;

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
    #[error("declared length {declared} does not match observed {observed}")]
    BadLength { declared: usize, observed: usize },
    #[error("phy id does not fit in frame")]
    BadPhyId,
    #[error("phy id is not valid UTF-8")]
    PhyIdNotUtf8,
    #[error("checksum mismatch (computed {computed:#06x}, frame carries {carried:#06x})")]
    BadChecksum { computed: u16, carried: u16 },
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One parsed AP3000 frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Device physical id, ASCII digits in practice.
    pub phy_id: String,
    /// Wire message id; echoed by the peer when acknowledging.
    pub msg_id: u16,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Parse one complete frame. The slice must contain exactly the frame,
    /// nothing more; resynchronization over a byte stream is the decoder's
    /// job.
    pub fn parse(data: &[u8]) -> Result<Frame, ParseError> {
        if data.len() < MIN_FRAME_LEN {
            return Err(ParseError::ShortFrame(data.len()));
        }
        if data[..3] != MAGIC {
            return Err(ParseError::BadMagic);
        }
        let declared = u16::from_le_bytes([data[3], data[4]]) as usize;
        if declared != data.len() {
            return Err(ParseError::BadLength {
                declared,
                observed: data.len(),
            });
        }
        let phy_id_len = data[5] as usize;
        // phy_id + msg_id + cmd + checksum must fit behind the fixed header
        if 6 + phy_id_len + 2 + 1 + 2 > data.len() {
            return Err(ParseError::BadPhyId);
        }
        let computed = checksum(&data[..data.len() - 2]);
        let carried = u16::from_le_bytes([data[data.len() - 2], data[data.len() - 1]]);
        if computed != carried {
            return Err(ParseError::BadChecksum { computed, carried });
        }
        let phy_id = std::str::from_utf8(&data[6..6 + phy_id_len])
            .map_err(|_| ParseError::PhyIdNotUtf8)?
            .to_owned();
        let msg_id = u16::from_le_bytes([data[6 + phy_id_len], data[7 + phy_id_len]]);
        let cmd = data[8 + phy_id_len];
        let payload = data[9 + phy_id_len..data.len() - 2].to_vec();
        Ok(Frame {
            phy_id,
            msg_id,
            cmd,
            payload,
        })
    }

    /// Build the wire bytes for a frame. `parse(build(..))` round-trips.
    pub fn build(phy_id: &str, msg_id: u16, cmd: u8, payload: &[u8]) -> Vec<u8> {
        let total = MIN_FRAME_LEN + phy_id.len() + payload.len();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&(total as u16).to_le_bytes());
        out.push(phy_id.len() as u8);
        out.extend_from_slice(phy_id.as_bytes());
        out.extend_from_slice(&msg_id.to_le_bytes());
        out.push(cmd);
        out.extend_from_slice(payload);
        let sum = checksum(&out);
        out.extend_from_slice(&sum.to_le_bytes());
        out
    }

    /// Wire bytes for this frame.
    pub fn encode(&self) -> Vec<u8> {
        Frame::build(&self.phy_id, self.msg_id, self.cmd, &self.payload)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "AP3000 phy_id={} msg_id={} cmd={:#04x} payload={}B",
            self.phy_id,
            self.msg_id,
            self.cmd,
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
