//! BKV charging-pile frame parsing and construction.
//!
//! The two-byte-magic (`FC FE`) protocol family: header-prefixed frames with
//! a direction byte, a nested TLV sub-protocol for cmd `0x1000`, a 7-byte
//! BCD timestamp used in heartbeat replies, and a resyncing stream decoder.
//!
//! # Framing
//!
//! ```text
//! magic[2] | data_len u16 BE | msg_id u32 BE | direction u8 |
//! device_id_len u8 | device_id[..] | cmd u16 BE | payload[..] |
//! checksum u16 BE | tail[2]
//! ```
//!
//! `data_len` counts msg_id through payload. `checksum` is the low 16 bits
//! of the unsigned byte-sum of everything before it. `tail` is the constant
//! `0D 0A`.

pub mod decoder;
pub mod frame;
pub mod time;
pub mod tlv;

pub use decoder::StreamDecoder;
pub use frame::{Direction, Frame, ParseError, MAGIC, MAX_FRAME_LEN, MIN_FRAME_LEN, TAIL};
pub use time::bcd_timestamp;
pub use tlv::{encode_records, parse_records, SubPacket, Tlv, TlvError};
