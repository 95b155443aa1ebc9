//! AP3000 charging-pile frame parsing and construction.
//!
//! This crate contains the wire-level types for the three-byte-magic
//! ("DNY") protocol family: frame parse/build with checksum verification,
//! and a resyncing stream decoder for use on raw TCP byte streams.
//!
//! # Framing
//!
//! ```text
//! magic[3] | total_len u16 LE | phy_id_len u8 | phy_id[..] |
//! msg_id u16 LE | cmd u8 | payload[..] | checksum u16 LE
//! ```
//!
//! `total_len` covers the entire frame including the magic and the checksum.
//! `checksum` is the low 16 bits of the unsigned byte-sum of everything
//! before it. The parser rejects rather than repairs: callers feeding dirty
//! streams should go through [`decoder::StreamDecoder`], which slides past
//! corruption one byte at a time.

pub mod decoder;
pub mod frame;

pub use decoder::StreamDecoder;
pub use frame::{Frame, ParseError, MAGIC, MAX_FRAME_LEN, MIN_FRAME_LEN};
