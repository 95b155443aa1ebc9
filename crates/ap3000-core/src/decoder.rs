//! Resyncing stream decoder.
//!
//! TCP gives no framing guarantees: reads arrive split, coalesced, and
//! occasionally mid-garbage (serial-bridge devices are noisy). The decoder
//! keeps an internal buffer, discards bytes before the next magic, and
//! slides one byte past anything that fails length or checksum validation,
//! so it always makes forward progress and never grows without bound.

use crate::frame::{checksum, Frame, MAGIC, MAX_FRAME_LEN, MIN_FRAME_LEN};

/// Accumulates raw bytes and yields verified [`Frame`]s.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    /// Frames yielded since construction.
    emitted: u64,
    /// Single-byte slides past corruption since construction.
    slides: u64,
}

impl StreamDecoder {
    pub fn new() -> StreamDecoder {
        StreamDecoder::default()
    }

    /// Bytes currently buffered (waiting for the rest of a frame).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.emitted
    }

    pub fn corruption_slides(&self) -> u64 {
        self.slides
    }

    /// Append `data` and return every complete, checksum-verified frame now
    /// available. Incomplete tails stay buffered for the next feed.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            // Locate the next magic; everything before it is garbage.
            match find_magic(&self.buf) {
                Some(0) => {}
                Some(at) => {
                    self.buf.drain(..at);
                }
                None => {
                    // Keep a potential partial magic at the tail.
                    let keep = partial_magic_tail(&self.buf);
                    let drop = self.buf.len() - keep;
                    self.buf.drain(..drop);
                    break;
                }
            }

            if self.buf.len() < MIN_FRAME_LEN {
                break;
            }

            let declared = u16::from_le_bytes([self.buf[3], self.buf[4]]) as usize;
            if declared < MIN_FRAME_LEN || declared > MAX_FRAME_LEN {
                self.slide();
                continue;
            }
            if self.buf.len() < declared {
                break;
            }

            let carried = u16::from_le_bytes([self.buf[declared - 2], self.buf[declared - 1]]);
            if checksum(&self.buf[..declared - 2]) != carried {
                self.slide();
                continue;
            }

            match Frame::parse(&self.buf[..declared]) {
                Ok(frame) => {
                    self.buf.drain(..declared);
                    self.emitted += 1;
                    frames.push(frame);
                }
                Err(_) => {
                    // Structurally invalid despite checksum (e.g. phy id
                    // overrun); treat as corruption.
                    self.slide();
                }
            }
        }

        frames
    }

    fn slide(&mut self) {
        self.buf.drain(..1);
        self.slides += 1;
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|w| w == MAGIC)
}

/// Length of the longest proper magic prefix ending the buffer, so a magic
/// split across two reads is not thrown away.
fn partial_magic_tail(buf: &[u8]) -> usize {
    for keep in (1..MAGIC.len()).rev() {
        if buf.len() >= keep && buf[buf.len() - keep..] == MAGIC[..keep] {
            return keep;
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes() -> Vec<u8> {
        Frame::build("04012345678", 9, 0x03, &[0x00, 0x80])
    }

    #[test]
    fn whole_frame_in_one_feed() {
        let mut dec = StreamDecoder::new();
        let frames = dec.feed(&frame_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_id, 9);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn split_frame_across_feeds() {
        let bytes = frame_bytes();
        let mut dec = StreamDecoder::new();
        assert!(dec.feed(&bytes[..5]).is_empty());
        assert!(dec.feed(&bytes[5..10]).is_empty());
        let frames = dec.feed(&bytes[10..]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn coalesced_frames_in_one_feed() {
        let mut all = frame_bytes();
        all.extend_from_slice(&Frame::build("999", 10, 0x01, &[]));
        let mut dec = StreamDecoder::new();
        let frames = dec.feed(&all);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].phy_id, "999");
    }

    #[test]
    fn garbage_before_magic_is_discarded() {
        let mut all = vec![0x00, 0xFF, 0x13];
        all.extend_from_slice(&frame_bytes());
        let mut dec = StreamDecoder::new();
        assert_eq!(dec.feed(&all).len(), 1);
    }

    #[test]
    fn frame_followed_by_suffix_leaves_suffix_buffered() {
        let mut all = frame_bytes();
        all.extend_from_slice(&[0x44, 0x4E]); // partial next magic
        let mut dec = StreamDecoder::new();
        assert_eq!(dec.feed(&all).len(), 1);
        assert_eq!(dec.buffered(), 2);
    }

    #[test]
    fn corrupted_checksum_slides_and_recovers() {
        let mut corrupted = frame_bytes();
        let n = corrupted.len();
        corrupted[n - 1] ^= 0xFF;
        corrupted.extend_from_slice(&frame_bytes());
        let mut dec = StreamDecoder::new();
        let frames = dec.feed(&corrupted);
        assert_eq!(frames.len(), 1);
        assert!(dec.corruption_slides() > 0);
    }

    #[test]
    fn oversized_declared_length_is_treated_as_corruption() {
        let mut bytes = frame_bytes();
        bytes[3] = 0xFF;
        bytes[4] = 0xFF;
        bytes.extend_from_slice(&frame_bytes());
        let mut dec = StreamDecoder::new();
        let frames = dec.feed(&bytes);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn buffer_does_not_grow_on_pure_garbage() {
        let mut dec = StreamDecoder::new();
        for _ in 0..100 {
            dec.feed(&[0xAB; 64]);
        }
        assert!(dec.buffered() < MAGIC.len());
    }

    #[test]
    fn one_byte_feeds_eventually_emit() {
        let bytes = frame_bytes();
        let mut dec = StreamDecoder::new();
        let mut got = Vec::new();
        for b in &bytes {
            got.extend(dec.feed(std::slice::from_ref(b)));
        }
        assert_eq!(got.len(), 1);
    }
}
