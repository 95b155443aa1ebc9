//! Resyncing stream decoder for the BKV family.
//!
//! Same contract as the AP3000 decoder: always makes forward progress,
//! bounded buffer, slides one byte past anything that fails length, checksum
//! or structural validation.

use crate::frame::{checksum, Frame, MAGIC, MAX_FRAME_LEN, MIN_FRAME_LEN, TAIL};

/// Overhead outside `data_len` (magic, data_len, checksum, tail).
const ENVELOPE: usize = 8;

/// Accumulates raw bytes and yields verified [`Frame`]s.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    emitted: u64,
    slides: u64,
}

impl StreamDecoder {
    pub fn new() -> StreamDecoder {
        StreamDecoder::default()
    }

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
    /// available.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            match find_magic(&self.buf) {
                Some(0) => {}
                Some(at) => {
                    self.buf.drain(..at);
                }
                None => {
                    let keep = usize::from(self.buf.last() == Some(&MAGIC[0]));
                    let drop = self.buf.len() - keep;
                    self.buf.drain(..drop);
                    break;
                }
            }

            if self.buf.len() < MIN_FRAME_LEN {
                break;
            }

            let declared = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            let total = declared + ENVELOPE;
            if total < MIN_FRAME_LEN || total > MAX_FRAME_LEN {
                self.slide();
                continue;
            }
            if self.buf.len() < total {
                break;
            }

            let carried = u16::from_be_bytes([self.buf[total - 4], self.buf[total - 3]]);
            if checksum(&self.buf[..total - 4]) != carried || self.buf[total - 2..total] != TAIL {
                self.slide();
                continue;
            }

            match Frame::parse(&self.buf[..total]) {
                Ok(frame) => {
                    self.buf.drain(..total);
                    self.emitted += 1;
                    frames.push(frame);
                }
                Err(_) => {
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

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Direction;

    fn frame_bytes() -> Vec<u8> {
        Frame::build("82241218000382", 3, Direction::Uplink, 0x0000, &[])
    }

    #[test]
    fn whole_frame_in_one_feed() {
        let mut dec = StreamDecoder::new();
        let frames = dec.feed(&frame_bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cmd, 0x0000);
    }

    #[test]
    fn split_frame_across_feeds() {
        let bytes = frame_bytes();
        let mut dec = StreamDecoder::new();
        assert!(dec.feed(&bytes[..7]).is_empty());
        let frames = dec.feed(&bytes[7..]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn garbage_then_two_frames() {
        let mut all = vec![0x00, 0x11, 0x22];
        all.extend_from_slice(&frame_bytes());
        all.extend_from_slice(&Frame::build(
            "9",
            4,
            Direction::Uplink,
            0x0001,
            &[1, 2],
        ));
        let mut dec = StreamDecoder::new();
        let frames = dec.feed(&all);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].device_id, "9");
    }

    #[test]
    fn corrupted_frame_slides_to_next() {
        let mut corrupted = frame_bytes();
        corrupted[10] ^= 0xFF;
        corrupted.extend_from_slice(&frame_bytes());
        let mut dec = StreamDecoder::new();
        let frames = dec.feed(&corrupted);
        assert_eq!(frames.len(), 1);
        assert!(dec.corruption_slides() > 0);
    }

    #[test]
    fn suffix_stays_buffered() {
        let mut all = frame_bytes();
        all.push(MAGIC[0]);
        let mut dec = StreamDecoder::new();
        assert_eq!(dec.feed(&all).len(), 1);
        assert_eq!(dec.buffered(), 1);
    }

    #[test]
    fn buffer_bounded_under_garbage_flood() {
        let mut dec = StreamDecoder::new();
        for _ in 0..64 {
            dec.feed(&[0x55; 128]);
        }
        assert!(dec.buffered() < MIN_FRAME_LEN);
    }
}
