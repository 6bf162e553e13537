//! Incremental OGG page parser.
//!
//! Feed raw bytes in with [`OggPacketParser::push`] and drain complete
//! logical packets with [`OggPacketParser::next_packet`]. Pages are
//! reassembled across the 255-byte lacing continuation rule, including
//! packets spanning page boundaries. CRC is not verified; the data comes
//! from a local ffmpeg pipe or an already-checksummed HTTP body.

use std::collections::VecDeque;

const CAPTURE: &[u8] = b"OggS";
const HEADER_LEN: usize = 27;

#[derive(Default)]
pub struct OggPacketParser {
    buf: Vec<u8>,
    partial: Vec<u8>,
    ready: VecDeque<Vec<u8>>,
}

impl OggPacketParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append stream bytes and parse any pages that are now complete.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.drain_pages();
    }

    /// Pop the next complete logical packet, if any.
    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        self.ready.pop_front()
    }

    fn drain_pages(&mut self) {
        loop {
            // Resync to the capture pattern if the buffer is misaligned.
            if self.buf.len() >= CAPTURE.len() && !self.buf.starts_with(CAPTURE) {
                match find_capture(&self.buf) {
                    Some(at) => {
                        self.buf.drain(..at);
                    }
                    None => {
                        let keep = self.buf.len().saturating_sub(CAPTURE.len() - 1);
                        self.buf.drain(..keep);
                        return;
                    }
                }
            }

            if self.buf.len() < HEADER_LEN {
                return;
            }

            let nsegs = self.buf[26] as usize;
            let lacing_end = HEADER_LEN + nsegs;
            if self.buf.len() < lacing_end {
                return;
            }

            let body_len: usize = self.buf[HEADER_LEN..lacing_end]
                .iter()
                .map(|&v| v as usize)
                .sum();
            let page_end = lacing_end + body_len;
            if self.buf.len() < page_end {
                return;
            }

            let mut offset = lacing_end;
            for i in 0..nsegs {
                let lace = self.buf[HEADER_LEN + i] as usize;
                self.partial.extend_from_slice(&self.buf[offset..offset + lace]);
                offset += lace;
                if lace < 255 {
                    self.ready.push_back(std::mem::take(&mut self.partial));
                }
            }

            self.buf.drain(..page_end);
        }
    }
}

fn find_capture(buf: &[u8]) -> Option<usize> {
    buf.windows(CAPTURE.len()).position(|w| w == CAPTURE)
}

/// True for the OpusHead / OpusTags metadata packets that precede audio
/// in an OGG Opus stream.
pub fn is_opus_meta(packet: &[u8]) -> bool {
    packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal page. `continued` sets the continuation flag and
    /// `open_ended` makes the final lacing value 255 (packet continues on
    /// the next page).
    fn page(segments: &[&[u8]], continued: bool, open_ended: bool) -> Vec<u8> {
        let mut lacing = Vec::new();
        let mut body = Vec::new();
        for (i, seg) in segments.iter().enumerate() {
            let last = i == segments.len() - 1;
            let mut remaining = seg.len();
            loop {
                let lace = remaining.min(255);
                lacing.push(lace as u8);
                remaining -= lace;
                if lace < 255 {
                    break;
                }
                if remaining == 0 {
                    if last && open_ended {
                        // leave the 255 unterminated
                    } else {
                        lacing.push(0);
                    }
                    break;
                }
            }
            body.extend_from_slice(seg);
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"OggS");
        out.push(0); // version
        out.push(if continued { 0x01 } else { 0x00 });
        out.extend_from_slice(&[0u8; 8]); // granule
        out.extend_from_slice(&[0u8; 4]); // serial
        out.extend_from_slice(&[0u8; 4]); // sequence
        out.extend_from_slice(&[0u8; 4]); // crc (unchecked)
        out.push(lacing.len() as u8);
        out.extend_from_slice(&lacing);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn single_page_two_packets() {
        let mut parser = OggPacketParser::new();
        parser.push(&page(&[b"hello", b"world!"], false, false));
        assert_eq!(parser.next_packet().unwrap(), b"hello");
        assert_eq!(parser.next_packet().unwrap(), b"world!");
        assert!(parser.next_packet().is_none());
    }

    #[test]
    fn partial_page_waits_for_more_bytes() {
        let mut parser = OggPacketParser::new();
        let full = page(&[b"abcdef"], false, false);
        parser.push(&full[..10]);
        assert!(parser.next_packet().is_none());
        parser.push(&full[10..]);
        assert_eq!(parser.next_packet().unwrap(), b"abcdef");
    }

    #[test]
    fn packet_spanning_pages() {
        let mut parser = OggPacketParser::new();
        let big = vec![0xABu8; 255];
        parser.push(&page(&[&big], false, true));
        assert!(parser.next_packet().is_none());
        parser.push(&page(&[b"tail"], true, false));
        let packet = parser.next_packet().unwrap();
        assert_eq!(packet.len(), 255 + 4);
        assert_eq!(&packet[255..], b"tail");
    }

    #[test]
    fn resyncs_past_junk() {
        let mut parser = OggPacketParser::new();
        let mut data = b"garbage".to_vec();
        data.extend_from_slice(&page(&[b"ok"], false, false));
        parser.push(&data);
        assert_eq!(parser.next_packet().unwrap(), b"ok");
    }

    #[test]
    fn opus_meta_detection() {
        assert!(is_opus_meta(b"OpusHead\x01"));
        assert!(is_opus_meta(b"OpusTags\x00"));
        assert!(!is_opus_meta(&[0xFC, 0xFF, 0xFE]));
    }
}
