//! Byte-stream to frame assembly.
//!
//! Photon has no start-of-frame marker; frames are delimited by silence.
//! A gap longer than the inter-byte timeout throws away whatever partial
//! frame is buffered, so line noise can only ever corrupt one frame.

use crate::error::FrameError;
use crate::traits::RxByte;

use super::frame::{FrameBytes, ProtocolFrame, HEADER_LEN, MAX_PAYLOAD};

/// What a pushed byte produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assembly {
    /// Frame still incomplete.
    Pending,
    /// A complete frame that passed the checksum.
    Frame(ProtocolFrame),
    /// Buffered bytes were discarded.
    Rejected(FrameError),
}

/// Accumulates received bytes into frames.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: FrameBytes,
    last_byte_us: u64,
    timeout_us: u32,
}

impl FrameAssembler {
    /// Empty assembler.
    pub fn new(inter_byte_timeout_us: u32) -> Self {
        Self {
            buf: FrameBytes::new(),
            last_byte_us: 0,
            timeout_us: inter_byte_timeout_us,
        }
    }

    /// Change the inter-byte timeout.
    pub fn set_timeout(&mut self, us: u32) {
        self.timeout_us = us;
    }

    /// Number of bytes buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discard a partial frame whose last byte is older than the timeout.
    /// Returns true if something was discarded.
    pub fn expire(&mut self, now_us: u64) -> bool {
        if !self.buf.is_empty() && now_us.saturating_sub(self.last_byte_us) > self.timeout_us as u64
        {
            self.buf.clear();
            return true;
        }
        false
    }

    /// Feed one byte.
    pub fn push(&mut self, rx: RxByte) -> Assembly {
        let timed_out = self.expire(rx.at_us);
        self.last_byte_us = rx.at_us;
        // one byte can never complete a frame, so nothing is lost by
        // reporting the timeout now
        let _ = self.buf.push(rx.byte);
        if timed_out {
            return Assembly::Rejected(FrameError::InterByteTimeout);
        }

        if self.buf.len() == 4 {
            let length = self.buf[3];
            if length == 0 || length as usize > MAX_PAYLOAD + 1 {
                self.buf.clear();
                return Assembly::Rejected(FrameError::BadLength(length));
            }
        }

        if self.buf.len() >= HEADER_LEN {
            let total = HEADER_LEN - 1 + self.buf[3] as usize;
            if self.buf.len() == total {
                let result = ProtocolFrame::decode(&self.buf);
                self.buf.clear();
                return match result {
                    Ok(frame) => Assembly::Frame(frame),
                    Err(e) => Assembly::Rejected(e),
                };
            }
        }
        Assembly::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(asm: &mut FrameAssembler, bytes: &[u8], start_us: u64, gap_us: u64) -> Vec<Assembly> {
        bytes
            .iter()
            .enumerate()
            .map(|(i, &byte)| {
                asm.push(RxByte {
                    byte,
                    at_us: start_us + i as u64 * gap_us,
                })
            })
            .filter(|a| *a != Assembly::Pending)
            .collect()
    }

    #[test]
    fn assembles_back_to_back_frames() {
        let a = ProtocolFrame::new(1, 0xF0, 1, 0x10, &[]).unwrap();
        let b = ProtocolFrame::new(2, 0xF0, 2, 0x04, &[0x28]).unwrap();
        let mut bytes = a.encode().to_vec();
        bytes.extend_from_slice(&b.encode());

        let mut asm = FrameAssembler::new(2000);
        let out = feed(&mut asm, &bytes, 0, 100);
        assert_eq!(out, vec![Assembly::Frame(a), Assembly::Frame(b)]);
    }

    #[test]
    fn gap_discards_partial_frame() {
        let frame = ProtocolFrame::new(1, 0xF0, 1, 0x10, &[]).unwrap();
        let bytes = frame.encode();
        let mut asm = FrameAssembler::new(2000);

        // half a frame, then silence, then a full frame
        assert!(feed(&mut asm, &bytes[..3], 0, 100).is_empty());
        let out = feed(&mut asm, &bytes, 10_000, 100);
        assert_eq!(
            out,
            vec![
                Assembly::Rejected(FrameError::InterByteTimeout),
                Assembly::Frame(frame)
            ]
        );
    }

    #[test]
    fn expire_reports_idle_partial() {
        let mut asm = FrameAssembler::new(2000);
        feed(&mut asm, &[1, 2], 0, 100);
        assert!(!asm.expire(1000));
        assert!(asm.expire(5000));
        assert_eq!(asm.buffered(), 0);
        assert!(!asm.expire(9000));
    }

    #[test]
    fn zero_length_byte_resyncs() {
        let mut asm = FrameAssembler::new(2000);
        let out = feed(&mut asm, &[1, 2, 3, 0], 0, 10);
        assert_eq!(out, vec![Assembly::Rejected(FrameError::BadLength(0))]);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn corrupted_frame_rejected_by_checksum() {
        let mut bytes = ProtocolFrame::new(1, 0xF0, 1, 0x04, &[10])
            .unwrap()
            .encode();
        bytes[6] ^= 0x40;
        let mut asm = FrameAssembler::new(2000);
        let out = feed(&mut asm, &bytes, 0, 10);
        assert!(matches!(
            out.as_slice(),
            [Assembly::Rejected(FrameError::Checksum { .. })]
        ));
    }
}
