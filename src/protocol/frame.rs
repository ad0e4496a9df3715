//! Photon frame layout and CRC-8.
//!
//! ```text
//! offset  0    1     2          3        4     5       6..
//!         to   from  packet_id  length   crc   opcode  payload
//! ```
//!
//! `length` counts the opcode plus payload, so it is never zero. The
//! checksum covers every byte except itself and is the Photon host's
//! CRC: a 16-bit register fed one byte at a time into its high half,
//! shifted left with 0x8380 folded in on carry, reported as the high
//! byte. It always catches an error in the last three covered bytes;
//! errors further back can cancel out, and the host retries on timeout.

use heapless::Vec;

use crate::error::FrameError;

/// Bytes before the payload.
pub const HEADER_LEN: usize = 6;
/// Largest payload.
pub const MAX_PAYLOAD: usize = 32;
/// Largest encoded frame.
pub const MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD;
/// Destination address that every feeder accepts.
pub const BROADCAST: u8 = 0xFF;
/// Address of a feeder that has not been given a slot. Frames sent to it
/// are treated as broadcast.
pub const UNASSIGNED: u8 = 0x00;

/// Frame payload buffer.
pub type Payload = Vec<u8, MAX_PAYLOAD>;
/// Encoded frame buffer.
pub type FrameBytes = Vec<u8, MAX_FRAME>;

/// Bitwise Photon CRC-8.
#[derive(Clone, Copy, Debug, Default)]
pub struct Crc8(u16);

impl Crc8 {
    /// Fresh CRC.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Feed bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            let mut crc = self.0 ^ (u16::from(b) << 8);
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ 0x8380
                } else {
                    crc << 1
                };
            }
            self.0 = crc;
        }
    }

    /// Final value.
    pub const fn finish(&self) -> u8 {
        (self.0 >> 8) as u8
    }
}

/// CRC-8 of a byte slice.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = Crc8::new();
    crc.update(bytes);
    crc.finish()
}

/// True for the two destination addresses every feeder accepts.
pub const fn is_broadcast_address(addr: u8) -> bool {
    addr == BROADCAST || addr == UNASSIGNED
}

/// A validated frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolFrame {
    /// Destination address.
    pub to: u8,
    /// Source address.
    pub from: u8,
    /// Host-chosen id, echoed in the reply.
    pub packet_id: u8,
    /// Command or reply opcode.
    pub opcode: u8,
    /// Up to [`MAX_PAYLOAD`] bytes.
    pub payload: Payload,
}

impl ProtocolFrame {
    /// Build a frame, rejecting oversize payloads.
    pub fn new(
        to: u8,
        from: u8,
        packet_id: u8,
        opcode: u8,
        payload: &[u8],
    ) -> Result<Self, FrameError> {
        Ok(Self {
            to,
            from,
            packet_id,
            opcode,
            payload: Vec::from_slice(payload)
                .map_err(|_| FrameError::PayloadTooLong(payload.len()))?,
        })
    }

    /// True if addressed to every feeder.
    pub fn is_broadcast(&self) -> bool {
        is_broadcast_address(self.to)
    }

    fn length_byte(&self) -> u8 {
        // payload is bounded by MAX_PAYLOAD, so this fits
        (1 + self.payload.len()) as u8
    }

    /// CRC over header and body.
    pub fn checksum(&self) -> u8 {
        let mut crc = Crc8::new();
        crc.update(&[self.to, self.from, self.packet_id, self.length_byte()]);
        crc.update(&[self.opcode]);
        crc.update(&self.payload);
        crc.finish()
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> FrameBytes {
        let mut out = FrameBytes::new();
        // capacity is HEADER_LEN + MAX_PAYLOAD, pushes cannot fail
        let _ = out.extend_from_slice(&[
            self.to,
            self.from,
            self.packet_id,
            self.length_byte(),
            self.checksum(),
            self.opcode,
        ]);
        let _ = out.extend_from_slice(&self.payload);
        out
    }

    /// Parse and validate wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let length = bytes[3];
        if length == 0 || length as usize > MAX_PAYLOAD + 1 {
            return Err(FrameError::BadLength(length));
        }
        let expected = HEADER_LEN - 1 + length as usize;
        if bytes.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let frame = Self::new(bytes[0], bytes[1], bytes[2], bytes[5], &bytes[HEADER_LEN..])?;
        let computed = frame.checksum();
        if computed != bytes[4] {
            return Err(FrameError::Checksum {
                expected: computed,
                actual: bytes[4],
            });
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_check_value() {
        // value the Photon host computes
        assert_eq!(crc8(b"123456789"), 0xBD);
        assert_eq!(crc8(&[]), 0x00);
    }

    #[test]
    fn crc8_carries_low_byte_between_bytes() {
        // the low byte of the register is not reset per byte
        assert_eq!(crc8(&[0x80]), 0x7D);
        assert_eq!(crc8(&[0x80, 0x00]), 0xD1);
        assert_eq!(crc8(&[0x07, 0x00]), 0x62);
    }

    #[test]
    fn crc8_incremental_matches_one_shot() {
        let mut crc = Crc8::new();
        crc.update(b"1234");
        crc.update(b"56789");
        assert_eq!(crc.finish(), 0xBD);
    }

    #[test]
    fn known_photon_frame_checksum() {
        // to 5, from 0xF0, id 0x2A, move-forward 4.0 mm
        let frame = ProtocolFrame::new(0x05, 0xF0, 0x2A, 0x04, &[0x28]).unwrap();
        assert_eq!(frame.encode()[4], 0x1F);
    }

    #[test]
    fn both_broadcast_addresses_are_recognised() {
        assert!(ProtocolFrame::new(BROADCAST, 0xF0, 1, 0x01, &[]).unwrap().is_broadcast());
        assert!(ProtocolFrame::new(UNASSIGNED, 0xF0, 1, 0x01, &[]).unwrap().is_broadcast());
        assert!(!ProtocolFrame::new(0x05, 0xF0, 1, 0x01, &[]).unwrap().is_broadcast());
    }

    #[test]
    fn encode_layout() {
        let frame = ProtocolFrame::new(0x05, 0xF0, 0x2A, 0x04, &[0x28]).unwrap();
        let bytes = frame.encode();
        assert_eq!(&bytes[..4], &[0x05, 0xF0, 0x2A, 0x02]);
        assert_eq!(bytes[5], 0x04);
        assert_eq!(bytes[6], 0x28);
        assert_eq!(bytes.len(), 7);
        assert_eq!(
            bytes[4],
            crc8(&[0x05, 0xF0, 0x2A, 0x02, 0x04, 0x28])
        );
    }

    #[test]
    fn decode_round_trip() {
        let frame = ProtocolFrame::new(0x00, 0xF0, 1, 0x10, &[]).unwrap();
        assert_eq!(ProtocolFrame::decode(&frame.encode()), Ok(frame));
    }

    #[test]
    fn decode_rejects_bad_length() {
        let mut bytes = ProtocolFrame::new(1, 2, 3, 4, &[5]).unwrap().encode();
        bytes[3] = 0;
        assert_eq!(ProtocolFrame::decode(&bytes), Err(FrameError::BadLength(0)));
        bytes[3] = 40;
        assert_eq!(ProtocolFrame::decode(&bytes), Err(FrameError::BadLength(40)));
        bytes[3] = 3;
        assert!(matches!(
            ProtocolFrame::decode(&bytes),
            Err(FrameError::LengthMismatch { expected: 8, actual: 7 })
        ));
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(ProtocolFrame::decode(&[1, 2, 3]), Err(FrameError::TooShort(3)));
    }

    #[test]
    fn oversize_payload_rejected() {
        assert_eq!(
            ProtocolFrame::new(1, 2, 3, 4, &[0; 33]),
            Err(FrameError::PayloadTooLong(33))
        );
        assert!(ProtocolFrame::new(1, 2, 3, 4, &[0; 32]).is_ok());
    }

    #[test]
    fn corrupted_crc_byte_is_detected() {
        let mut bytes = ProtocolFrame::new(1, 2, 3, 4, &[9, 9]).unwrap().encode();
        bytes[4] ^= 0x01;
        assert!(matches!(
            ProtocolFrame::decode(&bytes),
            Err(FrameError::Checksum { .. })
        ));
    }
}
