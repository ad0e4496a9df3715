//! Photon RS485 protocol stack.
//!
//! Layers, bottom up:
//!
//! | Module | Job |
//! |--------|-----|
//! | [`frame`] | wire layout, CRC-8 |
//! | [`assembler`] | bytes to frames, inter-byte timeout |
//! | [`link`] | address filter, reply scheduling, driver-enable |
//! | [`opcode`] | opcode and result-code tables |
//! | [`dispatch`] | payload codecs to and from commands |
//!
//! The stack never touches feeder state. It hands [`link::Received`]
//! frames to the [`FeederStateMachine`](crate::feeder::FeederStateMachine)
//! and sends back whatever reply the state machine produced.

pub mod assembler;
pub mod dispatch;
pub mod frame;
pub mod link;
pub mod opcode;

pub use assembler::{Assembly, FrameAssembler};
pub use dispatch::{decode_command, encode_command, encode_reply, error_reply, performance_payload};
pub use frame::{
    crc8, is_broadcast_address, Crc8, Payload, ProtocolFrame, BROADCAST, HEADER_LEN, MAX_FRAME,
    MAX_PAYLOAD, UNASSIGNED,
};
pub use link::{PhotonLink, Received};
pub use opcode::{Opcode, ResultCode, PROTOCOL_VERSION};
