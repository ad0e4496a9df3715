//! Feeder commands and replies.
//!
//! Every source of work for the feeder, whether a decoded bus frame or a
//! front-panel button, is turned into a [`FeederCommand`] before it reaches
//! the [`FeederStateMachine`](crate::feeder::FeederStateMachine). The state
//! machine answers each command with exactly one [`CommandReply`].
//!
//! # Command Flow
//!
//! 1. bytes are assembled into a [`ProtocolFrame`](crate::protocol::ProtocolFrame)
//! 2. [`decode_command`](crate::protocol::decode_command) parses the payload
//! 3. the state machine handles the command and builds a reply
//! 4. [`encode_reply`](crate::protocol::encode_reply) frames the reply
//!
//! Buttons skip steps 1, 2 and 4:
//!
//! ```rust
//! use gluon_feeder::commands::{ButtonEvent, FeederCommand, MoveAmount};
//! use gluon_feeder::Direction;
//!
//! match ButtonEvent::Backward.to_command(4) {
//!     FeederCommand::Move(req) => {
//!         assert_eq!(req.direction, Direction::Reverse);
//!         assert_eq!(req.amount, MoveAmount::Pitch(4));
//!     }
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

use heapless::Vec;

use crate::config::{SettingKey, SettingValue};
use crate::protocol::{Opcode, ResultCode, MAX_PAYLOAD};
use crate::traits::Direction;

// ============================================================================
// Commands
// ============================================================================

/// How far to move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveAmount {
    /// Distance in tenths of a millimetre.
    Tenths(u16),
    /// One tape pitch, in millimetres (2, 4, 8, 12 or 16).
    Pitch(u8),
}

/// A requested tape movement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveRequest {
    /// Forward advances the tape.
    pub direction: Direction,
    /// Distance.
    pub amount: MoveAmount,
}

impl MoveRequest {
    /// Forward by tenths of a millimetre.
    pub fn forward_tenths(tenths: u16) -> Self {
        Self {
            direction: Direction::Forward,
            amount: MoveAmount::Tenths(tenths),
        }
    }

    /// Reverse by tenths of a millimetre.
    pub fn backward_tenths(tenths: u16) -> Self {
        Self {
            direction: Direction::Reverse,
            amount: MoveAmount::Tenths(tenths),
        }
    }
}

/// Length of the feeder's unique id.
pub const UUID_LEN: usize = 12;

/// Unique id derived from the chip's factory MAC.
pub type FeederUuid = [u8; UUID_LEN];

/// Everything the feeder can be asked to do.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FeederCommand {
    /// Report the unique id.
    GetFeederId,
    /// Mark the feeder initialized if `uuid` is its own.
    InitializeFeeder {
        /// Id the host expects at this address.
        uuid: FeederUuid,
    },
    /// Report protocol and firmware version.
    GetVersion,
    /// Move the tape.
    Move(MoveRequest),
    /// Result of the last move.
    MoveStatus,
    /// Full status record.
    QueryStatus,
    /// Run the calibration procedure.
    StartCalibration,
    /// Clear the active fault after re-validation.
    ClearFault,
    /// Stop immediately.
    EmergencyStop,
    /// Request a reset challenge.
    ResetEstopArm,
    /// Answer the reset challenge.
    ResetEstopConfirm {
        /// Value issued by the arm step.
        challenge: u16,
    },
    /// Counter snapshot.
    GetPerformance,
    /// Zero the counters.
    ResetPerformance,
    /// Read one setting.
    GetSetting(SettingKey),
    /// Write one setting.
    SetSetting(SettingKey, SettingValue),
    /// Answer from the bus address if `uuid` matches.
    GetFeederAddress {
        /// Id being looked up.
        uuid: FeederUuid,
    },
    /// Make the feeder visible to the operator if `uuid` matches.
    IdentifyFeeder {
        /// Id being looked up.
        uuid: FeederUuid,
    },
    /// Store a new bus address if `uuid` matches.
    ProgramFeederFloor {
        /// Id being programmed.
        uuid: FeederUuid,
        /// New address, 1 to 254.
        address: u8,
    },
    /// Answer with the uuid unless already initialized.
    UninitializedFeedersRespond,
}

impl FeederCommand {
    /// Wire opcode this command is carried by.
    pub fn opcode(&self) -> Opcode {
        match self {
            FeederCommand::GetFeederId => Opcode::GetFeederId,
            FeederCommand::InitializeFeeder { .. } => Opcode::InitializeFeeder,
            FeederCommand::GetVersion => Opcode::GetVersion,
            FeederCommand::Move(MoveRequest {
                amount: MoveAmount::Pitch(_),
                ..
            }) => Opcode::MovePitch,
            FeederCommand::Move(MoveRequest {
                direction: Direction::Forward,
                ..
            }) => Opcode::MoveForward,
            FeederCommand::Move(_) => Opcode::MoveBackward,
            FeederCommand::MoveStatus => Opcode::MoveFeedStatus,
            FeederCommand::QueryStatus => Opcode::QueryStatus,
            FeederCommand::StartCalibration => Opcode::StartCalibration,
            FeederCommand::ClearFault => Opcode::ClearFault,
            FeederCommand::EmergencyStop => Opcode::EmergencyStop,
            FeederCommand::ResetEstopArm => Opcode::ResetEstopArm,
            FeederCommand::ResetEstopConfirm { .. } => Opcode::ResetEstopConfirm,
            FeederCommand::GetPerformance => Opcode::GetPerformance,
            FeederCommand::ResetPerformance => Opcode::ResetPerformance,
            FeederCommand::GetSetting(_) => Opcode::GetSetting,
            FeederCommand::SetSetting(..) => Opcode::SetSetting,
            FeederCommand::GetFeederAddress { .. } => Opcode::GetFeederAddress,
            FeederCommand::IdentifyFeeder { .. } => Opcode::IdentifyFeeder,
            FeederCommand::ProgramFeederFloor { .. } => Opcode::ProgramFeederFloor,
            FeederCommand::UninitializedFeedersRespond => Opcode::UninitializedFeedersRespond,
        }
    }

    /// True for commands that start motion.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            FeederCommand::Move(_) | FeederCommand::StartCalibration | FeederCommand::ClearFault
        )
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Reply body after the result byte.
pub type ReplyPayload = Vec<u8, { MAX_PAYLOAD - 1 }>;

/// Answer to one command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandReply {
    /// Outcome.
    pub result: ResultCode,
    /// Command-specific data.
    pub payload: ReplyPayload,
}

impl CommandReply {
    /// Plain result without data.
    pub fn result(result: ResultCode) -> Self {
        Self {
            result,
            payload: ReplyPayload::new(),
        }
    }

    /// Success without data.
    pub fn ok() -> Self {
        Self::result(ResultCode::Ok)
    }

    /// Success carrying `data`, truncated to what fits in a frame.
    pub fn ok_with(data: &[u8]) -> Self {
        let mut payload = ReplyPayload::new();
        let n = data.len().min(payload.capacity());
        // n is bounded by capacity
        let _ = payload.extend_from_slice(&data[..n]);
        Self {
            result: ResultCode::Ok,
            payload,
        }
    }

    /// `result` carrying `data`, truncated to what fits in a frame.
    pub fn with_data(result: ResultCode, data: &[u8]) -> Self {
        Self {
            result,
            ..Self::ok_with(data)
        }
    }

    /// True unless the result is ok or in-progress.
    pub fn is_error(&self) -> bool {
        !matches!(self.result, ResultCode::Ok | ResultCode::InProgress)
    }
}

// ============================================================================
// Buttons
// ============================================================================

/// Front-panel input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonEvent {
    /// Advance one pitch.
    Forward,
    /// Retract one pitch.
    Backward,
    /// Both buttons held: clear a fault.
    BothHeld,
}

impl ButtonEvent {
    /// Command this press stands for, given the configured default pitch.
    pub fn to_command(self, default_pitch_mm: u8) -> FeederCommand {
        match self {
            ButtonEvent::Forward => FeederCommand::Move(MoveRequest {
                direction: Direction::Forward,
                amount: MoveAmount::Pitch(default_pitch_mm),
            }),
            ButtonEvent::Backward => FeederCommand::Move(MoveRequest {
                direction: Direction::Reverse,
                amount: MoveAmount::Pitch(default_pitch_mm),
            }),
            ButtonEvent::BothHeld => FeederCommand::ClearFault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_follows_direction_and_amount() {
        assert_eq!(
            FeederCommand::Move(MoveRequest::forward_tenths(40)).opcode(),
            Opcode::MoveForward
        );
        assert_eq!(
            FeederCommand::Move(MoveRequest::backward_tenths(40)).opcode(),
            Opcode::MoveBackward
        );
        assert_eq!(
            ButtonEvent::Backward.to_command(8).opcode(),
            Opcode::MovePitch
        );
        assert_eq!(
            FeederCommand::ResetEstopConfirm { challenge: 1 }.opcode(),
            Opcode::ResetEstopConfirm
        );
    }

    #[test]
    fn both_buttons_clear_fault() {
        assert_eq!(ButtonEvent::BothHeld.to_command(4), FeederCommand::ClearFault);
    }

    #[test]
    fn reply_payload_truncates() {
        let reply = CommandReply::ok_with(&[7; 40]);
        assert_eq!(reply.payload.len(), MAX_PAYLOAD - 1);
        assert!(!reply.is_error());
        assert!(CommandReply::result(ResultCode::Busy).is_error());
        assert!(!CommandReply::result(ResultCode::InProgress).is_error());
    }

    #[test]
    fn enrollment_opcodes() {
        let uuid = [3; UUID_LEN];
        assert_eq!(
            FeederCommand::InitializeFeeder { uuid }.opcode(),
            Opcode::InitializeFeeder
        );
        assert_eq!(
            FeederCommand::ProgramFeederFloor { uuid, address: 9 }.opcode(),
            Opcode::ProgramFeederFloor
        );
        let reply = CommandReply::with_data(ResultCode::WrongFeederId, &uuid);
        assert!(reply.is_error());
        assert_eq!(reply.payload.as_slice(), &uuid);
    }
}
