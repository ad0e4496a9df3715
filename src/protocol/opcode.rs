//! Opcode and result-code tables (protocol version 1).
//!
//! | Opcode | Command |
//! |--------|---------|
//! | 0x01 | get-feeder-id |
//! | 0x02 | initialize-feeder (uuid) |
//! | 0x03 | get-version |
//! | 0x04 | move-forward (tenths of mm) |
//! | 0x05 | move-backward (tenths of mm) |
//! | 0x06 | move-status |
//! | 0x07 | move-pitch |
//! | 0x10 | query-status |
//! | 0x11 | start-calibration |
//! | 0x12 | clear-fault |
//! | 0x13 | emergency-stop |
//! | 0x14 | reset-estop arm |
//! | 0x15 | reset-estop confirm |
//! | 0x16 | get-performance |
//! | 0x17 | reset-performance |
//! | 0x18 | get-setting |
//! | 0x19 | set-setting |
//! | 0xC0 | get-feeder-address (uuid, usually broadcast) |
//! | 0xC1 | identify-feeder (uuid, usually broadcast) |
//! | 0xC2 | program-feeder-floor (uuid, address) |
//! | 0xC3 | uninitialized-feeders-respond (broadcast) |
//! | 0xFE | error reply (feeder to host only) |

/// Version byte reported by get-version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Command opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Report the 12-byte unique id.
    GetFeederId = 0x01,
    /// Confirm the host knows this feeder's uuid.
    InitializeFeeder = 0x02,
    /// Report protocol and firmware version.
    GetVersion = 0x03,
    /// Advance by a distance.
    MoveForward = 0x04,
    /// Retract by a distance.
    MoveBackward = 0x05,
    /// Poll the last move.
    MoveFeedStatus = 0x06,
    /// Move one tape pitch.
    MovePitch = 0x07,
    /// Full status.
    QueryStatus = 0x10,
    /// Run calibration.
    StartCalibration = 0x11,
    /// Clear a fault after re-validation.
    ClearFault = 0x12,
    /// Emergency stop.
    EmergencyStop = 0x13,
    /// First half of the e-stop reset handshake.
    ResetEstopArm = 0x14,
    /// Second half of the e-stop reset handshake.
    ResetEstopConfirm = 0x15,
    /// Counter snapshot.
    GetPerformance = 0x16,
    /// Zero the counters.
    ResetPerformance = 0x17,
    /// Read a setting.
    GetSetting = 0x18,
    /// Write a setting.
    SetSetting = 0x19,
    /// The feeder with this uuid answers from its address.
    GetFeederAddress = 0xC0,
    /// The feeder with this uuid makes itself visible.
    IdentifyFeeder = 0xC1,
    /// The feeder with this uuid stores a new bus address.
    ProgramFeederFloor = 0xC2,
    /// Every feeder not yet initialized answers with its uuid.
    UninitializedFeedersRespond = 0xC3,
    /// Error reply.
    Error = 0xFE,
}

impl Opcode {
    /// Parse a wire byte.
    pub fn from_u8(b: u8) -> Option<Self> {
        use Opcode::*;
        Some(match b {
            0x01 => GetFeederId,
            0x02 => InitializeFeeder,
            0x03 => GetVersion,
            0x04 => MoveForward,
            0x05 => MoveBackward,
            0x06 => MoveFeedStatus,
            0x07 => MovePitch,
            0x10 => QueryStatus,
            0x11 => StartCalibration,
            0x12 => ClearFault,
            0x13 => EmergencyStop,
            0x14 => ResetEstopArm,
            0x15 => ResetEstopConfirm,
            0x16 => GetPerformance,
            0x17 => ResetPerformance,
            0x18 => GetSetting,
            0x19 => SetSetting,
            0xC0 => GetFeederAddress,
            0xC1 => IdentifyFeeder,
            0xC2 => ProgramFeederFloor,
            0xC3 => UninitializedFeedersRespond,
            0xFE => Error,
            _ => return None,
        })
    }
}

/// First payload byte of every reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ResultCode {
    /// Success.
    #[default]
    Ok = 0x00,
    /// The uuid in the request is not this feeder's.
    WrongFeederId = 0x01,
    /// Move ended without reaching its target.
    CouldntReach = 0x02,
    /// Initialization required before motion.
    UninitializedFeeder = 0x03,
    /// Accepted; poll for the outcome.
    InProgress = 0x04,
    /// Operation failed.
    Fail = 0x05,
    /// Another operation is running.
    Busy = 0x06,
    /// Refused (limit, failed re-validation, bad handshake).
    Rejected = 0x07,
    /// Refused while in `FAULT`.
    Faulted = 0x08,
    /// Refused while in `ESTOP`.
    EStopped = 0x09,
    /// Payload shape wrong for the opcode.
    Malformed = 0x0A,
    /// Opcode not implemented.
    Unsupported = 0x0B,
}

impl ResultCode {
    /// Parse a wire byte.
    pub fn from_u8(b: u8) -> Option<Self> {
        [
            Self::Ok,
            Self::WrongFeederId,
            Self::CouldntReach,
            Self::UninitializedFeeder,
            Self::InProgress,
            Self::Fail,
            Self::Busy,
            Self::Rejected,
            Self::Faulted,
            Self::EStopped,
            Self::Malformed,
            Self::Unsupported,
        ]
        .into_iter()
        .find(|r| *r as u8 == b)
    }
}
