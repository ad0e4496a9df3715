//! Fault taxonomy and error types.
//!
//! [`FaultCode`] is the canonical enumeration of everything that can go
//! wrong on a feeder. It is what the status replies carry on the wire and
//! what the performance monitor counts per kind. The `thiserror` types
//! below are the `Result` errors returned by fallible operations
//! (frame decoding, configuration, calibration, dispatch).
//!
//! # Severity
//!
//! | Code | Severity |
//! |------|----------|
//! | `COMM_*` | [`Severity::Local`]: dropped or answered, never changes state |
//! | `MOTION_STALL`, `MOTION_TIMEOUT`, `CALIBRATION_*` | [`Severity::Fault`] |
//! | `MOTION_OVERCURRENT`, `MOTION_OVERTEMP` | fault, or e-stop past the critical limit |
//! | `SAFETY_INTERLOCK`, `EMERGENCY_STOP` | [`Severity::Estop`] |

use thiserror::Error;

use crate::config::SettingKey;

/// Every fault a feeder can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[repr(u8)]
pub enum FaultCode {
    /// Corrupted frame, silently dropped.
    CommChecksum = 0x01,
    /// Valid frame with an opcode this firmware does not implement.
    CommUnsupported = 0x02,
    /// Drive output pinned with no encoder motion.
    MotionStall = 0x10,
    /// Motor current above the configured limit.
    MotionOvercurrent = 0x11,
    /// Driver temperature above the configured limit.
    MotionOvertemp = 0x12,
    /// Move did not finish before its deadline.
    MotionTimeout = 0x13,
    /// Calibration seek ran out of travel without hitting a stop.
    CalibrationNoStopFound = 0x20,
    /// Calibration produced a profile that failed validation.
    CalibrationInvalidProfile = 0x21,
    /// Drive-enable sense line disagrees with the commanded state.
    SafetyInterlock = 0x30,
    /// Explicit emergency stop.
    EmergencyStop = 0x31,
}

/// How a fault propagates through the feeder lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Recovered locally; never surfaced as feeder state.
    Local,
    /// Enters `FAULT`, cleared by clear-fault after re-validation.
    Fault,
    /// Enters `ESTOP`, cleared only by the acknowledged reset sequence.
    Estop,
}

impl FaultCode {
    /// Number of fault kinds.
    pub const COUNT: usize = 10;

    /// All fault kinds in counter order.
    pub const ALL: [FaultCode; Self::COUNT] = [
        FaultCode::CommChecksum,
        FaultCode::CommUnsupported,
        FaultCode::MotionStall,
        FaultCode::MotionOvercurrent,
        FaultCode::MotionOvertemp,
        FaultCode::MotionTimeout,
        FaultCode::CalibrationNoStopFound,
        FaultCode::CalibrationInvalidProfile,
        FaultCode::SafetyInterlock,
        FaultCode::EmergencyStop,
    ];

    /// Dense index into per-kind counter arrays.
    pub const fn index(self) -> usize {
        match self {
            FaultCode::CommChecksum => 0,
            FaultCode::CommUnsupported => 1,
            FaultCode::MotionStall => 2,
            FaultCode::MotionOvercurrent => 3,
            FaultCode::MotionOvertemp => 4,
            FaultCode::MotionTimeout => 5,
            FaultCode::CalibrationNoStopFound => 6,
            FaultCode::CalibrationInvalidProfile => 7,
            FaultCode::SafetyInterlock => 8,
            FaultCode::EmergencyStop => 9,
        }
    }

    /// Parse a wire code.
    pub fn from_u8(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| *f as u8 == code)
    }

    /// Baseline severity. Electrical faults escalate to [`Severity::Estop`]
    /// past their critical limit; that decision is made where the reading
    /// is available.
    pub const fn severity(self) -> Severity {
        match self {
            FaultCode::CommChecksum | FaultCode::CommUnsupported => Severity::Local,
            FaultCode::SafetyInterlock | FaultCode::EmergencyStop => Severity::Estop,
            _ => Severity::Fault,
        }
    }

    /// True for faults that a short out-and-back probe move can re-check.
    pub const fn is_mechanical(self) -> bool {
        matches!(self, FaultCode::MotionStall | FaultCode::MotionTimeout)
    }

    /// True for current and temperature faults.
    pub const fn is_electrical(self) -> bool {
        matches!(
            self,
            FaultCode::MotionOvercurrent | FaultCode::MotionOvertemp
        )
    }

    /// Upper-case name as used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            FaultCode::CommChecksum => "COMM_CHECKSUM",
            FaultCode::CommUnsupported => "COMM_UNSUPPORTED",
            FaultCode::MotionStall => "MOTION_STALL",
            FaultCode::MotionOvercurrent => "MOTION_OVERCURRENT",
            FaultCode::MotionOvertemp => "MOTION_OVERTEMP",
            FaultCode::MotionTimeout => "MOTION_TIMEOUT",
            FaultCode::CalibrationNoStopFound => "CALIBRATION_NO_STOP_FOUND",
            FaultCode::CalibrationInvalidProfile => "CALIBRATION_INVALID_PROFILE",
            FaultCode::SafetyInterlock => "SAFETY_INTERLOCK",
            FaultCode::EmergencyStop => "EMERGENCY_STOP",
        }
    }
}

impl core::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame decoding failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than a header.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    /// Length byte is zero or larger than the payload limit allows.
    #[error("invalid length byte {0}")]
    BadLength(u8),
    /// Byte count disagrees with the length byte.
    #[error("length mismatch: header says {expected}, got {actual}")]
    LengthMismatch {
        /// Total length implied by the header.
        expected: usize,
        /// Bytes actually supplied.
        actual: usize,
    },
    /// Payload larger than [`crate::protocol::MAX_PAYLOAD`].
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLong(usize),
    /// CRC mismatch.
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum {
        /// CRC computed over the received bytes.
        expected: u8,
        /// CRC carried in the header.
        actual: u8,
    },
    /// Inter-byte gap exceeded; partial frame discarded.
    #[error("inter-byte timeout")]
    InterByteTimeout,
}

/// Configuration load and update failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Setting id not in the table.
    #[error("unknown setting id {0:#04x}")]
    UnknownKey(u8),
    /// Value type does not match the setting.
    #[error("setting {0:?} has the wrong type")]
    WrongType(SettingKey),
    /// Value outside the allowed range.
    #[error("setting {0:?} out of range")]
    OutOfRange(SettingKey),
    /// Two settings contradict each other.
    #[error("inconsistent settings: {0}")]
    Inconsistent(&'static str),
}

/// Calibration failures. Each maps to a [`FaultCode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CalibrationError {
    /// Seek reached the travel bound without a stall.
    #[error("no mechanical stop found within travel limit")]
    NoStopFound,
    /// Derived constants failed validation.
    #[error("calibration produced an invalid profile: {0}")]
    InvalidProfile(&'static str),
    /// A fault other than the expected stall interrupted a guided move.
    #[error("calibration aborted by {0}")]
    Aborted(FaultCode),
}

impl CalibrationError {
    /// Fault code this failure is reported as.
    pub const fn fault_code(&self) -> FaultCode {
        match self {
            CalibrationError::NoStopFound => FaultCode::CalibrationNoStopFound,
            CalibrationError::InvalidProfile(_) => FaultCode::CalibrationInvalidProfile,
            CalibrationError::Aborted(code) => *code,
        }
    }
}

/// Reasons a well-formed frame could not be turned into a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Opcode not in the v1 table.
    #[error("unsupported opcode {0:#04x}")]
    Unsupported(u8),
    /// Known opcode with a payload of the wrong shape.
    #[error("malformed payload for opcode {0:#04x}")]
    Malformed(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_code_round_trips_through_wire_byte() {
        for code in FaultCode::ALL {
            assert_eq!(FaultCode::from_u8(code as u8), Some(code));
        }
        assert_eq!(FaultCode::from_u8(0x00), None);
        assert_eq!(FaultCode::from_u8(0xFF), None);
    }

    #[test]
    fn fault_index_is_dense() {
        for (i, code) in FaultCode::ALL.iter().enumerate() {
            assert_eq!(code.index(), i);
        }
    }

    #[test]
    fn severity_classes() {
        assert_eq!(FaultCode::CommChecksum.severity(), Severity::Local);
        assert_eq!(FaultCode::MotionStall.severity(), Severity::Fault);
        assert_eq!(FaultCode::SafetyInterlock.severity(), Severity::Estop);
        assert!(FaultCode::MotionTimeout.is_mechanical());
        assert!(FaultCode::MotionOvertemp.is_electrical());
        assert!(!FaultCode::CalibrationNoStopFound.is_mechanical());
    }

    #[test]
    fn calibration_error_maps_to_fault() {
        assert_eq!(
            CalibrationError::NoStopFound.fault_code(),
            FaultCode::CalibrationNoStopFound
        );
        assert_eq!(
            CalibrationError::Aborted(FaultCode::MotionOvercurrent).fault_code(),
            FaultCode::MotionOvercurrent
        );
    }

    #[test]
    fn display_uses_upper_snake_names() {
        assert_eq!(format!("{}", FaultCode::MotionStall), "MOTION_STALL");
        assert_eq!(
            format!("{}", FrameError::BadLength(0)),
            "invalid length byte 0"
        );
    }
}
