//! Statically typed feeder configuration.
//!
//! Every tunable lives in [`FeederConfig`], populated once at boot from an
//! external [`ConfigService`] and validated as a whole. Individual values
//! travel over the bus as a [`SettingKey`] plus a [`SettingValue`]; an
//! update is applied to a copy, validated, and only then committed, so a
//! rejected write never leaves the configuration half-changed.
//!
//! # Example
//!
//! ```rust
//! use gluon_feeder::config::{BusConfig, ControlConfig, FeederConfig};
//!
//! // Use defaults
//! let config = FeederConfig::default();
//! assert!(config.validate().is_ok());
//!
//! // Or customize
//! let config = FeederConfig::default()
//!     .with_bus(BusConfig::default().with_address(5))
//!     .with_control(ControlConfig::default().with_gains(0.01, 0.02, 0.00001));
//! assert_eq!(config.bus.address, 5);
//! ```

use tracing::warn;

use crate::commands::{FeederUuid, UUID_LEN};
use crate::error::ConfigError;
use crate::motor::PwmMapping;
use crate::traits::services::ConfigService;

// ============================================================================
// Main Config
// ============================================================================

/// Complete feeder configuration
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeederConfig {
    /// Bus addressing and timing
    pub bus: BusConfig,
    /// Control loop gains, limits and fault thresholds
    pub control: ControlConfig,
    /// Move planning limits
    pub motion: MotionConfig,
    /// Calibration procedure parameters
    pub calibration: CalibrationConfig,
    /// Drive bridge and encoder wiring
    pub drive: DriveConfig,
    /// Peel motor timing
    pub peel: PeelConfig,
    /// Device identification
    pub device: DeviceConfig,
}

impl FeederConfig {
    /// Set bus configuration
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Set control configuration
    pub fn with_control(mut self, control: ControlConfig) -> Self {
        self.control = control;
        self
    }

    /// Set motion configuration
    pub fn with_motion(mut self, motion: MotionConfig) -> Self {
        self.motion = motion;
        self
    }

    /// Set calibration configuration
    pub fn with_calibration(mut self, calibration: CalibrationConfig) -> Self {
        self.calibration = calibration;
        self
    }

    /// Set drive configuration
    pub fn with_drive(mut self, drive: DriveConfig) -> Self {
        self.drive = drive;
        self
    }

    /// Set peel configuration
    pub fn with_peel(mut self, peel: PeelConfig) -> Self {
        self.peel = peel;
        self
    }

    /// Set device configuration
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Build a configuration from the external settings service.
    ///
    /// Keys the service does not know keep their defaults. Any value of the
    /// wrong type or out of range rejects the whole load.
    pub fn load<S: ConfigService + ?Sized>(service: &S) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for &key in SettingKey::ALL {
            if let Some(value) = service.read(key) {
                config.store(key, value).inspect_err(|e| {
                    warn!(setting = key.name(), error = %e, "rejected setting at load");
                })?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Cross-field consistency checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.control;
        if c.min_duty > c.max_duty {
            return Err(ConfigError::Inconsistent("min_duty exceeds max_duty"));
        }
        if c.hold_duty > c.max_duty {
            return Err(ConfigError::Inconsistent("hold_duty exceeds max_duty"));
        }
        if c.deadband_ticks > c.tolerance_ticks {
            return Err(ConfigError::Inconsistent("deadband wider than tolerance"));
        }
        if c.critical_current_ma < c.overcurrent_ma {
            return Err(ConfigError::Inconsistent(
                "critical current below overcurrent limit",
            ));
        }
        if c.critical_temp_c < c.overtemp_c {
            return Err(ConfigError::Inconsistent(
                "critical temperature below overtemp limit",
            ));
        }
        if u64::from(c.stall_timeout_ms) * 1000 < u64::from(c.period_us) {
            return Err(ConfigError::Inconsistent(
                "stall timeout shorter than one control period",
            ));
        }
        if self.calibration.seek_duty > c.max_duty {
            return Err(ConfigError::Inconsistent("seek duty exceeds max_duty"));
        }
        Ok(())
    }

    /// Read a single setting.
    pub fn get(&self, key: SettingKey) -> SettingValue {
        use SettingKey as K;
        use SettingValue::{Bool, Float, Int};
        let (b, c, m, cal) = (&self.bus, &self.control, &self.motion, &self.calibration);
        match key {
            K::BusAddress => Int(b.address as i32),
            K::GuardDelayUs => Int(b.guard_delay_us as i32),
            K::BroadcastSlotUs => Int(b.broadcast_slot_us as i32),
            K::InterByteTimeoutUs => Int(b.inter_byte_timeout_us as i32),
            K::ControlPeriodUs => Int(c.period_us as i32),
            K::Kp => Float(c.kp),
            K::Ki => Float(c.ki),
            K::Kd => Float(c.kd),
            K::DerivativeAlpha => Float(c.derivative_alpha),
            K::MaxDuty => Float(c.max_duty),
            K::MinDuty => Float(c.min_duty),
            K::HoldDuty => Float(c.hold_duty),
            K::DeadbandTicks => Int(c.deadband_ticks as i32),
            K::ToleranceTicks => Int(c.tolerance_ticks as i32),
            K::SettlePeriods => Int(c.settle_periods as i32),
            K::StallTimeoutMs => Int(c.stall_timeout_ms as i32),
            K::StallWindowTicks => Int(c.stall_window_ticks as i32),
            K::GlitchTicks => Int(c.glitch_ticks as i32),
            K::OvercurrentMa => Int(c.overcurrent_ma as i32),
            K::CriticalCurrentMa => Int(c.critical_current_ma as i32),
            K::OvertempC => Int(c.overtemp_c),
            K::CriticalTempC => Int(c.critical_temp_c),
            K::MoveTimeoutMs => Int(c.move_timeout_ms as i32),
            K::MaxMoveTenths => Int(m.max_move_tenths as i32),
            K::DefaultPitchMm => Int(m.default_pitch_mm as i32),
            K::ApproachTicks => Int(m.approach_ticks as i32),
            K::ProbeTicks => Int(m.probe_ticks as i32),
            K::VelocityCapTicks => Int(m.velocity_cap_ticks as i32),
            K::EstopResetWindowMs => Int(m.estop_reset_window_ms as i32),
            K::SeekDuty => Float(cal.seek_duty),
            K::MaxTravelTicks => Int(cal.max_travel_ticks as i32),
            K::ReferenceTravelMm => Float(cal.reference_travel_mm),
            K::BacklashProbeTicks => Int(cal.backlash_probe_ticks as i32),
            K::CalibrationTimeoutMs => Int(cal.timeout_ms as i32),
            K::AutoBrake => Bool(self.drive.auto_brake),
            K::DriveMinPercent => Int(self.drive.min_percent as i32),
            K::DriveInvert => Bool(self.drive.invert),
            K::EncoderInvert => Bool(self.drive.encoder_invert),
            K::PeelEnabled => Bool(self.peel.enabled),
            K::PeelDuty => Float(self.peel.duty),
            K::PeelRunMs => Int(self.peel.run_ms as i32),
            K::PeelOverrunMs => Int(self.peel.overrun_ms as i32),
            K::PeelInvert => Bool(self.peel.invert),
            K::PeelMinPercent => Int(self.peel.min_percent as i32),
            K::RequireInit => Bool(self.device.require_init),
        }
    }

    /// Update a single setting, validating the result as a whole.
    ///
    /// On error the configuration is unchanged.
    pub fn set(&mut self, key: SettingKey, value: SettingValue) -> Result<(), ConfigError> {
        let mut candidate = self.clone();
        candidate.store(key, value)?;
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    fn store(&mut self, key: SettingKey, value: SettingValue) -> Result<(), ConfigError> {
        use SettingKey as K;
        let (b, c, m, cal) = (
            &mut self.bus,
            &mut self.control,
            &mut self.motion,
            &mut self.calibration,
        );
        match key {
            K::BusAddress => b.address = int(key, value, 1, 254)? as u8,
            K::GuardDelayUs => b.guard_delay_us = int(key, value, 0, 100_000)? as u32,
            K::BroadcastSlotUs => b.broadcast_slot_us = int(key, value, 0, 100_000)? as u32,
            K::InterByteTimeoutUs => {
                b.inter_byte_timeout_us = int(key, value, 100, 1_000_000)? as u32
            }
            K::ControlPeriodUs => c.period_us = int(key, value, 100, 20_000)? as u32,
            K::Kp => c.kp = float(key, value, 0.0, 10.0)?,
            K::Ki => c.ki = float(key, value, 0.0, 100.0)?,
            K::Kd => c.kd = float(key, value, 0.0, 1.0)?,
            K::DerivativeAlpha => c.derivative_alpha = float(key, value, 0.0, 1.0)?,
            K::MaxDuty => c.max_duty = float(key, value, 0.05, 1.0)?,
            K::MinDuty => c.min_duty = float(key, value, 0.0, 1.0)?,
            K::HoldDuty => c.hold_duty = float(key, value, 0.0, 1.0)?,
            K::DeadbandTicks => c.deadband_ticks = int(key, value, 0, 1000)? as u32,
            K::ToleranceTicks => c.tolerance_ticks = int(key, value, 1, 1000)? as u32,
            K::SettlePeriods => c.settle_periods = int(key, value, 1, 1000)? as u16,
            K::StallTimeoutMs => c.stall_timeout_ms = int(key, value, 1, 60_000)? as u32,
            K::StallWindowTicks => c.stall_window_ticks = int(key, value, 0, 1000)? as u32,
            K::GlitchTicks => c.glitch_ticks = int(key, value, 1, 10_000)? as u32,
            K::OvercurrentMa => c.overcurrent_ma = int(key, value, 1, 20_000)? as u32,
            K::CriticalCurrentMa => c.critical_current_ma = int(key, value, 1, 20_000)? as u32,
            K::OvertempC => c.overtemp_c = int(key, value, 0, 200)?,
            K::CriticalTempC => c.critical_temp_c = int(key, value, 0, 200)?,
            K::MoveTimeoutMs => c.move_timeout_ms = int(key, value, 10, 600_000)? as u32,
            K::MaxMoveTenths => m.max_move_tenths = int(key, value, 1, 65_535)? as u16,
            K::DefaultPitchMm => {
                let pitch = int(key, value, 1, 255)? as u8;
                if !crate::calibration::PITCHES_MM.contains(&pitch) {
                    return Err(ConfigError::OutOfRange(key));
                }
                m.default_pitch_mm = pitch;
            }
            K::ApproachTicks => m.approach_ticks = int(key, value, 0, 10_000)? as u32,
            K::ProbeTicks => m.probe_ticks = int(key, value, 1, 10_000)? as u32,
            K::VelocityCapTicks => m.velocity_cap_ticks = int(key, value, 0, 1000)? as u32,
            K::EstopResetWindowMs => {
                m.estop_reset_window_ms = int(key, value, 100, 600_000)? as u32
            }
            K::SeekDuty => cal.seek_duty = float(key, value, 0.01, 1.0)?,
            K::MaxTravelTicks => cal.max_travel_ticks = int(key, value, 10, 1_000_000)? as u32,
            K::ReferenceTravelMm => cal.reference_travel_mm = float(key, value, 0.1, 1000.0)?,
            K::BacklashProbeTicks => {
                cal.backlash_probe_ticks = int(key, value, 10, 100_000)? as u32
            }
            K::CalibrationTimeoutMs => cal.timeout_ms = int(key, value, 100, 600_000)? as u32,
            K::AutoBrake => self.drive.auto_brake = flag(key, value)?,
            K::DriveMinPercent => self.drive.min_percent = int(key, value, 0, 100)? as u8,
            K::DriveInvert => self.drive.invert = flag(key, value)?,
            K::EncoderInvert => self.drive.encoder_invert = flag(key, value)?,
            K::PeelEnabled => self.peel.enabled = flag(key, value)?,
            K::PeelDuty => self.peel.duty = float(key, value, 0.0, 1.0)?,
            K::PeelRunMs => self.peel.run_ms = int(key, value, 0, 60_000)? as u32,
            K::PeelOverrunMs => self.peel.overrun_ms = int(key, value, 0, 60_000)? as u32,
            K::PeelInvert => self.peel.invert = flag(key, value)?,
            K::PeelMinPercent => self.peel.min_percent = int(key, value, 0, 100)? as u8,
            K::RequireInit => self.device.require_init = flag(key, value)?,
        }
        Ok(())
    }
}

fn int(key: SettingKey, value: SettingValue, min: i32, max: i32) -> Result<i32, ConfigError> {
    match value {
        SettingValue::Int(v) if (min..=max).contains(&v) => Ok(v),
        SettingValue::Int(_) => Err(ConfigError::OutOfRange(key)),
        _ => Err(ConfigError::WrongType(key)),
    }
}

fn flag(key: SettingKey, value: SettingValue) -> Result<bool, ConfigError> {
    match value {
        SettingValue::Bool(v) => Ok(v),
        _ => Err(ConfigError::WrongType(key)),
    }
}

fn float(key: SettingKey, value: SettingValue, min: f32, max: f32) -> Result<f32, ConfigError> {
    match value {
        // NaN fails the range check
        SettingValue::Float(v) if v >= min && v <= max => Ok(v),
        SettingValue::Float(_) => Err(ConfigError::OutOfRange(key)),
        _ => Err(ConfigError::WrongType(key)),
    }
}

// ============================================================================
// Setting keys and values
// ============================================================================

/// A typed setting value.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SettingValue {
    /// Signed integer.
    Int(i32),
    /// Floating point.
    Float(f32),
    /// Boolean flag.
    Bool(bool),
}

impl SettingValue {
    /// Wire type tag.
    pub const fn tag(&self) -> u8 {
        match self {
            SettingValue::Int(_) => 0,
            SettingValue::Float(_) => 1,
            SettingValue::Bool(_) => 2,
        }
    }

    /// Encode as a type tag plus four big-endian bytes.
    pub fn to_wire(&self) -> (u8, [u8; 4]) {
        let bytes = match *self {
            SettingValue::Int(v) => v.to_be_bytes(),
            SettingValue::Float(v) => v.to_bits().to_be_bytes(),
            SettingValue::Bool(v) => (v as u32).to_be_bytes(),
        };
        (self.tag(), bytes)
    }

    /// Decode a type tag plus four big-endian bytes.
    pub fn from_wire(tag: u8, bytes: [u8; 4]) -> Option<Self> {
        match tag {
            0 => Some(SettingValue::Int(i32::from_be_bytes(bytes))),
            1 => Some(SettingValue::Float(f32::from_bits(u32::from_be_bytes(bytes)))),
            2 => match u32::from_be_bytes(bytes) {
                0 => Some(SettingValue::Bool(false)),
                1 => Some(SettingValue::Bool(true)),
                _ => None,
            },
            _ => None,
        }
    }
}

macro_rules! setting_keys {
    ($( $(#[$doc:meta])* $variant:ident = $id:literal, $name:literal; )*) => {
        /// Stable identifier for every configurable value.
        ///
        /// The numeric id is the wire key used by get/set-setting; the
        /// dotted name is what a key-value store would use.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[repr(u8)]
        pub enum SettingKey {
            $( $(#[$doc])* $variant = $id, )*
        }

        impl SettingKey {
            /// Every key, in id order.
            pub const ALL: &'static [SettingKey] = &[$(SettingKey::$variant),*];

            /// Dotted setting name.
            pub const fn name(self) -> &'static str {
                match self {
                    $( SettingKey::$variant => $name, )*
                }
            }

            /// Parse a wire id.
            pub fn from_u8(id: u8) -> Option<Self> {
                match id {
                    $( $id => Some(SettingKey::$variant), )*
                    _ => None,
                }
            }

            /// Look up a key by dotted name.
            pub fn from_name(name: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|k| k.name() == name)
            }
        }
    };
}

setting_keys! {
    /// This feeder's bus address.
    BusAddress = 0x01, "bus.address";
    /// Silence before a unicast reply.
    GuardDelayUs = 0x02, "bus.guard_delay_us";
    /// Per-address slot width for broadcast replies.
    BroadcastSlotUs = 0x03, "bus.broadcast_slot_us";
    /// Gap that discards a partial frame.
    InterByteTimeoutUs = 0x04, "bus.inter_byte_timeout_us";
    /// Control loop period.
    ControlPeriodUs = 0x10, "control.period_us";
    /// Proportional gain.
    Kp = 0x11, "control.kp";
    /// Integral gain.
    Ki = 0x12, "control.ki";
    /// Derivative gain.
    Kd = 0x13, "control.kd";
    /// Derivative low-pass weight.
    DerivativeAlpha = 0x14, "control.derivative_alpha";
    /// Output clamp.
    MaxDuty = 0x15, "control.max_duty";
    /// Minimum drive outside the dead-band.
    MinDuty = 0x16, "control.min_duty";
    /// Holding duty after arrival (0 releases the drive).
    HoldDuty = 0x17, "control.hold_duty";
    /// Error treated as arrived.
    DeadbandTicks = 0x18, "control.deadband_ticks";
    /// Completion tolerance.
    ToleranceTicks = 0x19, "control.tolerance_ticks";
    /// Consecutive in-tolerance periods for completion.
    SettlePeriods = 0x1A, "control.settle_periods";
    /// Pinned-without-motion time before a stall.
    StallTimeoutMs = 0x1B, "control.stall_timeout_ms";
    /// Motion below this counts as no motion.
    StallWindowTicks = 0x1C, "control.stall_window_ticks";
    /// Per-period jump treated as an encoder glitch.
    GlitchTicks = 0x1D, "control.glitch_ticks";
    /// Overcurrent fault limit.
    OvercurrentMa = 0x1E, "control.overcurrent_ma";
    /// Overcurrent e-stop limit.
    CriticalCurrentMa = 0x1F, "control.critical_current_ma";
    /// Overtemperature fault limit.
    OvertempC = 0x20, "control.overtemp_c";
    /// Overtemperature e-stop limit.
    CriticalTempC = 0x21, "control.critical_temp_c";
    /// Per-move deadline.
    MoveTimeoutMs = 0x22, "control.move_timeout_ms";
    /// Longest accepted move, tenths of a millimetre.
    MaxMoveTenths = 0x30, "motion.max_move_tenths";
    /// Pitch used by button-initiated moves.
    DefaultPitchMm = 0x31, "motion.default_pitch_mm";
    /// Extra overshoot on backlash-compensated reverse moves.
    ApproachTicks = 0x32, "motion.approach_ticks";
    /// Out-and-back distance used to re-check a mechanical fault.
    ProbeTicks = 0x33, "motion.probe_ticks";
    /// Setpoint ramp limit per period (0 disables).
    VelocityCapTicks = 0x34, "motion.velocity_cap_ticks";
    /// Time allowed between e-stop reset arm and confirm.
    EstopResetWindowMs = 0x35, "motion.estop_reset_window_ms";
    /// Reduced duty for calibration seeks.
    SeekDuty = 0x40, "calibration.seek_duty";
    /// Seek travel bound.
    MaxTravelTicks = 0x41, "calibration.max_travel_ticks";
    /// Known distance between the mechanical stops.
    ReferenceTravelMm = 0x42, "calibration.reference_travel_mm";
    /// Back-off distance for the backlash measurement.
    BacklashProbeTicks = 0x43, "calibration.backlash_probe_ticks";
    /// Deadline for each calibration move.
    CalibrationTimeoutMs = 0x44, "calibration.timeout_ms";
    /// Brake (rather than coast) on zero duty.
    AutoBrake = 0x50, "drive.auto_brake";
    /// Bridge duty at the smallest non-zero command, in percent.
    DriveMinPercent = 0x51, "drive.min_percent";
    /// Swap the drive bridge outputs.
    DriveInvert = 0x52, "drive.invert";
    /// Count the encoder the other way.
    EncoderInvert = 0x53, "drive.encoder_invert";
    /// Run the peel motor with tape moves.
    PeelEnabled = 0x60, "peel.enabled";
    /// Peel motor duty.
    PeelDuty = 0x61, "peel.duty";
    /// Minimum peel run per move.
    PeelRunMs = 0x62, "peel.run_ms";
    /// Peel run after the move has finished.
    PeelOverrunMs = 0x63, "peel.overrun_ms";
    /// Swap the peel bridge outputs.
    PeelInvert = 0x64, "peel.invert";
    /// Peel bridge duty at the smallest non-zero command, in percent.
    PeelMinPercent = 0x65, "peel.min_percent";
    /// Refuse bus moves until the host has sent initialize-feeder.
    RequireInit = 0x70, "device.require_init";
}

impl SettingKey {
    /// True for keys that change how the link talks on the bus.
    pub const fn is_bus(self) -> bool {
        (self as u8) < 0x10
    }

    /// True for keys that change bridge, encoder or peel wiring.
    pub const fn is_drive(self) -> bool {
        matches!(self as u8, 0x50..=0x6F)
    }
}

// ============================================================================
// Bus Config
// ============================================================================

/// Bus addressing and timing
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BusConfig {
    /// Unicast address (1..=254; 0 and 255 are broadcast)
    pub address: u8,
    /// Silence before a reply in microseconds
    pub guard_delay_us: u32,
    /// Extra delay per address unit for broadcast replies
    pub broadcast_slot_us: u32,
    /// Inter-byte gap that discards a partial frame
    pub inter_byte_timeout_us: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: 1,
            guard_delay_us: 500,
            broadcast_slot_us: 1000,
            inter_byte_timeout_us: 2000,
        }
    }
}

impl BusConfig {
    /// Set the bus address
    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    /// Set the reply guard delay
    pub fn with_guard_delay_us(mut self, us: u32) -> Self {
        self.guard_delay_us = us;
        self
    }

    /// Set the inter-byte timeout
    pub fn with_inter_byte_timeout_us(mut self, us: u32) -> Self {
        self.inter_byte_timeout_us = us;
        self
    }
}

// ============================================================================
// Control Config
// ============================================================================

/// Control loop gains, limits and fault thresholds
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlConfig {
    /// Control period in microseconds
    pub period_us: u32,
    /// Proportional gain (duty per tick)
    pub kp: f32,
    /// Integral gain (duty per tick-second)
    pub ki: f32,
    /// Derivative gain (duty per tick/second)
    pub kd: f32,
    /// Weight of the newest sample in the derivative filter
    pub derivative_alpha: f32,
    /// Output clamp (0.0 to 1.0)
    pub max_duty: f32,
    /// Minimum drive outside the dead-band
    pub min_duty: f32,
    /// Holding duty after arrival; 0 releases the drive
    pub hold_duty: f32,
    /// Error treated as arrived
    pub deadband_ticks: u32,
    /// Completion tolerance
    pub tolerance_ticks: u32,
    /// Consecutive in-tolerance periods for completion
    pub settle_periods: u16,
    /// Pinned-without-motion time before a stall
    pub stall_timeout_ms: u32,
    /// Motion at or below this counts as none
    pub stall_window_ticks: u32,
    /// Per-period jump treated as an encoder glitch
    pub glitch_ticks: u32,
    /// Overcurrent fault limit
    pub overcurrent_ma: u32,
    /// Overcurrent e-stop limit
    pub critical_current_ma: u32,
    /// Overtemperature fault limit
    pub overtemp_c: i32,
    /// Overtemperature e-stop limit
    pub critical_temp_c: i32,
    /// Per-move deadline
    pub move_timeout_ms: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            period_us: 1000,
            kp: 0.01,
            ki: 0.02,
            kd: 0.00001,
            derivative_alpha: 0.1,
            max_duty: 0.8,
            min_duty: 0.05,
            hold_duty: 0.0,
            deadband_ticks: 4,
            tolerance_ticks: 15,
            settle_periods: 3,
            stall_timeout_ms: 250,
            stall_window_ticks: 2,
            glitch_ticks: 200,
            overcurrent_ma: 1500,
            critical_current_ma: 3000,
            overtemp_c: 85,
            critical_temp_c: 105,
            move_timeout_ms: 5000,
        }
    }
}

impl ControlConfig {
    /// Set the PID gains
    pub fn with_gains(mut self, kp: f32, ki: f32, kd: f32) -> Self {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
        self
    }

    /// Set the duty limits
    pub fn with_duty_limits(mut self, min: f32, max: f32) -> Self {
        self.min_duty = min.clamp(0.0, 1.0);
        self.max_duty = max.clamp(0.0, 1.0);
        self
    }

    /// Set the holding duty
    pub fn with_hold_duty(mut self, duty: f32) -> Self {
        self.hold_duty = duty.clamp(0.0, 1.0);
        self
    }

    /// Set the stall timeout
    pub fn with_stall_timeout_ms(mut self, ms: u32) -> Self {
        self.stall_timeout_ms = ms;
        self
    }

    /// Set the per-move deadline
    pub fn with_move_timeout_ms(mut self, ms: u32) -> Self {
        self.move_timeout_ms = ms;
        self
    }

    /// Set overcurrent fault and e-stop limits
    pub fn with_current_limits(mut self, fault_ma: u32, critical_ma: u32) -> Self {
        self.overcurrent_ma = fault_ma;
        self.critical_current_ma = critical_ma;
        self
    }

    /// Set overtemperature fault and e-stop limits
    pub fn with_temp_limits(mut self, fault_c: i32, critical_c: i32) -> Self {
        self.overtemp_c = fault_c;
        self.critical_temp_c = critical_c;
        self
    }

    /// Stall timeout expressed in control periods
    pub fn stall_periods(&self) -> u32 {
        ms_to_periods(self.stall_timeout_ms, self.period_us)
    }

    /// Move deadline expressed in control periods
    pub fn move_deadline_periods(&self) -> u32 {
        ms_to_periods(self.move_timeout_ms, self.period_us)
    }
}

/// Convert milliseconds into whole control periods (at least one).
pub fn ms_to_periods(ms: u32, period_us: u32) -> u32 {
    let periods = (ms as u64 * 1000) / period_us.max(1) as u64;
    periods.clamp(1, u32::MAX as u64) as u32
}

// ============================================================================
// Motion Config
// ============================================================================

/// Move planning limits
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MotionConfig {
    /// Longest accepted move in tenths of a millimetre
    pub max_move_tenths: u16,
    /// Pitch used by button moves
    pub default_pitch_mm: u8,
    /// Extra overshoot on backlash-compensated reverse moves
    pub approach_ticks: u32,
    /// Out-and-back distance when re-checking a mechanical fault
    pub probe_ticks: u32,
    /// Setpoint ramp limit in ticks per period (0 disables)
    pub velocity_cap_ticks: u32,
    /// Time allowed between e-stop reset arm and confirm
    pub estop_reset_window_ms: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            max_move_tenths: 400,
            default_pitch_mm: 4,
            approach_ticks: 50,
            probe_ticks: 40,
            velocity_cap_ticks: 0,
            estop_reset_window_ms: 5000,
        }
    }
}

impl MotionConfig {
    /// Set the maximum move length in tenths of a millimetre
    pub fn with_max_move_tenths(mut self, tenths: u16) -> Self {
        self.max_move_tenths = tenths;
        self
    }

    /// Set the probe distance
    pub fn with_probe_ticks(mut self, ticks: u32) -> Self {
        self.probe_ticks = ticks;
        self
    }

    /// Set the setpoint velocity cap
    pub fn with_velocity_cap_ticks(mut self, ticks: u32) -> Self {
        self.velocity_cap_ticks = ticks;
        self
    }
}

// ============================================================================
// Calibration Config
// ============================================================================

/// Calibration procedure parameters
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationConfig {
    /// Constant duty for guided seeks
    pub seek_duty: f32,
    /// Seek travel bound in ticks
    pub max_travel_ticks: u32,
    /// Known distance between the mechanical stops in millimetres
    pub reference_travel_mm: f32,
    /// Back-off distance for the backlash measurement
    pub backlash_probe_ticks: u32,
    /// Deadline for each guided move
    pub timeout_ms: u32,
    /// Ticks per millimetre assumed before the first calibration
    pub default_ticks_per_mm: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            seek_duty: 0.3,
            max_travel_ticks: 12_000,
            reference_travel_mm: 20.0,
            backlash_probe_ticks: 400,
            timeout_ms: 10_000,
            default_ticks_per_mm: 225.46,
        }
    }
}

impl CalibrationConfig {
    /// Set the seek duty
    pub fn with_seek_duty(mut self, duty: f32) -> Self {
        self.seek_duty = duty.clamp(0.0, 1.0);
        self
    }

    /// Set the reference travel
    pub fn with_reference_travel_mm(mut self, mm: f32) -> Self {
        self.reference_travel_mm = mm;
        self
    }

    /// Set the seek travel bound
    pub fn with_max_travel_ticks(mut self, ticks: u32) -> Self {
        self.max_travel_ticks = ticks;
        self
    }
}

// ============================================================================
// Drive Config
// ============================================================================

/// Drive bridge and encoder wiring
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriveConfig {
    /// Brake rather than coast when the drive is idle
    pub auto_brake: bool,
    /// Bridge duty for the smallest non-zero command, in percent
    pub min_percent: u8,
    /// Motor leads are reversed
    pub invert: bool,
    /// Encoder channels are reversed
    pub encoder_invert: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            auto_brake: true,
            min_percent: 65,
            invert: false,
            encoder_invert: false,
        }
    }
}

impl DriveConfig {
    /// Set whether the motor leads are reversed
    pub fn with_invert(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }

    /// Set whether the encoder channels are reversed
    pub fn with_encoder_invert(mut self, invert: bool) -> Self {
        self.encoder_invert = invert;
        self
    }

    /// Set the brake-on-idle behaviour
    pub fn with_auto_brake(mut self, auto_brake: bool) -> Self {
        self.auto_brake = auto_brake;
        self
    }

    /// Duty mapping for the drive bridge
    pub fn mapping(&self) -> PwmMapping {
        PwmMapping {
            min_percent: self.min_percent,
            auto_brake: self.auto_brake,
            invert: self.invert,
        }
    }
}

// ============================================================================
// Peel Config
// ============================================================================

/// Peel motor timing
///
/// The peel motor turns with every tape move in the move's direction and
/// keeps turning until both `run_ms` after the start and `overrun_ms`
/// after the end of the move have passed.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeelConfig {
    /// Run the peel motor with tape moves
    pub enabled: bool,
    /// Duty while running
    pub duty: f32,
    /// Minimum run per move
    pub run_ms: u32,
    /// Run after the move has finished
    pub overrun_ms: u32,
    /// Motor leads are reversed
    pub invert: bool,
    /// Bridge duty for the smallest non-zero command, in percent
    pub min_percent: u8,
}

impl Default for PeelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duty: 1.0,
            run_ms: 1000,
            overrun_ms: 1000,
            invert: false,
            min_percent: 65,
        }
    }
}

impl PeelConfig {
    /// Enable or disable the peel motor
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the run and overrun times
    pub fn with_times_ms(mut self, run_ms: u32, overrun_ms: u32) -> Self {
        self.run_ms = run_ms;
        self.overrun_ms = overrun_ms;
        self
    }

    /// Duty mapping for the peel bridge; the peel always coasts when idle
    pub fn mapping(&self) -> PwmMapping {
        PwmMapping {
            min_percent: self.min_percent,
            auto_brake: false,
            invert: self.invert,
        }
    }
}

// ============================================================================
// Device Config
// ============================================================================

/// Device identification
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceConfig {
    /// Factory-unique id reported by get-feeder-id
    pub uuid: FeederUuid,
    /// Bus moves wait for initialize-feeder
    pub require_init: bool,
}

impl DeviceConfig {
    /// Set the unique id
    pub fn with_uuid(mut self, uuid: [u8; UUID_LEN]) -> Self {
        self.uuid = uuid;
        self
    }

    /// Set whether bus moves wait for initialize-feeder
    pub fn with_require_init(mut self, require_init: bool) -> Self {
        self.require_init = require_init;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct MapService(&'static [(SettingKey, SettingValue)]);

    impl ConfigService for MapService {
        fn read(&self, key: SettingKey) -> Option<SettingValue> {
            self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
        }
    }

    #[test]
    fn default_config_is_valid() {
        let config = FeederConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.address, 1);
        assert_eq!(config.control.period_us, 1000);
        assert_eq!(config.control.stall_periods(), 250);
        assert_eq!(config.control.move_deadline_periods(), 5000);
    }

    #[test]
    fn builder_pattern() {
        let config = FeederConfig::default()
            .with_bus(BusConfig::default().with_address(9).with_guard_delay_us(800))
            .with_drive(DriveConfig::default().with_invert(true))
            .with_device(DeviceConfig::default().with_uuid([9; UUID_LEN]));

        assert_eq!(config.bus.address, 9);
        assert_eq!(config.bus.guard_delay_us, 800);
        assert!(config.drive.mapping().invert);
        assert_eq!(config.device.uuid, [9; UUID_LEN]);
    }

    #[test]
    fn load_uses_service_values_and_defaults() {
        let service = MapService(&[
            (SettingKey::BusAddress, SettingValue::Int(5)),
            (SettingKey::Kp, SettingValue::Float(0.02)),
            (SettingKey::AutoBrake, SettingValue::Bool(false)),
        ]);
        let config = FeederConfig::load(&service).unwrap();
        assert_eq!(config.bus.address, 5);
        assert_eq!(config.control.kp, 0.02);
        assert!(!config.drive.auto_brake);
        assert_eq!(config.control.ki, ControlConfig::default().ki);
    }

    #[test]
    fn load_rejects_wrong_type() {
        let service = MapService(&[(SettingKey::Kp, SettingValue::Int(1))]);
        assert_eq!(
            FeederConfig::load(&service),
            Err(ConfigError::WrongType(SettingKey::Kp))
        );
    }

    #[test]
    fn load_rejects_out_of_range() {
        let service = MapService(&[(SettingKey::BusAddress, SettingValue::Int(0))]);
        assert_eq!(
            FeederConfig::load(&service),
            Err(ConfigError::OutOfRange(SettingKey::BusAddress))
        );

        let service = MapService(&[(SettingKey::MaxDuty, SettingValue::Float(f32::NAN))]);
        assert_eq!(
            FeederConfig::load(&service),
            Err(ConfigError::OutOfRange(SettingKey::MaxDuty))
        );
    }

    #[test]
    fn load_rejects_inconsistent_values() {
        let service = MapService(&[
            (SettingKey::MinDuty, SettingValue::Float(0.5)),
            (SettingKey::MaxDuty, SettingValue::Float(0.3)),
        ]);
        assert!(matches!(
            FeederConfig::load(&service),
            Err(ConfigError::Inconsistent(_))
        ));
    }

    #[test]
    fn set_is_all_or_nothing() {
        let mut config = FeederConfig::default();
        let before = config.clone();
        assert!(config
            .set(SettingKey::DeadbandTicks, SettingValue::Int(500))
            .is_err());
        assert_eq!(config, before);

        config
            .set(SettingKey::DeadbandTicks, SettingValue::Int(8))
            .unwrap();
        assert_eq!(config.get(SettingKey::DeadbandTicks), SettingValue::Int(8));
    }

    #[test]
    fn default_pitch_must_be_in_table() {
        let mut config = FeederConfig::default();
        assert_eq!(
            config.set(SettingKey::DefaultPitchMm, SettingValue::Int(3)),
            Err(ConfigError::OutOfRange(SettingKey::DefaultPitchMm))
        );
        config
            .set(SettingKey::DefaultPitchMm, SettingValue::Int(8))
            .unwrap();
        assert_eq!(config.motion.default_pitch_mm, 8);
    }

    #[test]
    fn every_key_reads_back_what_it_stores() {
        let mut config = FeederConfig::default();
        for &key in SettingKey::ALL {
            let value = config.get(key);
            config.set(key, value).unwrap();
            assert_eq!(config.get(key), value, "{}", key.name());
        }
    }

    // =========================================================================
    // SettingKey / SettingValue Tests
    // =========================================================================

    #[test]
    fn setting_key_lookup() {
        assert_eq!(SettingKey::from_u8(0x11), Some(SettingKey::Kp));
        assert_eq!(SettingKey::from_u8(0xEE), None);
        assert_eq!(SettingKey::from_name("bus.address"), Some(SettingKey::BusAddress));
        assert_eq!(SettingKey::Kd.name(), "control.kd");
    }

    #[test]
    fn setting_value_wire_form() {
        let (tag, bytes) = SettingValue::Int(-2).to_wire();
        assert_eq!(tag, 0);
        assert_eq!(bytes, [0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(SettingValue::from_wire(tag, bytes), Some(SettingValue::Int(-2)));

        let (tag, bytes) = SettingValue::Float(0.5).to_wire();
        assert_eq!(SettingValue::from_wire(tag, bytes), Some(SettingValue::Float(0.5)));

        assert_eq!(SettingValue::from_wire(2, [0, 0, 0, 2]), None);
        assert_eq!(SettingValue::from_wire(7, [0; 4]), None);
    }

    #[test]
    fn huge_stall_timeout_does_not_overflow() {
        let config = FeederConfig::default()
            .with_control(ControlConfig::default().with_stall_timeout_ms(u32::MAX));
        assert_eq!(config.validate(), Ok(()));

        let config = FeederConfig::default()
            .with_control(ControlConfig::default().with_stall_timeout_ms(0));
        assert!(matches!(config.validate(), Err(ConfigError::Inconsistent(_))));
    }

    #[test]
    fn drive_and_peel_keys() {
        let mut config = FeederConfig::default();
        assert!(SettingKey::AutoBrake.is_drive());
        assert!(SettingKey::PeelMinPercent.is_drive());
        assert!(!SettingKey::RequireInit.is_drive());
        assert!(SettingKey::BusAddress.is_bus());

        config
            .set(SettingKey::DriveMinPercent, SettingValue::Int(40))
            .unwrap();
        config.set(SettingKey::PeelInvert, SettingValue::Bool(true)).unwrap();
        assert_eq!(config.drive.mapping().min_percent, 40);
        assert!(config.peel.mapping().invert);
        assert!(!config.peel.mapping().auto_brake);
        assert_eq!(
            config.set(SettingKey::DriveMinPercent, SettingValue::Int(101)),
            Err(ConfigError::OutOfRange(SettingKey::DriveMinPercent))
        );
        assert_eq!(
            config.set(SettingKey::RequireInit, SettingValue::Int(1)),
            Err(ConfigError::WrongType(SettingKey::RequireInit))
        );
    }
}
