//! Hardware abstraction traits for the motor driver, sensors and time.
//!
//! These are the leaves of the feeder core. Everything above them is
//! generic over these traits, so the same control loop runs against the
//! mocks in [`crate::hal::mock`], the simulated mechanism in
//! `hal::sim` (requires `std`), or a real H-bridge.
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`MotorDriver`] | Signed duty-cycle drive with enable and enable-sense |
//! | [`FaultDetector`] | Current and temperature sensing |
//! | [`Clock`] | Monotonic microsecond time source |
//!
//! # Example
//!
//! ```rust
//! use gluon_feeder::traits::{Direction, MotorCommand, MotorDriver};
//! use gluon_feeder::hal::MockMotor;
//!
//! let mut motor = MockMotor::new();
//! motor.set_enabled(true).unwrap();
//! motor.apply(MotorCommand::new(0.5, Direction::Forward)).unwrap();
//!
//! assert!(motor.enable_sensed());
//! assert_eq!(motor.last.signed(), 0.5);
//! ```

use crate::error::FaultCode;
use crate::motor::PwmMapping;

/// Direction of tape travel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    /// Advance the tape (positive ticks).
    #[default]
    Forward,
    /// Retract the tape (negative ticks).
    Reverse,
}

/// One period's drive output: magnitude plus direction.
///
/// Produced by the control loop every period and handed straight to the
/// [`MotorDriver`]; never queued.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotorCommand {
    duty: f32,
    direction: Direction,
}

impl Default for MotorCommand {
    fn default() -> Self {
        Self::COAST
    }
}

impl MotorCommand {
    /// Zero output.
    pub const COAST: MotorCommand = MotorCommand {
        duty: 0.0,
        direction: Direction::Forward,
    };

    /// Build a command; duty is clamped to 0.0..=1.0 (NaN becomes 0).
    pub fn new(duty: f32, direction: Direction) -> Self {
        let duty = if duty > 0.0 { duty.min(1.0) } else { 0.0 };
        Self { duty, direction }
    }

    /// Build from a signed output, clamped to `±limit`.
    pub fn from_signed(output: f32, limit: f32) -> Self {
        let limit = limit.clamp(0.0, 1.0);
        if output < 0.0 {
            Self::new((-output).min(limit), Direction::Reverse)
        } else {
            Self::new(output.min(limit), Direction::Forward)
        }
    }

    /// Duty magnitude (0.0 to 1.0).
    pub fn duty(&self) -> f32 {
        self.duty
    }

    /// Drive direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Signed duty, negative for reverse.
    pub fn signed(&self) -> f32 {
        match self.direction {
            Direction::Forward => self.duty,
            Direction::Reverse => -self.duty,
        }
    }

    /// True if no drive is applied.
    pub fn is_zero(&self) -> bool {
        self.duty == 0.0
    }
}

/// Motor driver trait: signed duty-cycle drive with a hardware enable.
///
/// # Implementation Notes
///
/// - `apply` is called once per control period and must not block
/// - `set_enabled(false)` must leave the bridge unable to drive even if a
///   non-zero command follows
/// - `enable_sensed` reads back the enable line independently; a mismatch
///   with the commanded state is a safety interlock
pub trait MotorDriver {
    /// Error type for driver operations.
    type Error;

    /// Apply a drive command.
    fn apply(&mut self, cmd: MotorCommand) -> Result<(), Self::Error>;

    /// Assert or release the bridge enable line.
    fn set_enabled(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Read back the enable line.
    fn enable_sensed(&self) -> bool;

    /// Convenience method to zero the output.
    fn stop(&mut self) -> Result<(), Self::Error> {
        self.apply(MotorCommand::COAST)
    }

    /// Take a new duty mapping. Drivers without one ignore it.
    fn configure(&mut self, _mapping: PwmMapping) {}
}

/// Limits for [`FaultDetector::active_fault`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultLimits {
    /// Fault limit in milliamps.
    pub overcurrent_ma: u32,
    /// E-stop limit in milliamps.
    pub critical_current_ma: u32,
    /// Fault limit in degrees Celsius.
    pub overtemp_c: i32,
    /// E-stop limit in degrees Celsius.
    pub critical_temp_c: i32,
}

impl FaultLimits {
    /// True if both readings are under their fault limits (or missing).
    pub fn within(&self, current_ma: Option<u32>, temperature_c: Option<i32>) -> bool {
        current_ma.is_none_or(|c| c < self.overcurrent_ma)
            && temperature_c.is_none_or(|t| t < self.overtemp_c)
    }
}

/// An electrical fault with its severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectricalFault {
    /// [`FaultCode::MotionOvercurrent`] or [`FaultCode::MotionOvertemp`].
    pub code: FaultCode,
    /// Past the critical limit; escalates to e-stop.
    pub critical: bool,
}

/// Current and temperature sensing.
///
/// Readings are optional; a board without a sensor returns `None` and the
/// corresponding fault can never trigger.
pub trait FaultDetector {
    /// Motor current in milliamps.
    fn current_ma(&self) -> Option<u32>;

    /// Driver temperature in degrees Celsius.
    fn temperature_c(&self) -> Option<i32>;

    /// Returns the most severe active fault.
    ///
    /// Critical readings win over non-critical ones; temperature wins over
    /// current at equal severity.
    fn active_fault(&self, limits: &FaultLimits) -> Option<ElectricalFault> {
        let current = self.current_ma();
        let temp = self.temperature_c();
        let hot = |l: i32| temp.is_some_and(|t| t >= l);
        let high = |l: u32| current.is_some_and(|c| c >= l);

        let (code, critical) = if hot(limits.critical_temp_c) {
            (FaultCode::MotionOvertemp, true)
        } else if high(limits.critical_current_ma) {
            (FaultCode::MotionOvercurrent, true)
        } else if hot(limits.overtemp_c) {
            (FaultCode::MotionOvertemp, false)
        } else if high(limits.overcurrent_ma) {
            (FaultCode::MotionOvercurrent, false)
        } else {
            return None;
        };
        Some(ElectricalFault { code, critical })
    }
}

/// Monotonic microsecond time source.
///
/// # Example
///
/// ```rust
/// use gluon_feeder::traits::Clock;
/// use gluon_feeder::hal::MockClock;
///
/// let mut clock = MockClock::new();
/// assert_eq!(clock.now_us(), 0);
///
/// clock.advance_ms(2);
/// assert_eq!(clock.now_us(), 2000);
/// ```
pub trait Clock {
    /// Microseconds since an arbitrary epoch. Must never go backwards.
    fn now_us(&self) -> u64;
}
