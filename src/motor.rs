//! H-bridge motor driver built on two PWM outputs.
//!
//! Small brushed gearmotors do not turn at all below a certain duty, so the
//! relative duty from the control loop is mapped onto `[min_percent, 100]`
//! rather than `[0, 100]`. Zero duty either brakes (both low-side on) or
//! coasts (both off), selected by `auto_brake`. `invert` swaps the two
//! inputs for a motor wired the other way round.
//!
//! [`HBridgeMotor`] implements [`MotorDriver`] for any [`PwmPins`]. With
//! the `embedded-hal` feature, [`PwmBridge`] provides [`PwmPins`] over any
//! pair of `embedded-hal` 1.0 PWM channels plus enable and enable-sense
//! GPIOs.

use crate::traits::{Direction, MotorCommand, MotorDriver};

/// Percent duty on each bridge input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HBridgeOutput {
    /// Input 1 duty in percent.
    pub in1: u8,
    /// Input 2 duty in percent.
    pub in2: u8,
}

impl HBridgeOutput {
    /// Both inputs off.
    pub const COAST: HBridgeOutput = HBridgeOutput { in1: 0, in2: 0 };
    /// Both inputs fully on.
    pub const BRAKE: HBridgeOutput = HBridgeOutput { in1: 100, in2: 100 };
}

/// Relative duty to bridge output mapping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PwmMapping {
    /// Lowest percent that still turns the motor.
    pub min_percent: u8,
    /// Brake rather than coast at zero duty.
    pub auto_brake: bool,
    /// Swap the bridge inputs.
    pub invert: bool,
}

impl Default for PwmMapping {
    fn default() -> Self {
        Self {
            min_percent: 65,
            auto_brake: true,
            invert: false,
        }
    }
}

impl PwmMapping {
    /// Map a command onto the two bridge inputs.
    ///
    /// ```rust
    /// use gluon_feeder::motor::{HBridgeOutput, PwmMapping};
    /// use gluon_feeder::traits::{Direction, MotorCommand};
    ///
    /// let map = PwmMapping::default();
    /// let out = map.map(MotorCommand::new(1.0, Direction::Reverse));
    /// assert_eq!(out, HBridgeOutput { in1: 0, in2: 100 });
    /// assert_eq!(map.map(MotorCommand::COAST), HBridgeOutput::BRAKE);
    /// ```
    pub fn map(&self, cmd: MotorCommand) -> HBridgeOutput {
        if cmd.is_zero() {
            return if self.auto_brake {
                HBridgeOutput::BRAKE
            } else {
                HBridgeOutput::COAST
            };
        }
        let min = self.min_percent.min(100) as f32;
        let percent = (min + (100.0 - min) * cmd.duty() + 0.5) as u8;
        let direction = match (cmd.direction(), self.invert) {
            (d, false) => d,
            (Direction::Forward, true) => Direction::Reverse,
            (Direction::Reverse, true) => Direction::Forward,
        };
        match direction {
            Direction::Forward => HBridgeOutput {
                in1: percent,
                in2: 0,
            },
            Direction::Reverse => HBridgeOutput {
                in1: 0,
                in2: percent,
            },
        }
    }
}

/// Raw bridge pins.
pub trait PwmPins {
    /// Error type for pin operations.
    type Error;

    /// Set both PWM inputs.
    fn set_outputs(&mut self, out: HBridgeOutput) -> Result<(), Self::Error>;

    /// Drive the enable pin.
    fn set_enable(&mut self, on: bool) -> Result<(), Self::Error>;

    /// Read the enable feedback pin.
    fn enable_feedback(&self) -> bool;
}

/// [`MotorDriver`] over a pair of PWM pins.
#[derive(Debug)]
pub struct HBridgeMotor<P> {
    pins: P,
    mapping: PwmMapping,
}

impl<P: PwmPins> HBridgeMotor<P> {
    /// Wrap pins with a mapping.
    pub fn new(pins: P, mapping: PwmMapping) -> Self {
        Self { pins, mapping }
    }

    /// Borrow the pins.
    pub fn pins(&self) -> &P {
        &self.pins
    }

    /// Give the pins back.
    pub fn into_pins(self) -> P {
        self.pins
    }

    /// Change the mapping (e.g. after an `auto_brake` setting change).
    pub fn set_mapping(&mut self, mapping: PwmMapping) {
        self.mapping = mapping;
    }

    /// Mapping in force.
    pub fn mapping(&self) -> &PwmMapping {
        &self.mapping
    }
}

impl<P: PwmPins> MotorDriver for HBridgeMotor<P> {
    type Error = P::Error;

    fn apply(&mut self, cmd: MotorCommand) -> Result<(), P::Error> {
        self.pins.set_outputs(self.mapping.map(cmd))
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), P::Error> {
        if !enabled {
            self.pins.set_outputs(HBridgeOutput::COAST)?;
        }
        self.pins.set_enable(enabled)
    }

    fn enable_sensed(&self) -> bool {
        self.pins.enable_feedback()
    }

    fn configure(&mut self, mapping: PwmMapping) {
        self.set_mapping(mapping);
    }
}

// ============================================================================
// embedded-hal pins
// ============================================================================

#[cfg(feature = "embedded-hal")]
pub use self::eh::{BridgePinError, PwmBridge};

#[cfg(feature = "embedded-hal")]
mod eh {
    use core::cell::RefCell;

    use embedded_hal::digital::{self, InputPin, OutputPin};
    use embedded_hal::pwm::{self, SetDutyCycle};

    use super::{HBridgeOutput, PwmPins};

    /// A bridge pin operation failed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
    pub enum BridgePinError {
        /// Setting a PWM duty failed.
        #[error("pwm channel: {0:?}")]
        Pwm(pwm::ErrorKind),
        /// Driving the enable pin failed.
        #[error("enable pin: {0:?}")]
        Enable(digital::ErrorKind),
    }

    fn pwm_err<E: pwm::Error>(e: E) -> BridgePinError {
        BridgePinError::Pwm(e.kind())
    }

    /// [`PwmPins`] over `embedded-hal` channels.
    ///
    /// `in1`/`in2` are the two bridge inputs, `enable` the bridge enable
    /// output and `sense` an input wired back from the enable line.
    pub struct PwmBridge<A, B, E, S> {
        in1: A,
        in2: B,
        enable: E,
        // embedded-hal reads take &mut self
        sense: RefCell<S>,
    }

    impl<A, B, E, S> PwmBridge<A, B, E, S>
    where
        A: SetDutyCycle,
        B: SetDutyCycle,
        E: OutputPin,
        S: InputPin,
    {
        /// Wrap the pins. Nothing is driven until the first command.
        pub fn new(in1: A, in2: B, enable: E, sense: S) -> Self {
            Self {
                in1,
                in2,
                enable,
                sense: RefCell::new(sense),
            }
        }

        /// Give the pins back.
        pub fn release(self) -> (A, B, E, S) {
            (self.in1, self.in2, self.enable, self.sense.into_inner())
        }
    }

    impl<A, B, E, S> PwmPins for PwmBridge<A, B, E, S>
    where
        A: SetDutyCycle,
        B: SetDutyCycle,
        E: OutputPin,
        S: InputPin,
    {
        type Error = BridgePinError;

        fn set_outputs(&mut self, out: HBridgeOutput) -> Result<(), BridgePinError> {
            self.in1
                .set_duty_cycle_percent(out.in1.min(100))
                .map_err(pwm_err)?;
            self.in2
                .set_duty_cycle_percent(out.in2.min(100))
                .map_err(pwm_err)
        }

        fn set_enable(&mut self, on: bool) -> Result<(), BridgePinError> {
            let result = if on {
                self.enable.set_high()
            } else {
                self.enable.set_low()
            };
            result.map_err(|e| BridgePinError::Enable(digital::Error::kind(&e)))
        }

        fn enable_feedback(&self) -> bool {
            // an unreadable sense line reads as asserted, so a released
            // bridge with a broken sense trips the interlock
            self.sense.borrow_mut().is_high().unwrap_or(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockPins;

    #[test]
    fn duty_maps_onto_min_to_full() {
        let map = PwmMapping::default();
        assert_eq!(map.map(MotorCommand::new(0.01, Direction::Forward)).in1, 65);
        assert_eq!(map.map(MotorCommand::new(0.5, Direction::Forward)).in1, 83);
        assert_eq!(map.map(MotorCommand::new(1.0, Direction::Forward)).in1, 100);
    }

    #[test]
    fn zero_duty_brakes_or_coasts() {
        let brake = PwmMapping::default();
        let coast = PwmMapping {
            auto_brake: false,
            ..brake
        };
        assert_eq!(brake.map(MotorCommand::COAST), HBridgeOutput::BRAKE);
        assert_eq!(coast.map(MotorCommand::COAST), HBridgeOutput::COAST);
    }

    #[test]
    fn invert_swaps_inputs() {
        let map = PwmMapping {
            invert: true,
            ..PwmMapping::default()
        };
        let out = map.map(MotorCommand::new(1.0, Direction::Forward));
        assert_eq!(out, HBridgeOutput { in1: 0, in2: 100 });
        let out = map.map(MotorCommand::new(1.0, Direction::Reverse));
        assert_eq!(out, HBridgeOutput { in1: 100, in2: 0 });
        assert_eq!(map.map(MotorCommand::COAST), HBridgeOutput::BRAKE);
    }

    #[test]
    fn configure_replaces_mapping() {
        let mut motor = HBridgeMotor::new(MockPins::new(), PwmMapping::default());
        motor.stop().unwrap();
        assert_eq!(motor.pins().outputs, HBridgeOutput::BRAKE);
        motor.configure(PwmMapping {
            auto_brake: false,
            ..PwmMapping::default()
        });
        motor.stop().unwrap();
        assert_eq!(motor.pins().outputs, HBridgeOutput::COAST);
    }

    #[test]
    fn disable_coasts_before_releasing_enable() {
        let mut motor = HBridgeMotor::new(MockPins::new(), PwmMapping::default());
        motor.set_enabled(true).unwrap();
        motor
            .apply(MotorCommand::new(0.4, Direction::Forward))
            .unwrap();
        assert!(motor.enable_sensed());
        assert!(motor.pins().outputs.in1 > 0);

        motor.set_enabled(false).unwrap();
        assert_eq!(motor.pins().outputs, HBridgeOutput::COAST);
        assert!(!motor.enable_sensed());
    }

    #[cfg(feature = "embedded-hal")]
    mod bridge {
        use core::convert::Infallible;
        use std::cell::Cell;
        use std::rc::Rc;

        use embedded_hal::digital::{ErrorType as DigitalErrorType, InputPin, OutputPin};
        use embedded_hal::pwm::{ErrorType as PwmErrorType, SetDutyCycle};

        use super::super::*;

        #[derive(Default)]
        struct Channel(u16);

        impl PwmErrorType for Channel {
            type Error = Infallible;
        }

        impl SetDutyCycle for Channel {
            fn max_duty_cycle(&self) -> u16 {
                1000
            }

            fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Infallible> {
                self.0 = duty;
                Ok(())
            }
        }

        /// Enable output and its sense input share one level.
        #[derive(Clone, Default)]
        struct Line(Rc<Cell<bool>>);

        impl DigitalErrorType for Line {
            type Error = Infallible;
        }

        impl OutputPin for Line {
            fn set_low(&mut self) -> Result<(), Infallible> {
                self.0.set(false);
                Ok(())
            }

            fn set_high(&mut self) -> Result<(), Infallible> {
                self.0.set(true);
                Ok(())
            }
        }

        impl InputPin for Line {
            fn is_high(&mut self) -> Result<bool, Infallible> {
                Ok(self.0.get())
            }

            fn is_low(&mut self) -> Result<bool, Infallible> {
                Ok(!self.0.get())
            }
        }

        #[test]
        fn bridge_drives_embedded_hal_pins() {
            let line = Line::default();
            let pins = PwmBridge::new(Channel::default(), Channel::default(), line.clone(), line);
            let mut motor = HBridgeMotor::new(pins, PwmMapping::default());

            motor.set_enabled(true).unwrap();
            assert!(motor.enable_sensed());
            motor
                .apply(MotorCommand::new(1.0, Direction::Reverse))
                .unwrap();

            motor.set_enabled(false).unwrap();
            assert!(!motor.enable_sensed());
            let (in1, in2, _, _) = motor.into_pins().release();
            assert_eq!((in1.0, in2.0), (0, 0));
        }
    }
}
