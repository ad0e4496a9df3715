//! Cover-tape peel motor.
//!
//! The peel motor has no encoder. It runs open loop in the direction of
//! each tape segment that asks for it ([`ControlTarget::peel`]) and keeps
//! running after the segment ends until both the minimum run time since it
//! started and the overrun time since the segment ended have passed.
//! E-stop stops it at once.
//!
//! [`PeelDrive::update`] belongs in the same context as
//! [`ControlLoop::tick`](crate::control::ControlLoop::tick), right after it:
//! it only reads [`ControlShared`].
//!
//! ```rust
//! use gluon_feeder::control::ControlShared;
//! use gluon_feeder::hal::MockMotor;
//! use gluon_feeder::peel::PeelDrive;
//!
//! let shared = ControlShared::new();
//! let mut peel = PeelDrive::new(MockMotor::new());
//! peel.update(&shared, 0).unwrap();
//! assert!(!peel.is_running());
//! ```
//!
//! [`ControlTarget::peel`]: crate::control::ControlTarget::peel

use crate::config::PeelConfig;
use crate::control::ControlShared;
use crate::motor::PwmMapping;
use crate::traits::{Direction, MotorCommand, MotorDriver};

/// Peel options in the units the drive works in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeelSettings {
    /// Duty while running.
    pub duty: f32,
    /// Minimum run, microseconds.
    pub run_us: u64,
    /// Run after the segment ends, microseconds.
    pub overrun_us: u64,
    /// Bridge mapping.
    pub mapping: PwmMapping,
}

impl Default for PeelSettings {
    fn default() -> Self {
        Self::from_config(&PeelConfig::default())
    }
}

impl PeelSettings {
    /// Convert from configuration.
    pub fn from_config(c: &PeelConfig) -> Self {
        Self {
            duty: c.duty,
            run_us: u64::from(c.run_ms) * 1000,
            overrun_us: u64::from(c.overrun_ms) * 1000,
            mapping: c.mapping(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PeelRun {
    direction: Direction,
    started_us: u64,
    ended_us: Option<u64>,
}

/// Open-loop peel motor timing.
pub struct PeelDrive<M: MotorDriver> {
    motor: M,
    settings: PeelSettings,
    version: u32,
    run: Option<PeelRun>,
}

impl<M: MotorDriver> PeelDrive<M> {
    /// Wrap a motor; it is released until the first segment asks for it.
    pub fn new(motor: M) -> Self {
        Self {
            motor,
            settings: PeelSettings::default(),
            version: 0,
            run: None,
        }
    }

    /// Borrow the motor.
    pub fn motor(&self) -> &M {
        &self.motor
    }

    /// True while the motor is driven.
    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Direction of the current run.
    pub fn direction(&self) -> Option<Direction> {
        self.run.map(|r| r.direction)
    }

    /// Follow the running segment and the e-stop flag.
    pub fn update(&mut self, shared: &ControlShared, now_us: u64) -> Result<(), M::Error> {
        if let Some((version, settings)) = shared.drive_settings() {
            if version != self.version {
                self.version = version;
                self.settings = settings.peel;
                self.motor.configure(settings.peel.mapping);
            }
        }

        if shared.estop_engaged() {
            return self.stop();
        }

        match (shared.peel_direction(), self.run.as_mut()) {
            (Some(direction), Some(run)) if run.direction == direction => {
                run.ended_us = None;
                Ok(())
            }
            (Some(direction), _) => self.start(direction, now_us),
            (None, Some(run)) => {
                let ended = *run.ended_us.get_or_insert(now_us);
                let until = (run.started_us + self.settings.run_us)
                    .max(ended + self.settings.overrun_us);
                if now_us >= until {
                    self.stop()
                } else {
                    Ok(())
                }
            }
            (None, None) => Ok(()),
        }
    }

    fn start(&mut self, direction: Direction, now_us: u64) -> Result<(), M::Error> {
        self.run = Some(PeelRun {
            direction,
            started_us: now_us,
            ended_us: None,
        });
        self.motor.set_enabled(true)?;
        self.motor
            .apply(MotorCommand::new(self.settings.duty, direction))
    }

    /// Release the motor.
    pub fn stop(&mut self) -> Result<(), M::Error> {
        if self.run.take().is_some() {
            self.motor.stop()?;
            self.motor.set_enabled(false)?;
        }
        Ok(())
    }
}
