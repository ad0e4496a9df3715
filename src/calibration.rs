//! Calibration profile and the guided-move procedure that derives it.
//!
//! The engine knows nothing about the exact travel of the mechanism. It
//! runs four constant-duty moves through the control loop and reads the
//! physical constants off their [`MoveReport`]s:
//!
//! | Phase | Move | Measures |
//! |-------|------|----------|
//! | 1 | reverse until stall | reference zero, stall current |
//! | 2 | forward until stall | travel between the stops, so ticks/mm |
//! | 3 | reverse by the probe distance | cruise velocity |
//! | 4 | forward again | dead periods, so backlash |
//!
//! A stall is the expected end of phases 1 and 2. Any other fault ends the
//! run; so does a seek that reaches its travel bound without stalling.
//!
//! ```rust
//! use gluon_feeder::calibration::CalibrationProfile;
//!
//! let profile = CalibrationProfile::from_measurements(200.0, 30.0, 900).unwrap();
//! assert_eq!(profile.ticks_for_tenths(40), 800);
//! assert_eq!(profile.ticks_for_pitch(4), Some(800));
//! assert_eq!(profile.ticks_for_pitch(5), None);
//! ```

use tracing::{debug, info};

use crate::config::CalibrationConfig;
use crate::control::{DriveMode, MoveOutcome, MoveReport};
use crate::error::{CalibrationError, FaultCode};

/// Tape pitches with a precomputed advance distance.
pub const PITCHES_MM: [u8; 5] = [2, 4, 8, 12, 16];

fn round_ticks(x: f32) -> u32 {
    if x <= 0.0 {
        0
    } else {
        (x + 0.5) as u32
    }
}

/// Physical constants of one feeder.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationProfile {
    /// Encoder ticks per millimetre of tape.
    pub ticks_per_mm: f32,
    /// Slack taken up when the direction reverses.
    pub backlash_ticks: u32,
    /// Current drawn against a hard stop.
    pub stall_current_ma: u32,
    /// Advance distance for each entry of [`PITCHES_MM`].
    pub pitch_ticks: [u32; PITCHES_MM.len()],
}

impl CalibrationProfile {
    /// Build and validate a profile from measured values.
    pub fn from_measurements(
        ticks_per_mm: f32,
        backlash_ticks: f32,
        stall_current_ma: u32,
    ) -> Result<Self, CalibrationError> {
        if !backlash_ticks.is_finite() || backlash_ticks < 0.0 {
            return Err(CalibrationError::InvalidProfile("backlash must be non-negative"));
        }
        let mut pitch_ticks = [0; PITCHES_MM.len()];
        for (slot, mm) in pitch_ticks.iter_mut().zip(PITCHES_MM) {
            *slot = round_ticks(mm as f32 * ticks_per_mm);
        }
        let profile = Self {
            ticks_per_mm,
            backlash_ticks: round_ticks(backlash_ticks),
            stall_current_ma,
            pitch_ticks,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Uncalibrated profile: nominal scale, no backlash compensation.
    pub fn nominal(ticks_per_mm: f32) -> Self {
        let mut pitch_ticks = [0; PITCHES_MM.len()];
        for (slot, mm) in pitch_ticks.iter_mut().zip(PITCHES_MM) {
            *slot = round_ticks(mm as f32 * ticks_per_mm);
        }
        Self {
            ticks_per_mm,
            backlash_ticks: 0,
            stall_current_ma: 0,
            pitch_ticks,
        }
    }

    /// Reject profiles that would drive the mechanism nonsensically.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if !self.ticks_per_mm.is_finite() || self.ticks_per_mm <= 0.0 {
            return Err(CalibrationError::InvalidProfile("ticks per mm must be positive"));
        }
        if self.pitch_ticks.contains(&0) {
            return Err(CalibrationError::InvalidProfile("empty pitch table entry"));
        }
        Ok(())
    }

    /// Ticks for a distance in tenths of a millimetre.
    pub fn ticks_for_tenths(&self, tenths: u16) -> u32 {
        round_ticks(tenths as f32 * self.ticks_per_mm / 10.0)
    }

    /// Ticks for one tape pitch, if the pitch is in the table.
    pub fn ticks_for_pitch(&self, pitch_mm: u8) -> Option<u32> {
        PITCHES_MM
            .iter()
            .position(|&p| p == pitch_mm)
            .map(|i| self.pitch_ticks[i])
    }
}

#[cfg(feature = "serde-json-core")]
impl CalibrationProfile {
    /// Encode as JSON for a key-value store.
    pub fn to_json<const N: usize>(&self) -> Result<heapless::String<N>, serde_json_core::ser::Error> {
        serde_json_core::to_string(self)
    }

    /// Decode JSON written by [`to_json`](Self::to_json). The result still
    /// needs [`validate`](Self::validate).
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json_core::de::Error> {
        serde_json_core::from_slice(bytes).map(|(profile, _)| profile)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Where a calibration run is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationPhase {
    /// Not running.
    Idle,
    /// Phase 1.
    SeekReverse,
    /// Phase 2.
    SeekForward,
    /// Phase 3.
    BackoffReverse,
    /// Phase 4.
    ReapproachForward,
}

/// A guided move the state machine should publish.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoveSpec {
    /// Absolute target.
    pub target_ticks: i32,
    /// Drive mode.
    pub mode: DriveMode,
    /// Deadline in control periods.
    pub deadline_periods: u32,
}

/// What to do after a report.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CalibrationStep {
    /// Publish the next guided move.
    Move(MoveSpec),
    /// Run finished with a validated profile.
    Done(CalibrationProfile),
    /// Run failed; the previous profile stays in force.
    Failed(CalibrationError),
}

/// Sequences the four calibration moves.
#[derive(Clone, Debug)]
pub struct CalibrationEngine {
    config: CalibrationConfig,
    deadline_periods: u32,
    phase: CalibrationPhase,
    stop_a: i32,
    stall_current_ma: u32,
    ticks_per_mm: f32,
    cruise_velocity: f32,
}

impl CalibrationEngine {
    /// Engine for the given settings; `deadline_periods` bounds each move.
    pub fn new(config: &CalibrationConfig, deadline_periods: u32) -> Self {
        Self {
            config: config.clone(),
            deadline_periods,
            phase: CalibrationPhase::Idle,
            stop_a: 0,
            stall_current_ma: 0,
            ticks_per_mm: 0.0,
            cruise_velocity: 0.0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    /// True between [`start`](Self::start) and the final step.
    pub fn is_running(&self) -> bool {
        self.phase != CalibrationPhase::Idle
    }

    /// Forget a run in progress.
    pub fn cancel(&mut self) {
        self.phase = CalibrationPhase::Idle;
    }

    fn seek(&self, target_ticks: i32) -> MoveSpec {
        MoveSpec {
            target_ticks,
            mode: DriveMode::ConstantDuty(self.config.seek_duty),
            deadline_periods: self.deadline_periods,
        }
    }

    fn travel(&self) -> i32 {
        self.config.max_travel_ticks.min(i32::MAX as u32) as i32
    }

    /// Begin a run from `position`; returns the first move.
    pub fn start(&mut self, position: i32) -> MoveSpec {
        self.phase = CalibrationPhase::SeekReverse;
        self.stall_current_ma = 0;
        info!(position, "calibration started");
        self.seek(position.wrapping_sub(self.travel()))
    }

    fn fail(&mut self, err: CalibrationError) -> CalibrationStep {
        debug!(phase = ?self.phase, error = %err, "calibration failed");
        self.phase = CalibrationPhase::Idle;
        CalibrationStep::Failed(err)
    }

    /// Advance on the report of the move last returned.
    pub fn on_report(&mut self, report: &MoveReport) -> CalibrationStep {
        let stalled = matches!(
            report.outcome,
            MoveOutcome::Faulted {
                code: FaultCode::MotionStall,
                ..
            }
        );
        match (self.phase, report.outcome) {
            (CalibrationPhase::Idle, _) => {
                CalibrationStep::Failed(CalibrationError::InvalidProfile("no calibration running"))
            }
            (_, MoveOutcome::Aborted) => self.fail(CalibrationError::Aborted(FaultCode::EmergencyStop)),

            (CalibrationPhase::SeekReverse | CalibrationPhase::SeekForward, _) if stalled => {
                self.stall_current_ma = self.stall_current_ma.max(report.peak_current_ma);
                if self.phase == CalibrationPhase::SeekReverse {
                    self.stop_a = report.position;
                    self.phase = CalibrationPhase::SeekForward;
                    debug!(stop = report.position, "reverse stop found");
                    return CalibrationStep::Move(self.seek(report.position.wrapping_add(self.travel())));
                }
                let travel = report.position.wrapping_sub(self.stop_a);
                if travel <= 0 {
                    return self.fail(CalibrationError::InvalidProfile("no travel between stops"));
                }
                self.ticks_per_mm = travel as f32 / self.config.reference_travel_mm;
                self.phase = CalibrationPhase::BackoffReverse;
                debug!(stop = report.position, travel, ticks_per_mm = self.ticks_per_mm, "forward stop found");
                let probe = self.config.backlash_probe_ticks.min(i32::MAX as u32) as i32;
                CalibrationStep::Move(self.seek(report.position.wrapping_sub(probe)))
            }
            (
                CalibrationPhase::SeekReverse | CalibrationPhase::SeekForward,
                MoveOutcome::Complete
                | MoveOutcome::Faulted {
                    code: FaultCode::MotionTimeout,
                    ..
                },
            ) => self.fail(CalibrationError::NoStopFound),

            (CalibrationPhase::BackoffReverse, MoveOutcome::Complete) => {
                self.cruise_velocity = report.cruise_velocity;
                self.phase = CalibrationPhase::ReapproachForward;
                debug!(velocity = self.cruise_velocity, "cruise velocity measured");
                let half = (self.config.backlash_probe_ticks / 2).min(i32::MAX as u32) as i32;
                CalibrationStep::Move(self.seek(report.position.wrapping_add(half)))
            }
            (CalibrationPhase::ReapproachForward, MoveOutcome::Complete) => {
                // the first period of motion is only visible one sample later
                let dead = report.startup_periods.saturating_sub(1);
                let backlash = dead as f32 * self.cruise_velocity;
                self.phase = CalibrationPhase::Idle;
                match CalibrationProfile::from_measurements(
                    self.ticks_per_mm,
                    backlash,
                    self.stall_current_ma,
                ) {
                    Ok(profile) => {
                        info!(
                            ticks_per_mm = profile.ticks_per_mm,
                            backlash = profile.backlash_ticks,
                            stall_current_ma = profile.stall_current_ma,
                            "calibration complete"
                        );
                        CalibrationStep::Done(profile)
                    }
                    Err(e) => self.fail(e),
                }
            }
            (_, MoveOutcome::Faulted { code, .. }) => self.fail(CalibrationError::Aborted(code)),
            (_, MoveOutcome::Complete) => self.fail(CalibrationError::InvalidProfile("unexpected move result")),
        }
    }
}
