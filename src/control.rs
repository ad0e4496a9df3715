//! Fixed-period position control loop.
//!
//! [`ControlLoop::tick`] runs from a timer interrupt at the configured
//! period. It never blocks, never allocates and never logs. Everything it
//! exchanges with the lower-priority processing context goes through
//! [`ControlShared`]:
//!
//! - the next [`ControlTarget`] (published whole inside a critical section,
//!   so a tick never sees a half-written target)
//! - the [`MoveReport`] for a finished move
//! - lock-free e-stop and abort flags, checked first every tick
//! - telemetry (current, temperature, enable-sense mismatch) and a latched
//!   safety alarm for faults seen while no move is active
//! - versioned [`DriveSettings`] for the bridge mapping and the peel motor
//! - the direction of the running segment, for the peel motor
//!
//! # Tick order
//!
//! 0. apply changed drive settings to the motor driver
//! 1. e-stop flag: zero and disable the drive, drop any move
//! 2. abort flag: zero the drive, report the move as aborted
//! 3. pick up a newly published target (PID reset)
//! 4. sample the encoder through the glitch filter
//! 5. interlock and electrical fault checks
//! 6. compute the drive (PID or constant duty)
//! 7. completion, stall and deadline checks
//! 8. apply the drive

use core::cell::Cell;

use critical_section::Mutex;
use portable_atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};

use crate::config::ControlConfig;
use crate::encoder::EncoderCounter;
use crate::error::FaultCode;
use crate::motor::PwmMapping;
use crate::peel::PeelSettings;
use crate::perf::PerformanceMonitor;
use crate::pid::{Pid, PidGains};
use crate::traits::{Direction, FaultDetector, FaultLimits, MotorCommand, MotorDriver};

/// How the loop drives toward a target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DriveMode {
    /// Closed-loop PID.
    Servo,
    /// Fixed duty toward the target. Always counts as pinned for stall
    /// detection; used by calibration to find hard stops.
    ConstantDuty(f32),
}

/// Parameter snapshot a move runs with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlParams {
    /// PID gains.
    pub gains: PidGains,
    /// Period in seconds.
    pub dt: f32,
    /// Output clamp.
    pub max_duty: f32,
    /// Minimum drive outside the dead-band.
    pub min_duty: f32,
    /// Holding duty after arrival.
    pub hold_duty: f32,
    /// Error treated as arrived.
    pub deadband_ticks: u32,
    /// Completion tolerance.
    pub tolerance_ticks: u32,
    /// In-tolerance periods for completion.
    pub settle_periods: u16,
    /// Pinned periods without motion before a stall.
    pub stall_periods: u32,
    /// Motion at or below this counts as none.
    pub stall_window_ticks: u32,
    /// Per-period jump treated as a glitch.
    pub glitch_ticks: u32,
    /// Electrical limits.
    pub limits: FaultLimits,
}

impl ControlParams {
    /// Snapshot from configuration.
    pub fn from_config(c: &ControlConfig) -> Self {
        Self {
            gains: PidGains {
                kp: c.kp,
                ki: c.ki,
                kd: c.kd,
                derivative_alpha: c.derivative_alpha,
            },
            dt: c.period_us as f32 / 1_000_000.0,
            max_duty: c.max_duty,
            min_duty: c.min_duty,
            hold_duty: c.hold_duty,
            deadband_ticks: c.deadband_ticks,
            tolerance_ticks: c.tolerance_ticks,
            settle_periods: c.settle_periods,
            stall_periods: c.stall_periods(),
            stall_window_ticks: c.stall_window_ticks,
            glitch_ticks: c.glitch_ticks,
            limits: FaultLimits {
                overcurrent_ma: c.overcurrent_ma,
                critical_current_ma: c.critical_current_ma,
                overtemp_c: c.overtemp_c,
                critical_temp_c: c.critical_temp_c,
            },
        }
    }
}

/// One single-segment move, immutable once published.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlTarget {
    /// Tag echoed in the report; stale reports are ignored by generation.
    pub generation: u32,
    /// Absolute target position.
    pub target_ticks: i32,
    /// Setpoint ramp limit in ticks per period.
    pub velocity_cap: Option<u32>,
    /// Periods before [`FaultCode::MotionTimeout`].
    pub deadline_periods: u32,
    /// Drive mode.
    pub mode: DriveMode,
    /// Parameters for this move.
    pub params: ControlParams,
    /// Run the peel motor alongside this segment.
    pub peel: bool,
}

/// Bridge options, applied by the tick side on the next period.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DriveSettings {
    /// Drive bridge mapping.
    pub drive: PwmMapping,
    /// Peel motor options.
    pub peel: PeelSettings,
}

const MOTION_NONE: u8 = 0;
const MOTION_FORWARD: u8 = 1;
const MOTION_REVERSE: u8 = 2;

/// How a move ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Within tolerance for the settle count.
    Complete,
    /// Terminated by a fault.
    Faulted {
        /// What happened.
        code: FaultCode,
        /// Escalates to e-stop.
        critical: bool,
    },
    /// Cancelled by abort or e-stop.
    Aborted,
}

/// Result of a finished move.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoveReport {
    /// Generation of the target.
    pub generation: u32,
    /// Outcome.
    pub outcome: MoveOutcome,
    /// Filtered position at the end.
    pub position: i32,
    /// Periods the move ran.
    pub elapsed_periods: u32,
    /// Periods before the encoder first left the stall window.
    /// Equal to `elapsed_periods` if it never did.
    pub startup_periods: u32,
    /// Mean speed once moving, ticks per period.
    pub cruise_velocity: f32,
    /// Highest current seen during the move.
    pub peak_current_ma: u32,
}

/// State shared between the control tick and the processing context.
pub struct ControlShared {
    target: Mutex<Cell<Option<ControlTarget>>>,
    report: Mutex<Cell<Option<MoveReport>>>,
    estop: AtomicBool,
    abort: AtomicBool,
    busy: AtomicBool,
    alarm: AtomicU8,
    current_ma: AtomicU32,
    temperature_c: AtomicI32,
    enable_mismatch: AtomicBool,
    drive: Mutex<Cell<(u32, Option<DriveSettings>)>>,
    motion: AtomicU8,
}

impl Default for ControlShared {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlShared {
    /// Empty slots, flags clear.
    pub const fn new() -> Self {
        Self {
            target: Mutex::new(Cell::new(None)),
            report: Mutex::new(Cell::new(None)),
            estop: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            alarm: AtomicU8::new(0),
            current_ma: AtomicU32::new(0),
            temperature_c: AtomicI32::new(i32::MIN),
            enable_mismatch: AtomicBool::new(false),
            drive: Mutex::new(Cell::new((0, None))),
            motion: AtomicU8::new(MOTION_NONE),
        }
    }

    /// Install the next target. Replaces an unconsumed one.
    pub fn publish(&self, target: ControlTarget) {
        critical_section::with(|cs| self.target.borrow(cs).set(Some(target)));
    }

    fn take_target(&self) -> Option<ControlTarget> {
        critical_section::with(|cs| self.target.borrow(cs).take())
    }

    fn post_report(&self, report: MoveReport) {
        critical_section::with(|cs| self.report.borrow(cs).set(Some(report)));
    }

    /// Collect the report of a finished move.
    pub fn take_report(&self) -> Option<MoveReport> {
        critical_section::with(|cs| self.report.borrow(cs).take())
    }

    /// Force the drive off from the next tick on.
    pub fn engage_estop(&self) {
        self.estop.store(true, Ordering::Release);
    }

    /// Allow driving again.
    pub fn release_estop(&self) {
        self.estop.store(false, Ordering::Release);
    }

    /// True while the e-stop flag is set.
    pub fn estop_engaged(&self) -> bool {
        self.estop.load(Ordering::Acquire)
    }

    /// Cancel the active move and drop any pending target.
    pub fn abort(&self) {
        critical_section::with(|cs| self.target.borrow(cs).set(None));
        self.abort.store(true, Ordering::Release);
    }

    /// True while a move is being executed.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Collect a safety fault seen while idle.
    pub fn take_alarm(&self) -> Option<FaultCode> {
        FaultCode::from_u8(self.alarm.swap(0, Ordering::AcqRel))
    }

    fn raise_alarm(&self, code: FaultCode) {
        self.alarm.store(code as u8, Ordering::Release);
    }

    /// Latest motor current.
    pub fn current_ma(&self) -> Option<u32> {
        Some(self.current_ma.load(Ordering::Relaxed)).filter(|c| *c != u32::MAX)
    }

    /// Latest driver temperature.
    pub fn temperature_c(&self) -> Option<i32> {
        Some(self.temperature_c.load(Ordering::Relaxed)).filter(|t| *t != i32::MIN)
    }

    /// True if the enable sense disagreed with the command last tick.
    pub fn enable_mismatch(&self) -> bool {
        self.enable_mismatch.load(Ordering::Relaxed)
    }

    /// Replace the drive settings. Each call bumps the version.
    pub fn configure_drive(&self, settings: DriveSettings) {
        critical_section::with(|cs| {
            let slot = self.drive.borrow(cs);
            let (version, _) = slot.get();
            slot.set((version.wrapping_add(1), Some(settings)));
        });
    }

    /// Latest drive settings with their version, once any were published.
    pub fn drive_settings(&self) -> Option<(u32, DriveSettings)> {
        let (version, settings) = critical_section::with(|cs| self.drive.borrow(cs).get());
        settings.map(|s| (version, s))
    }

    /// Direction of the running segment if it wants the peel motor.
    pub fn peel_direction(&self) -> Option<Direction> {
        match self.motion.load(Ordering::Acquire) {
            MOTION_FORWARD => Some(Direction::Forward),
            MOTION_REVERSE => Some(Direction::Reverse),
            _ => None,
        }
    }
}

/// Rejects single-sample position jumps larger than physically possible.
///
/// A jump is held for one period; if the next sample agrees with it the
/// jump was real and is accepted.
#[derive(Clone, Copy, Debug, Default)]
struct GlitchFilter {
    accepted: i32,
    suspect: Option<i32>,
}

impl GlitchFilter {
    fn resync(&mut self, raw: i32) {
        self.accepted = raw;
        self.suspect = None;
    }

    fn filter(&mut self, raw: i32, bound: u32) -> (i32, bool) {
        if raw.wrapping_sub(self.accepted).unsigned_abs() <= bound {
            self.resync(raw);
            return (raw, false);
        }
        match self.suspect {
            Some(prev) if raw.wrapping_sub(prev).unsigned_abs() <= bound => {
                self.resync(raw);
                (raw, false)
            }
            _ => {
                self.suspect = Some(raw);
                (self.accepted, true)
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ActiveMove {
    target: ControlTarget,
    start: i32,
    elapsed: u32,
    in_tolerance: u16,
    anchor: i32,
    pinned_periods: u32,
    startup: Option<u32>,
    peak_current_ma: u32,
}

/// The periodic controller. Owns the drive and the sensors.
pub struct ControlLoop<'a, M: MotorDriver, F: FaultDetector> {
    shared: &'a ControlShared,
    encoder: &'a EncoderCounter,
    perf: &'a PerformanceMonitor,
    motor: M,
    sensors: F,
    period_us: u32,
    idle_params: ControlParams,
    pid: Pid,
    filter: GlitchFilter,
    active: Option<ActiveMove>,
    hold: Option<(i32, ControlParams)>,
    driver_enabled: bool,
    mismatch_periods: u8,
    estopped: bool,
    last_tick_us: Option<u64>,
    drive_version: u32,
}

#[inline]
fn abs_f(x: f32) -> f32 {
    if x < 0.0 {
        -x
    } else {
        x
    }
}

impl<'a, M: MotorDriver, F: FaultDetector> ControlLoop<'a, M, F> {
    /// Build the loop; the drive starts disabled.
    pub fn new(
        config: &ControlConfig,
        shared: &'a ControlShared,
        encoder: &'a EncoderCounter,
        perf: &'a PerformanceMonitor,
        motor: M,
        sensors: F,
    ) -> Self {
        let params = ControlParams::from_config(config);
        let mut filter = GlitchFilter::default();
        filter.resync(encoder.position());
        let mut this = Self {
            shared,
            encoder,
            perf,
            motor,
            sensors,
            period_us: config.period_us,
            idle_params: params,
            pid: Pid::new(params.gains, params.max_duty),
            filter,
            active: None,
            hold: None,
            driver_enabled: false,
            mismatch_periods: 0,
            estopped: false,
            last_tick_us: None,
            drive_version: 0,
        };
        this.release_drive();
        this
    }

    /// Borrow the motor driver.
    pub fn motor(&self) -> &M {
        &self.motor
    }

    /// Mutably borrow the motor driver.
    pub fn motor_mut(&mut self) -> &mut M {
        &mut self.motor
    }

    /// Mutably borrow the sensors.
    pub fn sensors_mut(&mut self) -> &mut F {
        &mut self.sensors
    }

    /// Filtered position as of the last tick.
    pub fn position(&self) -> i32 {
        self.filter.accepted
    }

    /// True while a move is active.
    pub fn is_moving(&self) -> bool {
        self.active.is_some()
    }

    /// Target of the active move.
    pub fn target(&self) -> Option<&ControlTarget> {
        self.active.as_ref().map(|m| &m.target)
    }

    /// Current integral contribution of the PID.
    pub fn integral_term(&self) -> f32 {
        self.pid.integral_term()
    }

    /// One control period.
    pub fn tick(&mut self, now_us: u64) {
        if let Some(last) = self.last_tick_us {
            let interval = now_us.saturating_sub(last).min(u32::MAX as u64) as u32;
            self.perf.record_tick(interval, self.period_us);
        }
        self.last_tick_us = Some(now_us);

        if let Some((version, settings)) = self.shared.drive_settings() {
            if version != self.drive_version {
                self.drive_version = version;
                self.motor.configure(settings.drive);
            }
        }

        if self.shared.estop_engaged() {
            if !self.estopped {
                self.estopped = true;
                self.release_drive();
                self.hold = None;
                if let Some(m) = self.active.take() {
                    self.report(&m, MoveOutcome::Aborted);
                }
            }
            // Nothing may arm a move until the flag is released.
            let _ = self.shared.take_target();
            self.sample_and_check_idle();
            return;
        }
        self.estopped = false;

        if self.shared.abort.swap(false, Ordering::AcqRel) {
            self.release_drive();
            self.hold = None;
            if let Some(m) = self.active.take() {
                self.report(&m, MoveOutcome::Aborted);
            }
        }

        if let Some(target) = self.shared.take_target() {
            self.begin(target);
        }

        match self.active.take() {
            Some(mut m) => {
                let pos = self.sample(m.target.params.glitch_ticks);
                let params = m.target.params;
                let outcome = match self.check_safety(&mut m, &params) {
                    Some(outcome) => Some(outcome),
                    None => self.step(&mut m, pos),
                };
                match outcome {
                    Some(outcome) => self.finish(m, outcome),
                    None => self.active = Some(m),
                }
            }
            None => {
                let pos = self.sample_and_check_idle();
                if let Some((target, params)) = self.hold {
                    self.hold_step(target, pos, &params);
                }
            }
        }
    }

    fn sample(&mut self, glitch_ticks: u32) -> i32 {
        let (pos, glitch) = self.filter.filter(self.encoder.position(), glitch_ticks);
        if glitch {
            self.perf.record_glitch();
        }
        pos
    }

    fn read_sensors(&mut self) -> (bool, Option<u32>) {
        let current = self.sensors.current_ma();
        let temp = self.sensors.temperature_c();
        self.shared
            .current_ma
            .store(current.unwrap_or(u32::MAX), Ordering::Relaxed);
        self.shared
            .temperature_c
            .store(temp.unwrap_or(i32::MIN), Ordering::Relaxed);

        let mismatch = self.motor.enable_sensed() != self.driver_enabled;
        self.mismatch_periods = if mismatch {
            self.mismatch_periods.saturating_add(1)
        } else {
            0
        };
        // one period of grace for the enable line to settle
        let interlock = self.mismatch_periods >= 2;
        self.shared
            .enable_mismatch
            .store(interlock, Ordering::Relaxed);
        (interlock, current)
    }

    fn sample_and_check_idle(&mut self) -> i32 {
        let pos = self.sample(self.idle_params.glitch_ticks);
        let (interlock, _) = self.read_sensors();
        if self.estopped {
            return pos;
        }
        if interlock {
            self.release_drive();
            self.hold = None;
            self.shared.raise_alarm(FaultCode::SafetyInterlock);
        } else if let Some(fault) = self.sensors.active_fault(&self.idle_params.limits) {
            if fault.critical {
                self.release_drive();
                self.hold = None;
                self.shared.raise_alarm(fault.code);
            }
        }
        pos
    }

    fn check_safety(&mut self, m: &mut ActiveMove, params: &ControlParams) -> Option<MoveOutcome> {
        let (interlock, current) = self.read_sensors();
        if let Some(c) = current {
            m.peak_current_ma = m.peak_current_ma.max(c);
        }
        if interlock {
            return Some(MoveOutcome::Faulted {
                code: FaultCode::SafetyInterlock,
                critical: true,
            });
        }
        self.sensors
            .active_fault(&params.limits)
            .map(|f| MoveOutcome::Faulted {
                code: f.code,
                critical: f.critical,
            })
    }

    fn begin(&mut self, target: ControlTarget) {
        if let Some(m) = self.active.take() {
            self.report(&m, MoveOutcome::Aborted);
        }
        self.hold = None;
        self.idle_params = target.params;
        self.pid
            .reconfigure(target.params.gains, target.params.max_duty);
        let start = self.filter.accepted;
        self.active = Some(ActiveMove {
            target,
            start,
            elapsed: 0,
            in_tolerance: 0,
            anchor: start,
            pinned_periods: 0,
            startup: None,
            peak_current_ma: 0,
        });
        self.shared.busy.store(true, Ordering::Release);
        let motion = match (target.peel, target.target_ticks.wrapping_sub(start) < 0) {
            (false, _) => MOTION_NONE,
            (true, false) => MOTION_FORWARD,
            (true, true) => MOTION_REVERSE,
        };
        self.shared.motion.store(motion, Ordering::Release);
        // a failed enable shows up as a sense mismatch
        let _ = self.motor.set_enabled(true);
        self.driver_enabled = true;
    }

    fn step(&mut self, m: &mut ActiveMove, pos: i32) -> Option<MoveOutcome> {
        let p = m.target.params;
        m.elapsed += 1;

        if m.startup.is_none() && pos.wrapping_sub(m.start).unsigned_abs() > p.stall_window_ticks {
            m.startup = Some(m.elapsed);
        }

        let final_error = m.target.target_ticks.wrapping_sub(pos);
        if final_error.unsigned_abs() <= p.tolerance_ticks {
            m.in_tolerance = m.in_tolerance.saturating_add(1);
            if m.in_tolerance >= p.settle_periods {
                return Some(MoveOutcome::Complete);
            }
        } else {
            m.in_tolerance = 0;
        }

        let setpoint = match m.target.velocity_cap {
            Some(cap) if cap > 0 => {
                let span = m.target.target_ticks.wrapping_sub(m.start);
                let reach = (m.elapsed as i64 * cap as i64).min(span.unsigned_abs() as i64) as i32;
                m.start.wrapping_add(reach * span.signum())
            }
            _ => m.target.target_ticks,
        };
        let error = setpoint.wrapping_sub(pos);

        let (output, pinned) = if error.unsigned_abs() <= p.deadband_ticks {
            (0.0, false)
        } else {
            match m.target.mode {
                DriveMode::Servo => {
                    let u = self.pid.update(error as f32, p.dt);
                    let pinned = abs_f(u) >= p.max_duty || self.pid.windup_active();
                    let u = if abs_f(u) < p.min_duty {
                        p.min_duty * error.signum() as f32
                    } else {
                        u
                    };
                    (u, pinned)
                }
                DriveMode::ConstantDuty(duty) => (duty * error.signum() as f32, true),
            }
        };

        if pinned && pos.wrapping_sub(m.anchor).unsigned_abs() <= p.stall_window_ticks {
            m.pinned_periods += 1;
            if m.pinned_periods >= p.stall_periods {
                return Some(MoveOutcome::Faulted {
                    code: FaultCode::MotionStall,
                    critical: false,
                });
            }
        } else {
            m.anchor = pos;
            m.pinned_periods = 0;
        }

        if m.elapsed >= m.target.deadline_periods {
            return Some(MoveOutcome::Faulted {
                code: FaultCode::MotionTimeout,
                critical: false,
            });
        }

        if self
            .motor
            .apply(MotorCommand::from_signed(output, p.max_duty))
            .is_err()
        {
            return Some(MoveOutcome::Faulted {
                code: FaultCode::SafetyInterlock,
                critical: true,
            });
        }
        None
    }

    fn hold_step(&mut self, target: i32, pos: i32, params: &ControlParams) {
        let error = target.wrapping_sub(pos);
        let output = if error.unsigned_abs() <= params.deadband_ticks {
            0.0
        } else {
            params.gains.kp * error as f32
        };
        if self
            .motor
            .apply(MotorCommand::from_signed(output, params.hold_duty))
            .is_err()
        {
            self.hold = None;
            self.release_drive();
        }
    }

    fn finish(&mut self, m: ActiveMove, outcome: MoveOutcome) {
        let p = m.target.params;
        if outcome == MoveOutcome::Complete
            && p.hold_duty > 0.0
            && m.target.mode == DriveMode::Servo
        {
            let _ = self.motor.stop();
            self.hold = Some((m.target.target_ticks, p));
        } else {
            self.release_drive();
        }
        self.report(&m, outcome);
    }

    fn report(&mut self, m: &ActiveMove, outcome: MoveOutcome) {
        let position = self.filter.accepted;
        let startup = m.startup.unwrap_or(m.elapsed);
        let moving = m.elapsed.saturating_sub(startup);
        let cruise_velocity = if moving == 0 {
            0.0
        } else {
            position.wrapping_sub(m.start).unsigned_abs() as f32 / moving as f32
        };
        self.shared.post_report(MoveReport {
            generation: m.target.generation,
            outcome,
            position,
            elapsed_periods: m.elapsed,
            startup_periods: startup,
            cruise_velocity,
            peak_current_ma: m.peak_current_ma,
        });
        self.pid.reset();
        self.shared.motion.store(MOTION_NONE, Ordering::Release);
        self.shared.busy.store(false, Ordering::Release);
    }

    fn release_drive(&mut self) {
        let _ = self.motor.stop();
        let _ = self.motor.set_enabled(false);
        self.driver_enabled = false;
        self.mismatch_periods = 0;
    }
}
