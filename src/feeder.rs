//! Feeder-level state machine.
//!
//! [`FeederStateMachine`] is the single writer of [`FeederState`] and the
//! only component that publishes [`ControlTarget`]s. It runs in the
//! processing context: commands come in from the bus or the buttons, move
//! reports and safety alarms come in from the control tick via
//! [`ControlShared`], and every change of lifecycle is pushed to the
//! [`StatusIndicator`].
//!
//! # Lifecycle
//!
//! ```text
//!            move              final segment complete
//!   IDLE ───────────► MOVING ─────────────────────────► IDLE
//!    │                  │ stall / overcurrent / timeout
//!    │ calibrate        ▼
//!    └────► CALIBRATING ──► FAULT ──clear-fault (re-validated)──► IDLE
//!
//!   any ──emergency-stop / critical fault──► ESTOP ──arm + confirm──► IDLE
//! ```
//!
//! Long operations (moves, calibration, the clear-fault probe) reply
//! `InProgress` at once; the host polls move-status or query-status.
//!
//! # Enrollment
//!
//! A feeder is `initialized` once the host has sent initialize-feeder with
//! its uuid. Until then it answers uninitialized-feeders-respond, and with
//! `device.require_init` set it refuses bus moves with
//! `UninitializedFeeder`. Requests that carry someone else's uuid (address
//! lookup, identify, program-feeder-floor) get no reply at all, so a
//! broadcast is answered only by the feeder it names.

use heapless::Vec;
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationEngine, CalibrationProfile, CalibrationStep, MoveSpec};
use crate::commands::{ButtonEvent, CommandReply, FeederCommand, FeederUuid, MoveAmount, MoveRequest};
use crate::config::{ms_to_periods, FeederConfig, SettingKey, SettingValue};
use crate::control::{
    ControlParams, ControlShared, ControlTarget, DriveMode, DriveSettings, MoveOutcome, MoveReport,
};
use crate::encoder::EncoderCounter;
use crate::error::{FaultCode, Severity};
use crate::peel::PeelSettings;
use crate::perf::PerformanceMonitor;
use crate::protocol::dispatch::{decode_command, encode_reply, error_fault, error_reply, performance_payload};
use crate::protocol::{Opcode, PhotonLink, ProtocolFrame, ResultCode, PROTOCOL_VERSION};
use crate::traits::{CalibrationStore, Direction, FaultLimits, HalfDuplexBus, StatusIndicator};

// ============================================================================
// State
// ============================================================================

/// Top-level feeder state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum LifecycleState {
    /// Ready for commands.
    #[default]
    Idle = 0,
    /// Executing a move plan.
    Moving = 1,
    /// Running the calibration procedure.
    Calibrating = 2,
    /// Stopped by a fault; needs clear-fault.
    Fault = 3,
    /// Emergency stop; needs the reset handshake.
    Estop = 4,
}

impl LifecycleState {
    /// Upper-case name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "IDLE",
            LifecycleState::Moving => "MOVING",
            LifecycleState::Calibrating => "CALIBRATING",
            LifecycleState::Fault => "FAULT",
            LifecycleState::Estop => "ESTOP",
        }
    }
}

/// Snapshot reported by query-status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FeederState {
    /// Lifecycle state.
    pub lifecycle: LifecycleState,
    /// Active fault.
    pub fault: Option<FaultCode>,
    /// Opcode of the last state-changing command.
    pub last_command: Option<Opcode>,
    /// Its result, updated when a long operation finishes.
    pub last_result: ResultCode,
    /// Encoder position.
    pub position: i32,
    /// True once a valid profile is in force.
    pub calibrated: bool,
}

impl FeederState {
    /// Wire layout: state, fault, last opcode, last result, position
    /// (i32 BE), calibrated.
    pub fn status_payload(&self) -> [u8; 9] {
        let p = self.position.to_be_bytes();
        [
            self.lifecycle as u8,
            self.fault.map_or(0, |f| f as u8),
            self.last_command.map_or(0, |o| o as u8),
            self.last_result as u8,
            p[0],
            p[1],
            p[2],
            p[3],
            self.calibrated as u8,
        ]
    }
}

/// Absolute targets run back to back.
type Segments = Vec<i32, 2>;

#[derive(Clone, Debug)]
enum Activity {
    None,
    Move {
        segments: Segments,
        next: usize,
        started_us: u64,
    },
    Calibration,
    Probe {
        segments: Segments,
        next: usize,
    },
}

#[derive(Clone, Copy, Debug)]
struct EstopReset {
    challenge: u16,
    deadline_us: u64,
}

fn version_byte(s: &str) -> u8 {
    s.parse().unwrap_or(0)
}

// ============================================================================
// State machine
// ============================================================================

/// Coordinates moves, calibration and faults for one feeder.
pub struct FeederStateMachine<'a, S: CalibrationStore, I: StatusIndicator> {
    config: FeederConfig,
    shared: &'a ControlShared,
    encoder: &'a EncoderCounter,
    perf: &'a PerformanceMonitor,
    store: S,
    indicator: I,
    state: FeederState,
    profile: CalibrationProfile,
    engine: CalibrationEngine,
    activity: Activity,
    generation: u32,
    commanded: i32,
    move_result: ResultCode,
    estop_reset: Option<EstopReset>,
    rng: u32,
    bus_dirty: bool,
    initialized: bool,
    persist: Option<(SettingKey, SettingValue)>,
}

impl<'a, S: CalibrationStore, I: StatusIndicator> FeederStateMachine<'a, S, I> {
    /// Build the state machine and load the stored profile.
    pub fn new(
        config: FeederConfig,
        shared: &'a ControlShared,
        encoder: &'a EncoderCounter,
        perf: &'a PerformanceMonitor,
        mut store: S,
        mut indicator: I,
    ) -> Self {
        let nominal = CalibrationProfile::nominal(config.calibration.default_ticks_per_mm);
        let (profile, calibrated) = match store.load() {
            Ok(Some(p)) if p.validate().is_ok() => (p, true),
            Ok(Some(_)) => {
                warn!("stored calibration profile invalid, using nominal");
                (nominal, false)
            }
            Ok(None) => (nominal, false),
            Err(e) => {
                warn!(error = ?e, "calibration store unreadable, using nominal");
                (nominal, false)
            }
        };
        let seed = config
            .device
            .uuid
            .iter()
            .fold(0x9E37_79B9u32, |acc, b| acc.rotate_left(5) ^ *b as u32);
        let engine = CalibrationEngine::new(&config.calibration, 0);
        let position = encoder.position();
        indicator.show(LifecycleState::Idle, None);
        info!(
            address = config.bus.address,
            calibrated,
            ticks_per_mm = profile.ticks_per_mm,
            "feeder ready"
        );
        let this = Self {
            config,
            shared,
            encoder,
            perf,
            store,
            indicator,
            state: FeederState {
                position,
                calibrated,
                ..FeederState::default()
            },
            profile,
            engine,
            activity: Activity::None,
            generation: 0,
            commanded: position,
            move_result: ResultCode::Ok,
            estop_reset: None,
            rng: seed | 1,
            bus_dirty: false,
            initialized: false,
            persist: None,
        };
        this.push_drive_settings();
        this
    }

    /// Current state.
    pub fn state(&self) -> &FeederState {
        &self.state
    }

    /// Profile in force.
    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    /// Live configuration.
    pub fn config(&self) -> &FeederConfig {
        &self.config
    }

    /// Borrow the calibration store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Borrow the calibration store mutably, e.g. to persist settings.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Borrow the indicator.
    pub fn indicator(&self) -> &I {
        &self.indicator
    }

    /// Result of the most recent move, as move-status reports it.
    pub fn move_result(&self) -> ResultCode {
        self.move_result
    }

    /// True once the host has confirmed this feeder's uuid.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Setting changed over the bus that must survive a reboot.
    ///
    /// Only program-feeder-floor produces one; the caller writes it to the
    /// store behind its [`ConfigService`](crate::traits::ConfigService).
    pub fn take_setting_to_persist(&mut self) -> Option<(SettingKey, SettingValue)> {
        self.persist.take()
    }

    /// True while a move, calibration or clear-fault probe is in flight.
    pub fn is_busy(&self) -> bool {
        !matches!(self.activity, Activity::None)
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    /// Receive, dispatch and answer bus traffic, then run [`poll`](Self::poll)
    /// and send any replies that are due.
    pub fn service_bus<B: HalfDuplexBus>(
        &mut self,
        link: &mut PhotonLink<'_, B>,
        now_us: u64,
    ) -> Result<(), B::Error> {
        while let Some(rx) = link.poll_frame(now_us) {
            if let Some(reply) = self.handle_frame(&rx.frame, now_us) {
                link.queue_reply(reply, &rx);
            }
            if self.bus_dirty {
                link.reconfigure(&self.config.bus);
                self.bus_dirty = false;
            }
        }
        self.poll(now_us);
        link.service_tx(now_us).map(|_| ())
    }

    /// Answer one frame that passed address filtering.
    ///
    /// `None` means the request named another feeder's uuid and must go
    /// unanswered. Replies come from the address the request was sent to,
    /// even when the request changed it.
    pub fn handle_frame(&mut self, frame: &ProtocolFrame, now_us: u64) -> Option<ProtocolFrame> {
        let own = self.config.bus.address;
        match decode_command(frame) {
            Ok(FeederCommand::Move(_)) if self.config.device.require_init && !self.initialized => {
                debug!(packet_id = frame.packet_id, "move refused before initialization");
                let reply = CommandReply::with_data(
                    ResultCode::UninitializedFeeder,
                    &self.config.device.uuid,
                );
                Some(encode_reply(frame, &reply, own))
            }
            Ok(cmd) => self
                .respond(cmd, now_us)
                .map(|reply| encode_reply(frame, &reply, own)),
            Err(e) => {
                debug!(error = %e, packet_id = frame.packet_id, "undecodable request");
                if let Some(code) = error_fault(&e) {
                    self.perf.record_fault(code);
                }
                Some(error_reply(frame, &e, own))
            }
        }
    }

    /// Front-panel button press.
    pub fn handle_button(&mut self, event: ButtonEvent, now_us: u64) -> CommandReply {
        let cmd = event.to_command(self.config.motion.default_pitch_mm);
        self.handle_command(cmd, now_us)
    }

    /// Execute one command and produce its reply.
    ///
    /// A request for another feeder's uuid, which goes unanswered on the
    /// bus, yields `WrongFeederId` here.
    pub fn handle_command(&mut self, cmd: FeederCommand, now_us: u64) -> CommandReply {
        self.respond(cmd, now_us).unwrap_or_else(|| {
            CommandReply::with_data(ResultCode::WrongFeederId, &self.config.device.uuid)
        })
    }

    fn respond(&mut self, cmd: FeederCommand, now_us: u64) -> Option<CommandReply> {
        self.poll(now_us);
        let own = self.config.device.uuid;
        let reply = match cmd {
            FeederCommand::GetFeederId => CommandReply::ok_with(&self.config.device.uuid),
            FeederCommand::GetVersion => CommandReply::ok_with(&[
                PROTOCOL_VERSION,
                version_byte(env!("CARGO_PKG_VERSION_MAJOR")),
                version_byte(env!("CARGO_PKG_VERSION_MINOR")),
                version_byte(env!("CARGO_PKG_VERSION_PATCH")),
            ]),
            FeederCommand::MoveStatus => {
                let mut reply = CommandReply::result(self.move_result);
                let _ = reply.payload.push(self.state.fault.map_or(0, |f| f as u8));
                reply
            }
            FeederCommand::QueryStatus => CommandReply::ok_with(&self.state.status_payload()),
            FeederCommand::GetPerformance => {
                let mut reply = CommandReply::ok();
                reply.payload = performance_payload(&self.perf.snapshot());
                reply
            }
            FeederCommand::GetSetting(key) => {
                let (tag, bytes) = self.config.get(key).to_wire();
                let mut data = [0u8; 5];
                data[0] = tag;
                data[1..].copy_from_slice(&bytes);
                CommandReply::ok_with(&data)
            }
            FeederCommand::Move(req) => self.start_move(req, now_us),
            FeederCommand::StartCalibration => self.start_calibration(),
            FeederCommand::ClearFault => self.clear_fault(),
            FeederCommand::EmergencyStop => {
                self.enter_estop(FaultCode::EmergencyStop);
                CommandReply::ok()
            }
            FeederCommand::ResetEstopArm => self.arm_estop_reset(now_us),
            FeederCommand::ResetEstopConfirm { challenge } => {
                self.confirm_estop_reset(challenge, now_us)
            }
            FeederCommand::ResetPerformance => {
                self.perf.reset();
                CommandReply::ok()
            }
            FeederCommand::SetSetting(key, value) => self.set_setting(key, value),
            FeederCommand::InitializeFeeder { uuid } => self.initialize(uuid),
            FeederCommand::GetFeederAddress { uuid } if uuid == own => CommandReply::ok(),
            FeederCommand::IdentifyFeeder { uuid } if uuid == own => {
                info!("identify requested");
                self.indicator.identify();
                CommandReply::ok()
            }
            FeederCommand::ProgramFeederFloor { uuid, address } if uuid == own => {
                self.program_address(address)
            }
            FeederCommand::UninitializedFeedersRespond if !self.initialized => {
                CommandReply::ok_with(&own)
            }
            FeederCommand::GetFeederAddress { .. }
            | FeederCommand::IdentifyFeeder { .. }
            | FeederCommand::ProgramFeederFloor { .. }
            | FeederCommand::UninitializedFeedersRespond => return None,
        };

        if !matches!(
            cmd,
            FeederCommand::GetFeederId
                | FeederCommand::GetVersion
                | FeederCommand::MoveStatus
                | FeederCommand::QueryStatus
                | FeederCommand::GetPerformance
                | FeederCommand::GetSetting(_)
                | FeederCommand::GetFeederAddress { .. }
                | FeederCommand::IdentifyFeeder { .. }
                | FeederCommand::UninitializedFeedersRespond
        ) {
            self.state.last_command = Some(cmd.opcode());
            self.state.last_result = reply.result;
        }
        Some(reply)
    }

    /// Collect reports and alarms from the control tick.
    pub fn poll(&mut self, now_us: u64) {
        self.state.position = self.encoder.position();

        if let Some(code) = self.shared.take_alarm() {
            if self.state.lifecycle != LifecycleState::Estop {
                warn!(fault = %code, "safety alarm");
                self.enter_estop(code);
            }
        }

        if let Some(report) = self.shared.take_report() {
            if report.generation == self.generation {
                self.on_report(report, now_us);
            } else {
                debug!(generation = report.generation, "stale move report ignored");
            }
        }

        if self
            .estop_reset
            .is_some_and(|r| now_us > r.deadline_us)
        {
            debug!("e-stop reset window expired");
            self.estop_reset = None;
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn guard_idle(&self) -> Option<CommandReply> {
        match self.state.lifecycle {
            LifecycleState::Idle => None,
            LifecycleState::Estop => Some(CommandReply::result(ResultCode::EStopped)),
            LifecycleState::Fault => Some(CommandReply::result(ResultCode::Faulted)),
            LifecycleState::Moving | LifecycleState::Calibrating => {
                Some(CommandReply::result(ResultCode::Busy))
            }
        }
    }

    fn move_ticks(&self, req: &MoveRequest) -> Option<u32> {
        let max = self.config.motion.max_move_tenths;
        match req.amount {
            MoveAmount::Tenths(t) if t <= max => Some(self.profile.ticks_for_tenths(t)),
            MoveAmount::Pitch(mm) if mm as u16 * 10 <= max => self.profile.ticks_for_pitch(mm),
            _ => None,
        }
    }

    fn start_move(&mut self, req: MoveRequest, now_us: u64) -> CommandReply {
        if let Some(refused) = self.guard_idle() {
            return refused;
        }
        let Some(ticks) = self.move_ticks(&req) else {
            debug!(?req, "move rejected");
            return CommandReply::result(ResultCode::Rejected);
        };
        if ticks == 0 {
            self.move_result = ResultCode::Ok;
            return CommandReply::ok();
        }

        let ticks = ticks.min(i32::MAX as u32) as i32;
        let base = self.commanded;
        let mut segments = Segments::new();
        match req.direction {
            Direction::Forward => {
                let _ = segments.push(base.wrapping_add(ticks));
            }
            Direction::Reverse => {
                let target = base.wrapping_sub(ticks);
                let overshoot =
                    (self.profile.backlash_ticks + self.config.motion.approach_ticks) as i32;
                if overshoot > 0 {
                    let _ = segments.push(target.wrapping_sub(overshoot));
                }
                let _ = segments.push(target);
            }
        }

        info!(?req, ticks, from = base, "move started");
        self.publish_servo(segments[0], self.config.peel.enabled);
        self.activity = Activity::Move {
            segments,
            next: 1,
            started_us: now_us,
        };
        self.move_result = ResultCode::InProgress;
        self.set_lifecycle(LifecycleState::Moving, None);
        CommandReply::result(ResultCode::InProgress)
    }

    fn start_calibration(&mut self) -> CommandReply {
        if let Some(refused) = self.guard_idle() {
            return refused;
        }
        let deadline = ms_to_periods(
            self.config.calibration.timeout_ms,
            self.config.control.period_us,
        );
        self.engine = CalibrationEngine::new(&self.config.calibration, deadline);
        let spec = self.engine.start(self.encoder.position());
        self.publish(spec, false);
        self.activity = Activity::Calibration;
        self.set_lifecycle(LifecycleState::Calibrating, None);
        CommandReply::result(ResultCode::InProgress)
    }

    fn clear_fault(&mut self) -> CommandReply {
        match self.state.lifecycle {
            LifecycleState::Estop => return CommandReply::result(ResultCode::EStopped),
            LifecycleState::Fault => {}
            _ => return CommandReply::ok(),
        }
        let Some(fault) = self.state.fault else {
            self.set_lifecycle(LifecycleState::Idle, None);
            return CommandReply::ok();
        };
        if matches!(self.activity, Activity::Probe { .. }) {
            return CommandReply::result(ResultCode::Busy);
        }

        if fault.is_mechanical() {
            let pos = self.encoder.position();
            let probe = self.config.motion.probe_ticks.min(i32::MAX as u32) as i32;
            let mut segments = Segments::new();
            let _ = segments.push(pos.wrapping_add(probe));
            let _ = segments.push(pos);
            info!(fault = %fault, "probing before clearing fault");
            self.publish_servo(segments[0], false);
            self.activity = Activity::Probe { segments, next: 1 };
            return CommandReply::result(ResultCode::InProgress);
        }

        if fault.is_electrical() {
            let limits = self.limits();
            if !limits.within(self.shared.current_ma(), self.shared.temperature_c()) {
                debug!(fault = %fault, "fault still present");
                return CommandReply::result(ResultCode::Rejected);
            }
        }
        if fault == FaultCode::SafetyInterlock && self.shared.enable_mismatch() {
            return CommandReply::result(ResultCode::Rejected);
        }
        self.clear();
        CommandReply::ok()
    }

    fn arm_estop_reset(&mut self, now_us: u64) -> CommandReply {
        if self.state.lifecycle != LifecycleState::Estop {
            return CommandReply::result(ResultCode::Rejected);
        }
        let challenge = self.next_challenge(now_us);
        let window_us = self.config.motion.estop_reset_window_ms as u64 * 1000;
        self.estop_reset = Some(EstopReset {
            challenge,
            deadline_us: now_us + window_us,
        });
        debug!(challenge, "e-stop reset armed");
        CommandReply::ok_with(&challenge.to_be_bytes())
    }

    fn confirm_estop_reset(&mut self, challenge: u16, now_us: u64) -> CommandReply {
        if self.state.lifecycle != LifecycleState::Estop {
            return CommandReply::result(ResultCode::Rejected);
        }
        let Some(armed) = self.estop_reset.take() else {
            return CommandReply::result(ResultCode::Rejected);
        };
        if now_us > armed.deadline_us || challenge != armed.challenge {
            warn!("e-stop reset handshake failed");
            return CommandReply::result(ResultCode::Rejected);
        }
        let limits = self.limits();
        if self.shared.enable_mismatch()
            || !limits.within(self.shared.current_ma(), self.shared.temperature_c())
        {
            warn!("e-stop reset refused, safety checks failed");
            return CommandReply::result(ResultCode::Rejected);
        }
        self.shared.release_estop();
        info!("e-stop released");
        self.clear();
        CommandReply::ok()
    }

    fn initialize(&mut self, uuid: FeederUuid) -> CommandReply {
        if uuid != self.config.device.uuid {
            debug!("initialize-feeder for another uuid");
            return CommandReply::with_data(ResultCode::WrongFeederId, &self.config.device.uuid);
        }
        if !self.initialized {
            info!("initialized by host");
        }
        self.initialized = true;
        CommandReply::ok()
    }

    fn program_address(&mut self, address: u8) -> CommandReply {
        let value = SettingValue::Int(address as i32);
        match self.config.set(SettingKey::BusAddress, value) {
            Ok(()) => {
                info!(address, "bus address programmed");
                self.bus_dirty = true;
                self.persist = Some((SettingKey::BusAddress, value));
                CommandReply::ok()
            }
            Err(e) => {
                warn!(address, error = %e, "programmed address rejected");
                CommandReply::result(ResultCode::Rejected)
            }
        }
    }

    fn set_setting(&mut self, key: SettingKey, value: SettingValue) -> CommandReply {
        // the tick period is fixed by the timer set up at boot
        if key == SettingKey::ControlPeriodUs {
            return CommandReply::result(ResultCode::Rejected);
        }
        match self.config.set(key, value) {
            Ok(()) => {
                info!(setting = key.name(), ?value, "setting updated");
                if key.is_bus() {
                    self.bus_dirty = true;
                }
                if key.is_drive() {
                    self.push_drive_settings();
                }
                CommandReply::ok()
            }
            Err(e) => {
                warn!(setting = key.name(), error = %e, "setting rejected");
                CommandReply::result(ResultCode::Rejected)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------------

    fn on_report(&mut self, report: MoveReport, now_us: u64) {
        let activity = core::mem::replace(&mut self.activity, Activity::None);
        match activity {
            Activity::None => {}
            Activity::Move {
                segments,
                next,
                started_us,
            } => match report.outcome {
                MoveOutcome::Complete if next < segments.len() => {
                    self.publish_servo(segments[next], self.config.peel.enabled);
                    self.activity = Activity::Move {
                        segments,
                        next: next + 1,
                        started_us,
                    };
                }
                MoveOutcome::Complete => {
                    self.perf.record_move(now_us.saturating_sub(started_us));
                    self.commanded = segments[segments.len() - 1];
                    self.move_result = ResultCode::Ok;
                    self.state.last_result = ResultCode::Ok;
                    info!(position = report.position, "move complete");
                    self.set_lifecycle(LifecycleState::Idle, None);
                }
                MoveOutcome::Faulted { code, critical } => {
                    self.perf.record_move_failed();
                    self.move_result = if code.is_mechanical() {
                        ResultCode::CouldntReach
                    } else {
                        ResultCode::Fail
                    };
                    self.state.last_result = self.move_result;
                    self.fault(code, critical);
                }
                MoveOutcome::Aborted => {
                    self.perf.record_move_failed();
                    self.move_result = ResultCode::Fail;
                    self.state.last_result = ResultCode::Fail;
                    self.commanded = report.position;
                    self.set_lifecycle(LifecycleState::Idle, None);
                }
            },
            Activity::Calibration => match self.engine.on_report(&report) {
                CalibrationStep::Move(spec) => {
                    self.publish(spec, false);
                    self.activity = Activity::Calibration;
                }
                CalibrationStep::Done(profile) => {
                    if let Err(e) = self.store.save(&profile) {
                        warn!(error = ?e, "calibration profile not persisted");
                    }
                    self.profile = profile;
                    self.state.calibrated = true;
                    self.state.last_result = ResultCode::Ok;
                    self.perf.record_calibration();
                    self.commanded = self.encoder.position();
                    self.set_lifecycle(LifecycleState::Idle, None);
                }
                CalibrationStep::Failed(err) => {
                    warn!(error = %err, "calibration failed");
                    self.state.last_result = ResultCode::Fail;
                    let critical = matches!(
                        report.outcome,
                        MoveOutcome::Faulted { critical: true, .. }
                    );
                    self.fault(err.fault_code(), critical);
                }
            },
            Activity::Probe { segments, next } => match report.outcome {
                MoveOutcome::Complete if next < segments.len() => {
                    self.publish_servo(segments[next], false);
                    self.activity = Activity::Probe {
                        segments,
                        next: next + 1,
                    };
                }
                MoveOutcome::Complete => {
                    self.commanded = segments[segments.len() - 1];
                    self.state.last_result = ResultCode::Ok;
                    info!("probe passed, fault cleared");
                    self.clear();
                }
                MoveOutcome::Faulted { code, critical } => {
                    info!(fault = %code, "probe failed, fault kept");
                    self.state.last_result = ResultCode::Rejected;
                    self.fault(code, critical);
                }
                MoveOutcome::Aborted => {
                    self.state.last_result = ResultCode::Rejected;
                }
            },
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn limits(&self) -> FaultLimits {
        ControlParams::from_config(&self.config.control).limits
    }

    fn push_drive_settings(&self) {
        self.encoder.set_inverted(self.config.drive.encoder_invert);
        self.shared.configure_drive(DriveSettings {
            drive: self.config.drive.mapping(),
            peel: PeelSettings::from_config(&self.config.peel),
        });
    }

    fn publish_servo(&mut self, target_ticks: i32, peel: bool) {
        self.publish(
            MoveSpec {
                target_ticks,
                mode: DriveMode::Servo,
                deadline_periods: self.config.control.move_deadline_periods(),
            },
            peel,
        );
    }

    fn publish(&mut self, spec: MoveSpec, peel: bool) {
        self.generation = self.generation.wrapping_add(1);
        let cap = self.config.motion.velocity_cap_ticks;
        let velocity_cap = match spec.mode {
            DriveMode::Servo if cap > 0 => Some(cap),
            _ => None,
        };
        self.shared.publish(ControlTarget {
            generation: self.generation,
            target_ticks: spec.target_ticks,
            velocity_cap,
            deadline_periods: spec.deadline_periods,
            mode: spec.mode,
            params: ControlParams::from_config(&self.config.control),
            peel,
        });
    }

    fn fault(&mut self, code: FaultCode, critical: bool) {
        if critical || code.severity() == Severity::Estop {
            self.enter_estop(code);
            return;
        }
        self.perf.record_fault(code);
        self.engine.cancel();
        self.activity = Activity::None;
        self.commanded = self.encoder.position();
        warn!(fault = %code, "feeder faulted");
        self.set_lifecycle(LifecycleState::Fault, Some(code));
    }

    fn enter_estop(&mut self, code: FaultCode) {
        self.shared.engage_estop();
        self.shared.abort();
        self.perf.record_fault(code);
        if matches!(self.activity, Activity::Move { .. }) {
            self.perf.record_move_failed();
            self.move_result = ResultCode::EStopped;
        }
        self.activity = Activity::None;
        self.engine.cancel();
        self.estop_reset = None;
        warn!(fault = %code, "emergency stop");
        self.set_lifecycle(LifecycleState::Estop, Some(code));
    }

    fn clear(&mut self) {
        self.activity = Activity::None;
        self.commanded = self.encoder.position();
        self.set_lifecycle(LifecycleState::Idle, None);
    }

    fn set_lifecycle(&mut self, lifecycle: LifecycleState, fault: Option<FaultCode>) {
        if self.state.lifecycle == lifecycle && self.state.fault == fault {
            return;
        }
        debug!(
            from = self.state.lifecycle.as_str(),
            to = lifecycle.as_str(),
            "lifecycle change"
        );
        self.state.lifecycle = lifecycle;
        self.state.fault = fault;
        self.indicator.show(lifecycle, fault);
    }

    fn next_challenge(&mut self, now_us: u64) -> u16 {
        // xorshift32, stirred with the clock so challenges differ per boot
        let mut x = self.rng ^ (now_us as u32);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = if x == 0 { 1 } else { x };
        (x >> 16) as u16 ^ x as u16
    }
}
