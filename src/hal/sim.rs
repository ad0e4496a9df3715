//! Simulated feeder mechanism for desktop runs and integration tests.
//!
//! [`Mechanism`] is a small rigid-body model of the drive train: a DC
//! motor with a first-order velocity response and static friction, a
//! backlash gap between the motor and the sprocket, optional hard stops
//! and a "blocked" switch for jammed tape. The encoder sits on the
//! sprocket side, so backlash is invisible to it until the gap closes.
//!
//! [`SimRig`] wires the mechanism to a real [`ControlLoop`], a real
//! [`FeederStateMachine`] and a [`PhotonLink`] over a [`MockBus`], and
//! steps them all one control period at a time against a [`MockClock`].
//! The peel motor is a [`PeelDrive`] over a [`MockMotor`].
//!
//! ```rust
//! use gluon_feeder::config::FeederConfig;
//! use gluon_feeder::commands::{FeederCommand, MoveRequest};
//! use gluon_feeder::hal::{Mechanism, MockStore, SimParts};
//! use gluon_feeder::protocol::ResultCode;
//!
//! let parts = SimParts::new();
//! let mut rig = parts.rig(FeederConfig::default(), Mechanism::new(), MockStore::new());
//!
//! let reply = rig.request(FeederCommand::Move(MoveRequest::forward_tenths(20))).unwrap();
//! assert_eq!(reply.payload[0], ResultCode::InProgress as u8);
//!
//! rig.settle(2_000);
//! assert!((rig.position() - 451).abs() <= 15);
//! ```

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use tracing::warn;

use crate::commands::FeederCommand;
use crate::config::FeederConfig;
use crate::control::{ControlLoop, ControlShared};
use crate::encoder::EncoderCounter;
use crate::feeder::{FeederStateMachine, LifecycleState};
use crate::hal::mock::{MockBus, MockClock, MockIndicator, MockMotor, MockStore};
use crate::peel::PeelDrive;
use crate::perf::PerformanceMonitor;
use crate::protocol::{encode_command, PhotonLink, ProtocolFrame};
use crate::traits::{Clock, FaultDetector, MotorCommand, MotorDriver};

/// Bus address the simulated host sends from.
pub const HOST_ADDRESS: u8 = 0xF0;

// ============================================================================
// Mechanism
// ============================================================================

/// Drive train model, advanced once per control period.
#[derive(Clone, Debug)]
pub struct Mechanism {
    /// Motor-side position in ticks.
    pub motor_pos: f32,
    /// Sprocket-side position in ticks; what the encoder reads.
    pub output_pos: f32,
    /// Backlash gap in ticks. Must not be negative.
    pub backlash: f32,
    /// Hard stops on the sprocket side, `(low, high)`.
    pub stops: Option<(f32, f32)>,
    /// Jammed tape: the sprocket cannot move at all.
    pub blocked: bool,
    /// Speed at full duty, ticks per period.
    pub max_velocity: f32,
    /// Duty lost to static friction.
    pub friction: f32,
    /// Fraction of the velocity error closed each period.
    pub response: f32,
    /// Driver temperature.
    pub temperature_c: i32,
    /// Overrides the enable sense line when set.
    pub stuck_enable: Option<bool>,
    drive: f32,
    enabled: bool,
    velocity: f32,
    pushing: bool,
    current_ma: u32,
}

impl Default for Mechanism {
    fn default() -> Self {
        Self::new()
    }
}

impl Mechanism {
    /// Free-running mechanism at zero with no backlash and no stops.
    pub fn new() -> Self {
        Self {
            motor_pos: 0.0,
            output_pos: 0.0,
            backlash: 0.0,
            stops: None,
            blocked: false,
            max_velocity: 20.0,
            friction: 0.02,
            response: 0.5,
            temperature_c: 35,
            stuck_enable: None,
            drive: 0.0,
            enabled: false,
            velocity: 0.0,
            pushing: false,
            current_ma: 0,
        }
    }

    /// Set the backlash gap.
    pub fn with_backlash(mut self, ticks: f32) -> Self {
        self.backlash = ticks.max(0.0);
        self
    }

    /// Add hard stops.
    pub fn with_stops(mut self, low: f32, high: f32) -> Self {
        self.stops = Some((low.min(high), low.max(high)));
        self
    }

    /// Motor speed, ticks per period.
    pub fn velocity(&self) -> f32 {
        self.velocity
    }

    /// True if the last period ended against a stop or a jam.
    pub fn is_pushing(&self) -> bool {
        self.pushing
    }

    /// Drive actually reaching the motor.
    pub fn effective_drive(&self) -> f32 {
        if self.enabled {
            self.drive
        } else {
            0.0
        }
    }

    /// Advance one period and report the sprocket position to the encoder.
    pub fn advance(&mut self, encoder: &EncoderCounter) {
        let drive = self.effective_drive();
        let magnitude = drive.abs();
        let torque = if magnitude > self.friction {
            (magnitude - self.friction) * drive.signum()
        } else {
            0.0
        };
        self.velocity += (self.max_velocity * torque - self.velocity) * self.response;
        if self.velocity.abs() < 1e-3 {
            self.velocity = 0.0;
        }

        let free = self.motor_pos + self.velocity;
        self.motor_pos = free;
        if self.blocked {
            self.couple_motor();
        } else {
            self.output_pos = self
                .output_pos
                .clamp(self.motor_pos - self.backlash, self.motor_pos);
            if let Some((low, high)) = self.stops {
                self.output_pos = self.output_pos.clamp(low, high);
                self.couple_motor();
            }
        }

        let pinned = self.motor_pos != free;
        if pinned {
            self.velocity = 0.0;
        }
        self.pushing = pinned && magnitude > 0.0;
        self.current_ma = if magnitude == 0.0 {
            0
        } else if self.pushing {
            (1400.0 * magnitude) as u32
        } else {
            (100.0 + 300.0 * magnitude) as u32
        };

        encoder.sync_hardware(self.output_pos.round() as i32 as u16);
    }

    fn couple_motor(&mut self) {
        self.motor_pos = self
            .motor_pos
            .clamp(self.output_pos, self.output_pos + self.backlash);
    }
}

/// [`MotorDriver`] half of the simulated mechanism.
#[derive(Clone, Debug)]
pub struct SimMotor(Rc<RefCell<Mechanism>>);

impl MotorDriver for SimMotor {
    type Error = ();

    fn apply(&mut self, cmd: MotorCommand) -> Result<(), ()> {
        self.0.borrow_mut().drive = cmd.signed();
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), ()> {
        self.0.borrow_mut().enabled = enabled;
        Ok(())
    }

    fn enable_sensed(&self) -> bool {
        let m = self.0.borrow();
        m.stuck_enable.unwrap_or(m.enabled)
    }
}

/// [`FaultDetector`] half of the simulated mechanism.
#[derive(Clone, Debug)]
pub struct SimSensors(Rc<RefCell<Mechanism>>);

impl FaultDetector for SimSensors {
    fn current_ma(&self) -> Option<u32> {
        Some(self.0.borrow().current_ma)
    }

    fn temperature_c(&self) -> Option<i32> {
        Some(self.0.borrow().temperature_c)
    }
}

// ============================================================================
// Rig
// ============================================================================

/// Shared state that must outlive the rig borrowing it.
#[derive(Default)]
pub struct SimParts {
    /// Control tick exchange.
    pub shared: ControlShared,
    /// Encoder count.
    pub encoder: EncoderCounter,
    /// Counters.
    pub perf: PerformanceMonitor,
}

impl SimParts {
    /// Fresh parts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble a rig around `mechanism`.
    pub fn rig(&self, config: FeederConfig, mechanism: Mechanism, store: MockStore) -> SimRig<'_> {
        let mechanism = Rc::new(RefCell::new(mechanism));
        let control = ControlLoop::new(
            &config.control,
            &self.shared,
            &self.encoder,
            &self.perf,
            SimMotor(Rc::clone(&mechanism)),
            SimSensors(Rc::clone(&mechanism)),
        );
        let link = PhotonLink::new(MockBus::new(), &config.bus, &self.perf);
        let period_us = config.control.period_us.max(1) as u64;
        let feeder = FeederStateMachine::new(
            config,
            &self.shared,
            &self.encoder,
            &self.perf,
            store,
            MockIndicator::new(),
        );
        SimRig {
            mechanism,
            shared: &self.shared,
            encoder: &self.encoder,
            control,
            peel: PeelDrive::new(MockMotor::new()),
            feeder,
            link,
            clock: MockClock::new(),
            period_us,
            packet_id: 0,
        }
    }
}

/// A whole feeder running against the simulated mechanism.
pub struct SimRig<'a> {
    mechanism: Rc<RefCell<Mechanism>>,
    shared: &'a ControlShared,
    encoder: &'a EncoderCounter,
    control: ControlLoop<'a, SimMotor, SimSensors>,
    peel: PeelDrive<MockMotor>,
    feeder: FeederStateMachine<'a, MockStore, MockIndicator>,
    link: PhotonLink<'a, MockBus>,
    clock: MockClock,
    period_us: u64,
    packet_id: u8,
}

impl<'a> SimRig<'a> {
    /// Simulated time.
    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Encoder position.
    pub fn position(&self) -> i32 {
        self.encoder.position()
    }

    /// Lifecycle state of the feeder.
    pub fn lifecycle(&self) -> LifecycleState {
        self.feeder.state().lifecycle
    }

    /// Borrow the mechanism.
    pub fn mechanism(&self) -> Ref<'_, Mechanism> {
        self.mechanism.borrow()
    }

    /// Mutably borrow the mechanism, e.g. to jam or free it.
    pub fn mechanism_mut(&self) -> RefMut<'_, Mechanism> {
        self.mechanism.borrow_mut()
    }

    /// Borrow the control loop.
    pub fn control(&self) -> &ControlLoop<'a, SimMotor, SimSensors> {
        &self.control
    }

    /// Borrow the peel drive.
    pub fn peel(&self) -> &PeelDrive<MockMotor> {
        &self.peel
    }

    /// Borrow the state machine.
    pub fn feeder(&self) -> &FeederStateMachine<'a, MockStore, MockIndicator> {
        &self.feeder
    }

    /// Mutably borrow the state machine, e.g. to press buttons.
    pub fn feeder_mut(&mut self) -> &mut FeederStateMachine<'a, MockStore, MockIndicator> {
        &mut self.feeder
    }

    /// Borrow the link.
    pub fn link(&self) -> &PhotonLink<'a, MockBus> {
        &self.link
    }

    /// Mutably borrow the link, e.g. to inject raw bytes.
    pub fn link_mut(&mut self) -> &mut PhotonLink<'a, MockBus> {
        &mut self.link
    }

    /// One control period: mechanism, control tick, peel motor, then bus
    /// and state machine.
    pub fn step(&mut self) {
        self.mechanism.borrow_mut().advance(self.encoder);
        let now = self.clock.now_us();
        self.control.tick(now);
        // the mock motor cannot fail
        let _ = self.peel.update(self.shared, now);
        if self.feeder.service_bus(&mut self.link, now).is_err() {
            warn!("simulated bus write failed");
        }
        self.clock.advance_us(self.period_us);
    }

    /// Run for `ms` milliseconds of simulated time.
    pub fn run_ms(&mut self, ms: u64) {
        let end = self.now_us() + ms * 1000;
        while self.now_us() < end {
            self.step();
        }
    }

    /// Step until `done` holds or `limit_ms` passes; true if it held.
    pub fn run_until(&mut self, limit_ms: u64, mut done: impl FnMut(&Self) -> bool) -> bool {
        let end = self.now_us() + limit_ms * 1000;
        while self.now_us() < end {
            self.step();
            if done(self) {
                return true;
            }
        }
        false
    }

    /// Step until no move, calibration or probe is in flight; true if
    /// that happened within `limit_ms`.
    pub fn settle(&mut self, limit_ms: u64) -> bool {
        self.run_until(limit_ms, |rig| {
            !rig.feeder.is_busy() && !rig.control.is_moving()
        })
    }

    /// Put a command on the bus as the host would.
    pub fn send(&mut self, command: &FeederCommand) -> u8 {
        self.send_to(self.link.address(), command)
    }

    /// Put a command for address `to` on the bus, e.g. a broadcast.
    pub fn send_to(&mut self, to: u8, command: &FeederCommand) -> u8 {
        self.packet_id = self.packet_id.wrapping_add(1);
        let frame = encode_command(to, HOST_ADDRESS, self.packet_id, command);
        self.send_frame(&frame);
        self.packet_id
    }

    /// Put a raw frame on the bus.
    pub fn send_frame(&mut self, frame: &ProtocolFrame) {
        let now = self.now_us();
        self.link.bus_mut().inject(frame, now);
    }

    /// Send a command and step until its reply has gone out.
    pub fn request(&mut self, command: FeederCommand) -> Option<ProtocolFrame> {
        let id = self.send(&command);
        let mut found = None;
        let end = self.now_us() + 50_000;
        while found.is_none() && self.now_us() < end {
            self.step();
            found = self
                .take_replies()
                .into_iter()
                .find(|f| f.packet_id == id && f.to == HOST_ADDRESS);
        }
        found
    }

    /// Drain and decode everything the feeder transmitted.
    pub fn take_replies(&mut self) -> Vec<ProtocolFrame> {
        let bus = self.link.bus_mut();
        let frames = bus.sent_frames();
        bus.tx.clear();
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_mechanism_tracks_drive() {
        let encoder = EncoderCounter::new();
        let mut m = Mechanism::new();
        m.enabled = true;
        m.drive = 0.52;
        for _ in 0..20 {
            m.advance(&encoder);
        }
        // 20 * (0.52 - 0.02) = 10 ticks per period at steady state
        assert!((m.velocity() - 10.0).abs() < 0.01);
        assert_eq!(encoder.position(), m.output_pos.round() as i32);
    }

    #[test]
    fn disabled_bridge_does_not_drive() {
        let encoder = EncoderCounter::new();
        let mut m = Mechanism::new();
        m.drive = 0.8;
        m.advance(&encoder);
        assert_eq!(m.velocity(), 0.0);
        assert_eq!(encoder.position(), 0);
    }

    #[test]
    fn backlash_hides_reversal_from_encoder() {
        let encoder = EncoderCounter::new();
        let mut m = Mechanism::new().with_backlash(30.0);
        m.enabled = true;
        m.drive = -0.3;
        for _ in 0..10 {
            m.advance(&encoder);
        }
        let before = encoder.position();
        m.drive = 0.3;
        m.advance(&encoder);
        m.advance(&encoder);
        assert_eq!(encoder.position(), before);
        assert!(m.output_pos >= m.motor_pos - m.backlash);
    }

    #[test]
    fn stop_pins_and_draws_current() {
        let encoder = EncoderCounter::new();
        let mut m = Mechanism::new().with_stops(-50.0, 50.0);
        m.enabled = true;
        m.drive = 0.3;
        for _ in 0..40 {
            m.advance(&encoder);
        }
        assert_eq!(encoder.position(), 50);
        assert!(m.is_pushing());
        assert_eq!(m.velocity(), 0.0);
        assert_eq!(SimSensors(Rc::new(RefCell::new(m))).current_ma(), Some(420));
    }

    #[test]
    fn rig_runs_peel_with_moves() {
        let parts = SimParts::new();
        let mut rig = parts.rig(FeederConfig::default(), Mechanism::new(), MockStore::new());
        rig.request(FeederCommand::Move(crate::commands::MoveRequest::forward_tenths(20)));
        assert!(rig.peel().is_running());
        assert!(rig.settle(2_000));
        // overrun keeps it going past the end of the move
        assert!(rig.peel().is_running());
        rig.run_ms(1_100);
        assert!(!rig.peel().is_running());
    }

    #[test]
    fn rig_answers_query() {
        let parts = SimParts::new();
        let mut rig = parts.rig(FeederConfig::default(), Mechanism::new(), MockStore::new());
        let reply = rig.request(FeederCommand::QueryStatus).unwrap();
        assert_eq!(reply.from, 1);
        assert_eq!(reply.payload[0], 0);
        assert_eq!(reply.payload[1], LifecycleState::Idle as u8);
    }
}
