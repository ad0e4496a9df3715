//! Mock implementations for testing without hardware.
//!
//! These doubles record what the core did to them and let tests inject
//! what the hardware would report. Fields are public so tests can inspect
//! and poke them directly.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockMotor`] | [`MotorDriver`] | Records the last command and enable state |
//! | [`MockPins`] | [`PwmPins`] | Records H-bridge outputs |
//! | [`MockSensors`] | [`FaultDetector`] | Injectable current and temperature |
//! | [`MockClock`] | [`Clock`] | Controllable time source |
//! | [`MockBus`] | [`HalfDuplexBus`] | Queued RX bytes, captured TX |
//! | [`MockStore`] | [`CalibrationStore`] | In-memory profile, optional save failure |
//! | [`MockConfigService`] | [`ConfigService`] | Settings from a list |
//! | [`MockIndicator`] | [`StatusIndicator`] | Lifecycle history |
//!
//! # Example
//!
//! ```rust
//! use gluon_feeder::control::{ControlLoop, ControlShared};
//! use gluon_feeder::config::ControlConfig;
//! use gluon_feeder::encoder::EncoderCounter;
//! use gluon_feeder::hal::{MockMotor, MockSensors};
//! use gluon_feeder::perf::PerformanceMonitor;
//!
//! let shared = ControlShared::new();
//! let encoder = EncoderCounter::new();
//! let perf = PerformanceMonitor::new();
//! let mut control = ControlLoop::new(
//!     &ControlConfig::default(),
//!     &shared,
//!     &encoder,
//!     &perf,
//!     MockMotor::new(),
//!     MockSensors::new(),
//! );
//!
//! control.tick(0);
//! assert!(!control.motor().enabled);
//! ```
//!
//! [`PwmPins`]: crate::motor::PwmPins

use std::collections::VecDeque;

use crate::calibration::CalibrationProfile;
use crate::config::{SettingKey, SettingValue};
use crate::error::FaultCode;
use crate::feeder::LifecycleState;
use crate::motor::{HBridgeOutput, PwmMapping, PwmPins};
use crate::protocol::ProtocolFrame;
use crate::traits::{
    CalibrationStore, Clock, ConfigService, FaultDetector, HalfDuplexBus, MotorCommand,
    MotorDriver, RxByte, StatusIndicator,
};

// ============================================================================
// Hardware Mocks
// ============================================================================

/// Mock motor driver.
///
/// # Example
///
/// ```rust
/// use gluon_feeder::hal::MockMotor;
/// use gluon_feeder::traits::{Direction, MotorCommand, MotorDriver};
///
/// let mut motor = MockMotor::new();
/// motor.apply(MotorCommand::new(0.25, Direction::Reverse)).unwrap();
/// assert_eq!(motor.last.signed(), -0.25);
/// assert_eq!(motor.apply_count, 1);
///
/// // a stuck enable line
/// motor.sense_stuck = Some(true);
/// assert!(motor.enable_sensed());
/// ```
#[derive(Debug, Default)]
pub struct MockMotor {
    /// Commanded enable state.
    pub enabled: bool,
    /// Last applied command.
    pub last: MotorCommand,
    /// Number of `apply` calls.
    pub apply_count: usize,
    /// Overrides the enable sense when set.
    pub sense_stuck: Option<bool>,
    /// Make `apply` fail.
    pub fail_apply: bool,
    /// Last mapping passed to `configure`.
    pub mapping: Option<PwmMapping>,
}

impl MockMotor {
    /// Disabled, coasting.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MotorDriver for MockMotor {
    type Error = ();

    fn apply(&mut self, cmd: MotorCommand) -> Result<(), ()> {
        if self.fail_apply {
            return Err(());
        }
        self.last = cmd;
        self.apply_count += 1;
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), ()> {
        self.enabled = enabled;
        Ok(())
    }

    fn enable_sensed(&self) -> bool {
        self.sense_stuck.unwrap_or(self.enabled)
    }

    fn configure(&mut self, mapping: PwmMapping) {
        self.mapping = Some(mapping);
    }
}

/// Mock H-bridge pins. The enable feedback follows the enable output.
#[derive(Debug, Default)]
pub struct MockPins {
    /// Last PWM outputs.
    pub outputs: HBridgeOutput,
    /// Enable pin level.
    pub enable: bool,
}

impl MockPins {
    /// All outputs low.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PwmPins for MockPins {
    type Error = ();

    fn set_outputs(&mut self, out: HBridgeOutput) -> Result<(), ()> {
        self.outputs = out;
        Ok(())
    }

    fn set_enable(&mut self, on: bool) -> Result<(), ()> {
        self.enable = on;
        Ok(())
    }

    fn enable_feedback(&self) -> bool {
        self.enable
    }
}

/// Mock current and temperature sensing. `None` means no reading.
#[derive(Debug, Default)]
pub struct MockSensors {
    /// Motor current.
    pub current_ma: Option<u32>,
    /// Driver temperature.
    pub temperature_c: Option<i32>,
}

impl MockSensors {
    /// No readings.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FaultDetector for MockSensors {
    fn current_ma(&self) -> Option<u32> {
        self.current_ma
    }

    fn temperature_c(&self) -> Option<i32> {
        self.temperature_c
    }
}

/// Controllable clock.
///
/// # Example
///
/// ```rust
/// use gluon_feeder::hal::MockClock;
/// use gluon_feeder::traits::Clock;
///
/// let mut clock = MockClock::new();
/// clock.advance_us(250);
/// clock.advance_ms(1);
/// assert_eq!(clock.now_us(), 1250);
/// ```
#[derive(Debug, Default)]
pub struct MockClock {
    now_us: u64,
}

impl MockClock {
    /// Clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by microseconds.
    pub fn advance_us(&mut self, us: u64) {
        self.now_us += us;
    }

    /// Move time forward by milliseconds.
    pub fn advance_ms(&mut self, ms: u64) {
        self.now_us += ms * 1000;
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> u64 {
        self.now_us
    }
}

// ============================================================================
// Bus Mock
// ============================================================================

/// Byte time used when injecting frames, about 1 Mbaud.
pub const MOCK_BYTE_US: u64 = 10;

/// Mock half-duplex bus.
///
/// Injected bytes are returned by `read` in order, whatever the time.
/// Every `write` is captured in `tx`.
#[derive(Debug, Default)]
pub struct MockBus {
    /// Bytes waiting to be read.
    pub rx: VecDeque<RxByte>,
    /// Captured writes.
    pub tx: Vec<Vec<u8>>,
    /// Every driver-enable change, in order.
    pub driver_log: Vec<bool>,
    /// Make `write` fail.
    pub fail_write: bool,
}

impl MockBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue raw bytes, one every [`MOCK_BYTE_US`] from `start_us`.
    pub fn inject_bytes(&mut self, bytes: &[u8], start_us: u64) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.rx.push_back(RxByte {
                byte,
                at_us: start_us + i as u64 * MOCK_BYTE_US,
            });
        }
    }

    /// Queue an encoded frame.
    pub fn inject(&mut self, frame: &ProtocolFrame, start_us: u64) {
        self.inject_bytes(&frame.encode(), start_us);
    }

    /// Decode everything written so far.
    pub fn sent_frames(&self) -> Vec<ProtocolFrame> {
        self.tx
            .iter()
            .filter_map(|bytes| ProtocolFrame::decode(bytes).ok())
            .collect()
    }
}

impl HalfDuplexBus for MockBus {
    type Error = ();

    fn read(&mut self) -> Option<RxByte> {
        self.rx.pop_front()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ()> {
        if self.fail_write {
            return Err(());
        }
        self.tx.push(bytes.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ()> {
        Ok(())
    }

    fn set_driver_enabled(&mut self, enabled: bool) -> Result<(), ()> {
        self.driver_log.push(enabled);
        Ok(())
    }
}

// ============================================================================
// Service Mocks
// ============================================================================

/// In-memory calibration store.
#[derive(Debug, Default)]
pub struct MockStore {
    /// Stored profile.
    pub profile: Option<CalibrationProfile>,
    /// Number of successful saves.
    pub saves: usize,
    /// Make `save` fail.
    pub fail_save: bool,
}

impl MockStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CalibrationStore for MockStore {
    type Error = &'static str;

    fn load(&mut self) -> Result<Option<CalibrationProfile>, Self::Error> {
        Ok(self.profile)
    }

    fn save(&mut self, profile: &CalibrationProfile) -> Result<(), Self::Error> {
        if self.fail_save {
            return Err("flash write failed");
        }
        self.profile = Some(*profile);
        self.saves += 1;
        Ok(())
    }
}

/// Settings service backed by a list of pairs.
///
/// # Example
///
/// ```rust
/// use gluon_feeder::config::{FeederConfig, SettingKey, SettingValue};
/// use gluon_feeder::hal::MockConfigService;
///
/// let service = MockConfigService::new().with(SettingKey::BusAddress, SettingValue::Int(7));
/// let config = FeederConfig::load(&service).unwrap();
/// assert_eq!(config.bus.address, 7);
/// ```
#[derive(Debug, Default)]
pub struct MockConfigService {
    /// Stored settings.
    pub values: Vec<(SettingKey, SettingValue)>,
}

impl MockConfigService {
    /// No settings stored.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a setting.
    pub fn with(mut self, key: SettingKey, value: SettingValue) -> Self {
        self.values.push((key, value));
        self
    }
}

impl ConfigService for MockConfigService {
    fn read(&self, key: SettingKey) -> Option<SettingValue> {
        self.values
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }
}

/// Records every lifecycle notification.
#[derive(Debug, Default)]
pub struct MockIndicator {
    /// Notifications in order.
    pub history: Vec<(LifecycleState, Option<FaultCode>)>,
    /// Number of identify requests.
    pub identify_count: usize,
}

impl MockIndicator {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusIndicator for MockIndicator {
    fn show(&mut self, state: LifecycleState, fault: Option<FaultCode>) {
        self.history.push((state, fault));
    }

    fn identify(&mut self) {
        self.identify_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_bus_captures_writes() {
        let mut bus = MockBus::new();
        let frame = ProtocolFrame::new(1, 2, 3, 4, &[5]).unwrap();
        bus.write(&frame.encode()).unwrap();
        assert_eq!(bus.sent_frames(), vec![frame]);
    }

    #[test]
    fn mock_bus_injects_with_byte_timing() {
        let mut bus = MockBus::new();
        bus.inject_bytes(&[1, 2, 3], 100);
        let times: Vec<u64> = std::iter::from_fn(|| bus.read()).map(|b| b.at_us).collect();
        assert_eq!(times, vec![100, 110, 120]);
    }

    #[test]
    fn mock_store_failure() {
        let mut store = MockStore::new();
        store.fail_save = true;
        let profile = CalibrationProfile::nominal(100.0);
        assert!(store.save(&profile).is_err());
        assert_eq!(store.load(), Ok(None));
    }
}
