//! External collaborators the core calls but does not implement.
//!
//! - [`ConfigService`]: typed read access to persisted settings
//! - [`CalibrationStore`]: load/save of the calibration profile
//! - [`StatusIndicator`]: lifecycle notifications and identify requests

use crate::calibration::CalibrationProfile;
use crate::config::{SettingKey, SettingValue};
use crate::error::FaultCode;
use crate::feeder::LifecycleState;

/// Read access to the persisted settings store.
///
/// The core only ever reads. Writes made over the bus stay in the live
/// [`FeederConfig`](crate::config::FeederConfig), except an address set by
/// program-feeder-floor, which the state machine hands out through
/// [`take_setting_to_persist`](crate::feeder::FeederStateMachine::take_setting_to_persist).
pub trait ConfigService {
    /// Stored value for `key`, or `None` to keep the default.
    fn read(&self, key: SettingKey) -> Option<SettingValue>;
}

/// Persistence for the calibration profile.
pub trait CalibrationStore {
    /// Error type for storage operations.
    type Error: core::fmt::Debug;

    /// Profile saved by a previous calibration, if any.
    fn load(&mut self) -> Result<Option<CalibrationProfile>, Self::Error>;

    /// Persist a freshly validated profile.
    fn save(&mut self, profile: &CalibrationProfile) -> Result<(), Self::Error>;
}

/// Receives lifecycle changes (idle/moving/fault/estop) for display.
pub trait StatusIndicator {
    /// Called on every lifecycle transition.
    fn show(&mut self, state: LifecycleState, fault: Option<FaultCode>);

    /// The host asked this feeder to make itself visible.
    fn identify(&mut self) {}
}
