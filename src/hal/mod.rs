//! Concrete implementations of the traits in [`crate::traits`].
//!
//! # Available Implementations
//!
//! - `mock`: recording doubles for unit tests
//! - `sim`: a simulated drive train and a fully wired feeder rig, used by
//!   the integration tests and the `feeder_sim` binary
//! - `esp32`: ESP32-C3 board support (requires the `esp32` feature)

pub mod mock;
pub mod sim;

#[cfg(feature = "esp32")]
pub mod esp32;

pub use mock::*;
pub use sim::{Mechanism, SimMotor, SimParts, SimRig, SimSensors, HOST_ADDRESS};
