//! Trait definitions for hardware abstraction and external services.
//!
//! # Submodules
//!
//! - `hardware`: Motor driver, current/temperature sensing, clock
//! - `bus`: Half-duplex RS485 transport
//! - `services`: Settings store, calibration persistence, status indicator
//!
//! # Hardware Abstraction
//!
//! - [`MotorDriver`]: Signed duty-cycle H-bridge drive with enable sense
//! - [`FaultDetector`]: Current and temperature readings
//! - [`HalfDuplexBus`]: Byte transport with driver-enable control
//! - [`Clock`]: Time source for `no_std` environments

pub mod bus;
pub mod hardware;
pub mod services;

pub use bus::*;
pub use hardware::*;
pub use services::*;
