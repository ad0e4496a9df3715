//! # gluon-feeder
//!
//! Firmware core for a closed-loop motorized SMD tape feeder, driven by a
//! pick-and-place host over the Photon RS485 protocol.
//!
//! ## Features
//!
//! - **Position control**: fixed-period PID loop with anti-windup, dead-band,
//!   stall, timeout and electrical fault detection
//! - **Photon protocol**: CRC-8 framed half-duplex RS485 with addressing,
//!   broadcast reply slots and inter-byte timeouts
//! - **Calibration**: measures ticks per millimetre, backlash and stall
//!   current with four guided moves
//! - **Safety**: fault and e-stop lifecycle with an acknowledged reset
//!   handshake and drive-enable interlock
//! - **Diagnostics**: lock-free performance counters readable over the bus
//!
//! ## Architecture
//!
//! Two execution contexts share a few lock-free slots:
//!
//! - `control` - the periodic tick; owns the motor, never blocks or logs
//! - `feeder` - the processing context; owns the state, publishes targets
//! - `protocol` - framing, link layer and payload codecs
//! - `calibration` - profile type and the guided-move engine
//! - `encoder`, `motor`, `pid`, `perf` - the leaves
//! - `hal` - mocks, a simulated mechanism and ESP32-C3 board support
//!   (requires `std`; the board layer also needs `esp32`)
//!
//! ## Example
//!
//! ```rust
//! use gluon_feeder::{
//!     commands::{FeederCommand, MoveRequest},
//!     hal::{MockIndicator, MockMotor, MockSensors, MockStore},
//!     ControlLoop, ControlShared, EncoderCounter, FeederConfig, FeederStateMachine,
//!     LifecycleState, PerformanceMonitor,
//! };
//!
//! let shared = ControlShared::new();
//! let encoder = EncoderCounter::new();
//! let perf = PerformanceMonitor::new();
//! let config = FeederConfig::default();
//!
//! let mut control = ControlLoop::new(
//!     &config.control,
//!     &shared,
//!     &encoder,
//!     &perf,
//!     MockMotor::new(),
//!     MockSensors::new(),
//! );
//! let mut feeder = FeederStateMachine::new(
//!     config,
//!     &shared,
//!     &encoder,
//!     &perf,
//!     MockStore::new(),
//!     MockIndicator::new(),
//! );
//!
//! // the reply comes back at once, the move runs in the tick
//! feeder.handle_command(FeederCommand::Move(MoveRequest::forward_tenths(40)), 0);
//! assert_eq!(feeder.state().lifecycle, LifecycleState::Moving);
//!
//! control.tick(0);
//! assert!(control.motor().enabled);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

/// Calibration profile and the guided-move calibration engine.
pub mod calibration;
/// Feeder commands, replies and front-panel buttons.
pub mod commands;
/// Typed configuration with validation and a settings key table.
pub mod config;
/// Fixed-period position control loop and its shared state.
pub mod control;
/// Quadrature encoder counting.
pub mod encoder;
/// Fault codes and error types.
pub mod error;
/// Feeder lifecycle state machine.
pub mod feeder;
/// Mock, simulated and ESP32 hardware.
#[cfg(feature = "std")]
pub mod hal;
/// Signed duty to H-bridge PWM mapping.
pub mod motor;
/// Open-loop cover-tape peel motor.
pub mod peel;
/// Lock-free performance counters.
pub mod perf;
/// PID controller.
pub mod pid;
/// Photon RS485 protocol stack.
pub mod protocol;
/// Hardware and service abstractions.
pub mod traits;

// Re-exports for convenience
pub use calibration::{CalibrationEngine, CalibrationProfile};
pub use commands::{ButtonEvent, CommandReply, FeederCommand, MoveAmount, MoveRequest};
pub use config::{DriveConfig, FeederConfig, PeelConfig, SettingKey, SettingValue};
pub use control::{ControlLoop, ControlShared, MoveOutcome, MoveReport};
pub use encoder::EncoderCounter;
pub use error::{CalibrationError, ConfigError, DispatchError, FaultCode, FrameError, Severity};
pub use feeder::{FeederState, FeederStateMachine, LifecycleState};
pub use peel::PeelDrive;
pub use perf::{PerfSnapshot, PerformanceMonitor};
pub use protocol::{Opcode, PhotonLink, ProtocolFrame, ResultCode};
pub use traits::{
    // Hardware
    CalibrationStore,
    Clock,
    ConfigService,
    Direction,
    FaultDetector,
    HalfDuplexBus,
    MotorCommand,
    MotorDriver,
    StatusIndicator,
};
