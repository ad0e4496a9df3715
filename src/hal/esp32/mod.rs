//! ESP32-C3 SuperMini hardware abstraction layer for a tape feeder.
//!
//! This module provides the board side of the feeder traits for an
//! ESP32-C3 driving a brushed gearmotor through a DRV8871-style H-bridge,
//! with a quadrature encoder on the drive shaft and an RS485 transceiver
//! on UART1.
//!
//! # Hardware Configuration
//!
//! - **MCU**: ESP32-C3 SuperMini (RISC-V 160MHz, 4MB Flash)
//! - **Motor Driver**: H-bridge with two PWM inputs, enable and
//!   current-proportional output
//! - **Encoder**: two-channel quadrature, open collector
//! - **Bus**: half-duplex RS485 transceiver (DE and /RE tied together)
//! - **Display**: SSD1306 128x64 OLED (I2C), optional
//! - **Peel motor**: second H-bridge on the display pins, optional
//!
//! # Pin Assignments
//!
//! See the [`pins`] module for GPIO assignments matching the SuperMini layout.

mod clock;
mod encoder;
mod fault;
mod motor;
mod rs485;

pub use clock::Esp32Clock;
pub use encoder::Esp32Quadrature;
pub use fault::Esp32Sensors;
pub use motor::{new_motor, new_peel_motor, Esp32Motor, Esp32PeelMotor, Esp32Pins, PeelPins};
pub use rs485::Esp32Rs485;

#[cfg(feature = "display")]
mod display;
#[cfg(feature = "display")]
pub use display::{DisplayError, Esp32Display};

#[cfg(feature = "nvs")]
mod nvs;
#[cfg(feature = "nvs")]
pub use nvs::{Esp32Nvs, NvsStoreError};

/// Pin assignments for SuperMini ESP32-C3.
///
/// - Bridge on GPIO5-7, enable sense on GPIO10
/// - Encoder on GPIO0/1
/// - Current and temperature sense on GPIO3/4 (ADC1)
/// - RS485 on GPIO20/21 with DE on GPIO2
/// - Buttons on GPIO18/19, I2C display or peel bridge on GPIO8/9
pub mod pins {
    // =========================================================================
    // H-bridge
    // =========================================================================

    /// Bridge input 1 (forward PWM)
    pub const IN1: i32 = 5;

    /// Bridge input 2 (reverse PWM)
    pub const IN2: i32 = 6;

    /// Bridge enable output
    pub const DRIVE_EN: i32 = 7;

    /// Enable line read back through a divider
    pub const DRIVE_EN_SENSE: i32 = 10;

    /// Current-proportional output of the bridge (ADC1)
    pub const CURRENT_SENSE: i32 = 4;

    /// TMP36 on the bridge heatsink (ADC1)
    pub const TEMP_SENSE: i32 = 3;

    // =========================================================================
    // Encoder
    // =========================================================================

    /// Encoder channel A
    pub const ENC_A: i32 = 0;

    /// Encoder channel B
    pub const ENC_B: i32 = 1;

    // =========================================================================
    // RS485
    // =========================================================================

    /// UART TX to the transceiver DI
    pub const RS485_TX: i32 = 21;

    /// UART RX from the transceiver RO
    pub const RS485_RX: i32 = 20;

    /// Transceiver driver enable
    pub const RS485_DE: i32 = 2;

    // =========================================================================
    // Front panel
    // =========================================================================

    /// Advance button (active low)
    pub const BTN_FORWARD: i32 = 18;

    /// Retract button (active low)
    pub const BTN_BACKWARD: i32 = 19;

    /// I2C data line (also has onboard blue LED - will flicker during I2C)
    pub const I2C_SDA: i32 = 8;

    /// I2C clock line (also shared with BOOT button - only affects programming)
    pub const I2C_SCL: i32 = 9;

    /// Default I2C address for SSD1306 OLED
    pub const OLED_I2C_ADDR: u8 = 0x3C;

    // =========================================================================
    // Peel motor (instead of the display)
    // =========================================================================

    /// Peel bridge input 1
    pub const PEEL_IN1: i32 = 8;

    /// Peel bridge input 2
    pub const PEEL_IN2: i32 = 9;
}
