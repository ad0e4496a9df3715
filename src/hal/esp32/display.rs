//! SSD1306 OLED status display for ESP32.
//!
//! Shows the feeder's lifecycle state in large type and, when the feeder
//! has stopped on a fault, the fault name underneath. An identify request
//! inverts the panel until the next lifecycle change.
//!
//! # Wiring
//!
//! - SDA → GPIO8 (also has onboard LED)
//! - SCL → GPIO9 (also shared with BOOT button)
//! - VCC → 3.3V
//! - GND → GND

use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, ascii::FONT_10X20, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    primitives::{PrimitiveStyle, Rectangle},
    text::Text,
};
use esp_idf_hal::i2c::I2cDriver;
use ssd1306::{mode::BufferedGraphicsMode, prelude::*, I2CDisplayInterface, Ssd1306};

use crate::error::FaultCode;
use crate::feeder::LifecycleState;
use crate::traits::StatusIndicator;

/// SSD1306 display type alias for cleaner code.
type DisplayDriver<'d> = Ssd1306<
    I2CInterface<I2cDriver<'d>>,
    DisplaySize128x64,
    BufferedGraphicsMode<DisplaySize128x64>,
>;

/// SSD1306 OLED display for ESP32.
///
/// # Display Layout
///
/// ```text
/// ┌────────────────────────────┐
/// │ feeder 9                   │
/// │                            │
/// │  MOVING                    │
/// │                            │
/// │████████████████████████████│  fault banner (inverted)
/// └────────────────────────────┘
/// ```
pub struct Esp32Display<'d> {
    display: DisplayDriver<'d>,
    address: u8,
}

impl<'d> Esp32Display<'d> {
    /// Creates and initializes the display.
    ///
    /// # Errors
    ///
    /// Returns an error if display initialization fails.
    pub fn new(i2c: I2cDriver<'d>, address: u8) -> Result<Self, DisplayError> {
        let interface = I2CDisplayInterface::new(i2c);
        let mut display = Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate0)
            .into_buffered_graphics_mode();
        display.init()?;
        display.clear(BinaryColor::Off)?;
        display.flush()?;

        Ok(Self { display, address })
    }

    /// Follow an address programmed over the bus.
    pub fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    fn render_identify(&mut self) -> Result<(), DisplayError> {
        self.display.clear(BinaryColor::On)?;
        let inverted = MonoTextStyle::new(&FONT_10X20, BinaryColor::Off);
        let mut label = heapless::String::<16>::new();
        let _ = core::fmt::write(&mut label, format_args!("ID {}", self.address));
        Text::new(&label, Point::new(4, 36), inverted).draw(&mut self.display)?;
        self.display.flush()?;
        Ok(())
    }

    fn render(&mut self, state: LifecycleState, fault: Option<FaultCode>) -> Result<(), DisplayError> {
        self.display.clear(BinaryColor::Off)?;

        let small = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
        let large = MonoTextStyle::new(&FONT_10X20, BinaryColor::On);

        let mut header = heapless::String::<16>::new();
        let _ = core::fmt::write(&mut header, format_args!("feeder {}", self.address));
        Text::new(&header, Point::new(2, 10), small).draw(&mut self.display)?;

        Text::new(state.as_str(), Point::new(4, 36), large).draw(&mut self.display)?;

        if let Some(fault) = fault {
            Rectangle::new(Point::new(0, 50), Size::new(128, 14))
                .into_styled(PrimitiveStyle::with_fill(BinaryColor::On))
                .draw(&mut self.display)?;
            let inverted = MonoTextStyle::new(&FONT_6X10, BinaryColor::Off);
            Text::new(fault.as_str(), Point::new(4, 60), inverted).draw(&mut self.display)?;
        }

        self.display.flush()?;
        Ok(())
    }
}

impl StatusIndicator for Esp32Display<'_> {
    fn show(&mut self, state: LifecycleState, fault: Option<FaultCode>) {
        if let Err(err) = self.render(state, fault) {
            tracing::warn!(?err, "display update failed");
        }
    }

    /// Inverts the whole panel until the next lifecycle change.
    fn identify(&mut self) {
        if let Err(err) = self.render_identify() {
            tracing::warn!(?err, "display update failed");
        }
    }
}

/// Display error type.
#[derive(Debug)]
pub struct DisplayError;

impl From<display_interface::DisplayError> for DisplayError {
    fn from(_: display_interface::DisplayError) -> Self {
        DisplayError
    }
}
