//! Quadrature encoder input for ESP32.
//!
//! The ESP32-C3 has no pulse counter peripheral, so both channels are
//! polled from the control thread and every level change is handed to
//! [`EncoderCounter::on_edge`]. Poll well above the highest edge rate;
//! a missed edge shows up as an invalid transition.
//!
//! # Wiring
//!
//! - A → GPIO0
//! - B → GPIO1
//! - VCC → 3.3V
//! - GND → GND

use esp_idf_hal::gpio::{AnyInputPin, Input, PinDriver, Pull};

use crate::encoder::EncoderCounter;

/// Polled quadrature decoder feeding a shared [`EncoderCounter`].
///
/// # Example
///
/// ```ignore
/// use gluon_feeder::encoder::EncoderCounter;
/// use gluon_feeder::hal::esp32::Esp32Quadrature;
///
/// let counter = EncoderCounter::new();
/// let mut quad = Esp32Quadrature::new(
///     peripherals.pins.gpio0.downgrade_input(),
///     peripherals.pins.gpio1.downgrade_input(),
///     &counter,
/// )?;
///
/// loop {
///     quad.poll();
/// }
/// ```
pub struct Esp32Quadrature<'d, 'c> {
    /// Channel A input
    a: PinDriver<'d, AnyInputPin, Input>,
    /// Channel B input
    b: PinDriver<'d, AnyInputPin, Input>,
    /// Last sampled levels
    last: (bool, bool),
    counter: &'c EncoderCounter,
}

impl<'d, 'c> Esp32Quadrature<'d, 'c> {
    /// Creates the decoder with internal pull-ups on both channels.
    ///
    /// The counter's decoder state is primed with the current levels, so a
    /// shaft resting between detents may cost one invalid transition at boot.
    ///
    /// # Errors
    ///
    /// Returns an error if GPIO initialization fails.
    pub fn new(
        a_pin: AnyInputPin,
        b_pin: AnyInputPin,
        counter: &'c EncoderCounter,
    ) -> Result<Self, esp_idf_hal::sys::EspError> {
        let mut a = PinDriver::input(a_pin)?;
        let mut b = PinDriver::input(b_pin)?;
        a.set_pull(Pull::Up)?;
        b.set_pull(Pull::Up)?;

        let last = (a.is_high(), b.is_high());
        counter.on_edge(last.0, last.1);

        Ok(Self { a, b, last, counter })
    }

    /// Samples both channels and forwards a change to the counter.
    #[inline]
    pub fn poll(&mut self) {
        let now = (self.a.is_high(), self.b.is_high());
        if now != self.last {
            self.last = now;
            self.counter.on_edge(now.0, now.1);
        }
    }
}
