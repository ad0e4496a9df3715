//! Bridge current and heatsink temperature sensing via ESP32 ADC.
//!
//! # Wiring
//!
//! - Bridge current output → GPIO4 (ADC1)
//! - TMP36 output → GPIO3 (ADC1)
//!
//! # Calibration
//!
//! The bridge current output is a voltage proportional to load current;
//! the scale depends on the module's sense resistor. The default of
//! 2 mA per mV matches a 0.5 Ω shunt; adjust with
//! [`Esp32Sensors::with_current_scale`] after checking against a known load.

use core::cell::RefCell;

use esp_idf_hal::adc::attenuation::DB_11;
use esp_idf_hal::adc::oneshot::config::AdcChannelConfig;
use esp_idf_hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_hal::adc::ADC1;
use esp_idf_hal::gpio::{Gpio3, Gpio4};
use esp_idf_hal::peripheral::Peripheral;

use crate::traits::FaultDetector;

/// Full-scale input at 11 dB attenuation, millivolts.
const FULL_SCALE_MV: u32 = 3100;

/// Largest 12-bit reading.
const MAX_RAW: u32 = 4095;

type Channel<'d, P> = AdcChannelDriver<'d, P, &'d AdcDriver<'d, ADC1>>;

/// Current and temperature readings for the control loop.
///
/// The control loop reads through `&self`; the ADC channels need `&mut`
/// for a conversion, so they sit in `RefCell`s. Only the control thread
/// ever touches them.
///
/// # Example
///
/// ```ignore
/// use gluon_feeder::hal::esp32::Esp32Sensors;
/// use gluon_feeder::traits::FaultDetector;
///
/// let adc1 = AdcDriver::new(peripherals.adc1)?;
/// let sensors = Esp32Sensors::new(&adc1, peripherals.pins.gpio4, peripherals.pins.gpio3)?;
/// println!("{:?} mA, {:?} C", sensors.current_ma(), sensors.temperature_c());
/// ```
pub struct Esp32Sensors<'d> {
    current: RefCell<Channel<'d, Gpio4>>,
    temperature: RefCell<Channel<'d, Gpio3>>,
    ma_per_mv: f32,
}

impl<'d> Esp32Sensors<'d> {
    /// Creates both ADC channels.
    ///
    /// # Errors
    ///
    /// Returns an error if ADC channel initialization fails.
    pub fn new(
        adc: &'d AdcDriver<'d, ADC1>,
        current_pin: impl Peripheral<P = Gpio4> + 'd,
        temp_pin: impl Peripheral<P = Gpio3> + 'd,
    ) -> Result<Self, esp_idf_hal::sys::EspError> {
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        Ok(Self {
            current: RefCell::new(AdcChannelDriver::new(adc, current_pin, &config)?),
            temperature: RefCell::new(AdcChannelDriver::new(adc, temp_pin, &config)?),
            ma_per_mv: 2.0,
        })
    }

    /// Sets the current sense scale.
    pub fn with_current_scale(mut self, ma_per_mv: f32) -> Self {
        self.ma_per_mv = ma_per_mv;
        self
    }

    fn millivolts<P>(channel: &RefCell<Channel<'d, P>>) -> Option<u32>
    where
        P: esp_idf_hal::gpio::ADCPin<Adc = ADC1>,
    {
        let raw = channel.borrow_mut().read().ok()? as u32;
        Some(raw.min(MAX_RAW) * FULL_SCALE_MV / MAX_RAW)
    }
}

impl FaultDetector for Esp32Sensors<'_> {
    fn current_ma(&self) -> Option<u32> {
        Self::millivolts(&self.current).map(|mv| (mv as f32 * self.ma_per_mv) as u32)
    }

    fn temperature_c(&self) -> Option<i32> {
        // TMP36: 500 mV at 0 C, 10 mV per degree
        Self::millivolts(&self.temperature).map(|mv| (mv as i32 - 500) / 10)
    }
}
