//! H-bridge motor driver using ESP32 LEDC PWM.
//!
//! The bridge is controlled via two PWM inputs and an enable line:
//! - IN1 (GPIO5): forward PWM
//! - IN2 (GPIO6): reverse PWM
//! - EN (GPIO7): bridge enable, read back on GPIO10
//!
//! The LEDC channels and GPIO drivers implement the `embedded-hal` 1.0
//! traits, so the pins are wrapped in [`PwmBridge`] and the mapping from
//! relative duty to bridge percent comes from [`HBridgeMotor`].
//!
//! The optional peel motor sits on a second bridge with its enable tied
//! high, so [`PeelPins`] only drives the two PWM inputs.

use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::prelude::*;

use esp_idf_hal::sys::EspError;

use crate::motor::{HBridgeMotor, HBridgeOutput, PwmBridge, PwmMapping, PwmPins};

/// Bridge pins as wired on the SuperMini.
pub type Esp32Pins<'d> = PwmBridge<
    LedcDriver<'d>,
    LedcDriver<'d>,
    PinDriver<'d, AnyOutputPin, Output>,
    PinDriver<'d, AnyInputPin, Input>,
>;

/// Motor driver for the feeder's H-bridge.
pub type Esp32Motor<'d> = HBridgeMotor<Esp32Pins<'d>>;

/// PWM frequency in Hz (20kHz is above audible range)
const PWM_FREQ_HZ: u32 = 20_000;

/// PWM resolution (10-bit = 1024 steps)
const PWM_RESOLUTION: Resolution = Resolution::Bits10;

/// Creates the motor driver with the bridge disabled and both inputs low.
///
/// # Example
///
/// ```ignore
/// use gluon_feeder::hal::esp32::new_motor;
/// use gluon_feeder::motor::PwmMapping;
///
/// let peripherals = Peripherals::take()?;
/// let motor = new_motor(
///     peripherals.pins.gpio5.downgrade_output(),
///     peripherals.pins.gpio6.downgrade_output(),
///     peripherals.pins.gpio7.downgrade_output(),
///     peripherals.pins.gpio10.downgrade_input(),
///     peripherals.ledc.timer0,
///     peripherals.ledc.channel0,
///     peripherals.ledc.channel1,
///     PwmMapping::default(),
/// )?;
/// ```
///
/// # Errors
///
/// Returns an error if PWM or GPIO initialization fails.
#[allow(clippy::too_many_arguments)]
pub fn new_motor<'d, T, TI, LC, LCI, RC, RCI>(
    in1_pin: AnyOutputPin,
    in2_pin: AnyOutputPin,
    enable_pin: AnyOutputPin,
    sense_pin: AnyInputPin,
    timer: T,
    in1_channel: LC,
    in2_channel: RC,
    mapping: PwmMapping,
) -> Result<Esp32Motor<'d>, EspError>
where
    TI: esp_idf_hal::ledc::LedcTimer + 'd,
    T: Peripheral<P = TI> + 'd,
    LCI: esp_idf_hal::ledc::LedcChannel<SpeedMode = TI::SpeedMode> + 'd,
    LC: Peripheral<P = LCI> + 'd,
    RCI: esp_idf_hal::ledc::LedcChannel<SpeedMode = TI::SpeedMode> + 'd,
    RC: Peripheral<P = RCI> + 'd,
{
    let timer_config = TimerConfig::default()
        .frequency(PWM_FREQ_HZ.Hz())
        .resolution(PWM_RESOLUTION);
    let timer_driver = LedcTimerDriver::new(timer, &timer_config)?;

    let mut in1 = LedcDriver::new(in1_channel, &timer_driver, in1_pin)?;
    let mut in2 = LedcDriver::new(in2_channel, &timer_driver, in2_pin)?;
    in1.set_duty(0)?;
    in2.set_duty(0)?;

    let mut enable = PinDriver::output(enable_pin)?;
    enable.set_low()?;
    let mut sense = PinDriver::input(sense_pin)?;
    sense.set_pull(Pull::Down)?;

    Ok(HBridgeMotor::new(
        PwmBridge::new(in1, in2, enable, sense),
        mapping,
    ))
}

/// Peel bridge inputs; the bridge enable is hard-wired.
pub struct PeelPins<'d> {
    in1: LedcDriver<'d>,
    in2: LedcDriver<'d>,
}

impl PwmPins for PeelPins<'_> {
    type Error = EspError;

    fn set_outputs(&mut self, out: HBridgeOutput) -> Result<(), EspError> {
        let max = self.in1.get_max_duty();
        self.in1.set_duty(max * u32::from(out.in1.min(100)) / 100)?;
        self.in2.set_duty(max * u32::from(out.in2.min(100)) / 100)
    }

    fn set_enable(&mut self, _on: bool) -> Result<(), EspError> {
        Ok(())
    }

    fn enable_feedback(&self) -> bool {
        false
    }
}

/// Peel motor driver.
pub type Esp32PeelMotor<'d> = HBridgeMotor<PeelPins<'d>>;

/// Creates the peel motor driver with both inputs low.
///
/// # Errors
///
/// Returns an error if PWM initialization fails.
pub fn new_peel_motor<'d, T, TI, LC, LCI, RC, RCI>(
    in1_pin: AnyOutputPin,
    in2_pin: AnyOutputPin,
    timer: T,
    in1_channel: LC,
    in2_channel: RC,
    mapping: PwmMapping,
) -> Result<Esp32PeelMotor<'d>, EspError>
where
    TI: esp_idf_hal::ledc::LedcTimer + 'd,
    T: Peripheral<P = TI> + 'd,
    LCI: esp_idf_hal::ledc::LedcChannel<SpeedMode = TI::SpeedMode> + 'd,
    LC: Peripheral<P = LCI> + 'd,
    RCI: esp_idf_hal::ledc::LedcChannel<SpeedMode = TI::SpeedMode> + 'd,
    RC: Peripheral<P = RCI> + 'd,
{
    let timer_config = TimerConfig::default()
        .frequency(PWM_FREQ_HZ.Hz())
        .resolution(PWM_RESOLUTION);
    let timer_driver = LedcTimerDriver::new(timer, &timer_config)?;

    let mut in1 = LedcDriver::new(in1_channel, &timer_driver, in1_pin)?;
    let mut in2 = LedcDriver::new(in2_channel, &timer_driver, in2_pin)?;
    in1.set_duty(0)?;
    in2.set_duty(0)?;

    Ok(HBridgeMotor::new(PeelPins { in1, in2 }, mapping))
}
