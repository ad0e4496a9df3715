//! ESP32-C3 SuperMini tape feeder firmware.
//!
//! This is the main entry point for the physical feeder. It runs two
//! threads:
//! - A control thread that polls the encoder and runs the PID loop at the
//!   configured period (1 kHz by default)
//! - The main thread, which services the RS485 bus, the front-panel
//!   buttons and the state machine
//!
//! Settings and the calibration profile persist in NVS when the `nvs`
//! feature is enabled; otherwise the feeder boots with defaults and an
//! uncalibrated profile every time. An address programmed over the bus is
//! written back to NVS as soon as it is accepted.
//!
//! The `peel` feature drives a cover-tape peel motor from the control
//! thread. It uses the display's pins, so the two cannot be combined.
//!
//! # Build
//!
//! ```bash
//! # Basic (motor + encoder + bus)
//! cargo build --release --bin esp32_main --features esp32
//!
//! # With persisted settings and status display
//! cargo build --release --bin esp32_main --features esp32,nvs,display
//!
//! # With persisted settings and peel motor
//! cargo build --release --bin esp32_main --features esp32,nvs,peel
//!
//! # Flash and monitor
//! espflash flash --monitor target/riscv32imc-esp-espidf/release/esp32_main
//! ```

#[cfg(all(feature = "display", feature = "peel"))]
compile_error!("`display` and `peel` both use GPIO8/9; enable only one");

use std::thread;

use esp_idf_hal::adc::oneshot::AdcDriver;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::{AnyInputPin, Input, PinDriver, Pull};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::prelude::*;
use tracing::{info, warn};

use gluon_feeder::config::FeederConfig;
use gluon_feeder::hal::esp32::{new_motor, Esp32Clock, Esp32Quadrature, Esp32Rs485, Esp32Sensors};
use gluon_feeder::traits::{CalibrationStore, Clock, StatusIndicator};
use gluon_feeder::{
    ButtonEvent, ControlLoop, ControlShared, EncoderCounter, FeederStateMachine,
    PerformanceMonitor, PhotonLink, SettingKey, SettingValue,
};

/// Buttons must read the same level this long to count.
const DEBOUNCE_US: u64 = 20_000;

/// Both buttons held this long clears a fault.
const BOTH_HELD_US: u64 = 1_000_000;

/// Bus loop pause between polls.
const BUS_POLL_MS: u32 = 1;

// =============================================================================
// Front panel
// =============================================================================

/// Debounced pair of active-low buttons.
///
/// A single button fires on release so that pressing the second button
/// turns the gesture into a both-held hold instead of a move.
struct Buttons<'d> {
    forward: PinDriver<'d, AnyInputPin, Input>,
    backward: PinDriver<'d, AnyInputPin, Input>,
    stable: (bool, bool),
    raw: (bool, bool),
    raw_since: u64,
    both_since: Option<u64>,
    chord: bool,
}

impl<'d> Buttons<'d> {
    fn new(forward: AnyInputPin, backward: AnyInputPin) -> anyhow::Result<Self> {
        let mut forward = PinDriver::input(forward)?;
        let mut backward = PinDriver::input(backward)?;
        forward.set_pull(Pull::Up)?;
        backward.set_pull(Pull::Up)?;
        Ok(Self {
            forward,
            backward,
            stable: (false, false),
            raw: (false, false),
            raw_since: 0,
            both_since: None,
            chord: false,
        })
    }

    fn poll(&mut self, now_us: u64) -> Option<ButtonEvent> {
        let raw = (self.forward.is_low(), self.backward.is_low());
        if raw != self.raw {
            self.raw = raw;
            self.raw_since = now_us;
        }
        if now_us.saturating_sub(self.raw_since) < DEBOUNCE_US || raw == self.stable {
            return self.check_hold(now_us);
        }

        let previous = self.stable;
        self.stable = raw;

        if raw.0 && raw.1 {
            self.both_since = Some(now_us);
            self.chord = true;
            return None;
        }
        self.both_since = None;

        if raw == (false, false) {
            let was_chord = core::mem::take(&mut self.chord);
            if was_chord {
                return None;
            }
            return match previous {
                (true, false) => Some(ButtonEvent::Forward),
                (false, true) => Some(ButtonEvent::Backward),
                _ => None,
            };
        }
        None
    }

    fn check_hold(&mut self, now_us: u64) -> Option<ButtonEvent> {
        match self.both_since {
            Some(since) if now_us.saturating_sub(since) >= BOTH_HELD_US => {
                self.both_since = None;
                Some(ButtonEvent::BothHeld)
            }
            _ => None,
        }
    }
}

/// Status indicator used when no display is fitted.
#[cfg(not(feature = "display"))]
struct LogIndicator;

#[cfg(not(feature = "display"))]
impl StatusIndicator for LogIndicator {
    fn show(&mut self, state: gluon_feeder::LifecycleState, fault: Option<gluon_feeder::FaultCode>) {
        match fault {
            Some(fault) => warn!(state = state.as_str(), fault = fault.as_str(), "status"),
            None => info!(state = state.as_str(), "status"),
        }
    }

    fn identify(&mut self) {
        info!("identify requested");
    }
}

/// Factory MAC padded to the 12-byte feeder id.
fn device_uuid() -> [u8; 12] {
    let mut mac = [0u8; 6];
    // Safe: writes exactly six bytes into the buffer
    unsafe {
        esp_idf_hal::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    let mut uuid = [0u8; 12];
    uuid[..6].copy_from_slice(&mac);
    uuid[6..].copy_from_slice(b"GLUON\0");
    uuid
}

fn main() -> anyhow::Result<()> {
    // Initialize ESP-IDF
    esp_idf_hal::sys::link_patches();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gluon_feeder=info,esp32_main=info".into()),
        )
        .without_time()
        .with_target(false)
        .init();

    println!();
    println!("================================");
    println!("  gluon-feeder SuperMini");
    println!("================================");
    println!();

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    // =========================================================================
    // Configuration and calibration storage
    // =========================================================================
    #[cfg(feature = "nvs")]
    let (config, store, persist) = {
        use esp_idf_svc::nvs::EspDefaultNvsPartition;
        use gluon_feeder::hal::esp32::Esp32Nvs;

        let nvs = Esp32Nvs::new(EspDefaultNvsPartition::take()?)?;
        let config = match FeederConfig::load(&nvs) {
            Ok(config) => config,
            Err(e) => {
                println!("[WARN] Stored settings rejected ({e}), using defaults");
                FeederConfig::default()
            }
        };
        println!("[OK] Settings loaded from NVS");
        let persist: Persist<Esp32Nvs> = |nvs, key, value| {
            if let Err(e) = nvs.write_setting(key, value) {
                warn!(setting = key.name(), error = %e, "setting not persisted");
            }
        };
        (config, nvs, persist)
    };

    #[cfg(not(feature = "nvs"))]
    let (config, store, persist) = {
        println!("[SKIP] NVS disabled, using default settings");
        let persist: Persist<gluon_feeder::hal::MockStore> = |_, key, _| {
            info!(setting = key.name(), "NVS disabled, setting kept until reset");
        };
        (FeederConfig::default(), gluon_feeder::hal::MockStore::new(), persist)
    };

    let device = config.device.clone().with_uuid(device_uuid());
    let config = config.with_device(device);

    // =========================================================================
    // Initialize Motor (H-bridge on GPIO5/6/7, sense GPIO10)
    // =========================================================================
    let motor = new_motor(
        pins.gpio5.downgrade_output(),
        pins.gpio6.downgrade_output(),
        pins.gpio7.downgrade_output(),
        pins.gpio10.downgrade_input(),
        peripherals.ledc.timer0,
        peripherals.ledc.channel0,
        peripherals.ledc.channel1,
        config.drive.mapping(),
    )?;
    println!("[OK] Motor initialized (GPIO5/6 PWM, GPIO7 enable)");

    // =========================================================================
    // Initialize Peel Motor (second bridge on GPIO8/9) - Optional
    // =========================================================================
    #[cfg(feature = "peel")]
    let peel_motor = {
        let motor = gluon_feeder::hal::esp32::new_peel_motor(
            pins.gpio8.downgrade_output(),
            pins.gpio9.downgrade_output(),
            peripherals.ledc.timer1,
            peripherals.ledc.channel2,
            peripherals.ledc.channel3,
            config.peel.mapping(),
        )?;
        println!("[OK] Peel motor initialized (GPIO8/9 PWM)");
        motor
    };

    // =========================================================================
    // Initialize RS485 (UART1 on GPIO20/21, DE on GPIO2)
    // =========================================================================
    let bus = Esp32Rs485::new(
        peripherals.uart1,
        pins.gpio21.downgrade(),
        pins.gpio20.downgrade(),
        pins.gpio2.downgrade_output(),
    )?;
    println!("[OK] RS485 initialized (address {})", config.bus.address);

    let mut buttons = Buttons::new(pins.gpio18.downgrade_input(), pins.gpio19.downgrade_input())?;
    println!("[OK] Buttons initialized (GPIO18/19)");

    // =========================================================================
    // Initialize Display (SSD1306 on GPIO8/9) - Optional
    // =========================================================================
    #[cfg(feature = "display")]
    let indicator = {
        use esp_idf_hal::i2c::{I2cConfig, I2cDriver};
        use gluon_feeder::hal::esp32::Esp32Display;

        let i2c = I2cDriver::new(
            peripherals.i2c0,
            pins.gpio8, // SDA
            pins.gpio9, // SCL
            &I2cConfig::new().baudrate(400.kHz().into()),
        )?;
        let disp = Esp32Display::new(i2c, config.bus.address)
            .map_err(|e| anyhow::anyhow!("Display init failed: {:?}", e))?;
        println!("[OK] Display initialized (GPIO8/9 I2C)");
        disp
    };

    #[cfg(not(feature = "display"))]
    let indicator = LogIndicator;

    // =========================================================================
    // Shared state
    // =========================================================================
    let shared = ControlShared::new();
    let encoder = EncoderCounter::new();
    let perf = PerformanceMonitor::new();
    let clock = Esp32Clock::new();
    let period_us = config.control.period_us.max(1) as u64;

    println!();
    println!("Controls:");
    println!("  Forward button:  advance one pitch");
    println!("  Backward button: retract one pitch");
    println!("  Hold both:       clear fault");
    println!();
    println!("Starting control loop ({} us period)...", period_us);
    println!();

    thread::scope(|scope| -> anyhow::Result<()> {
        // =====================================================================
        // Control thread: encoder polling + PID tick
        // =====================================================================
        let control_config = config.control.clone();
        let (shared, encoder, perf) = (&shared, &encoder, &perf);
        let (adc, current_pin, temp_pin) = (peripherals.adc1, pins.gpio4, pins.gpio3);
        let (enc_a, enc_b) = (pins.gpio0.downgrade_input(), pins.gpio1.downgrade_input());
        thread::Builder::new()
            .name("control".into())
            .stack_size(8 * 1024)
            .spawn_scoped(scope, move || {
                // The ADC driver is borrowed by the sensor channels, so both
                // live on this thread.
                let adc1 = match AdcDriver::new(adc) {
                    Ok(adc1) => adc1,
                    Err(e) => {
                        println!("[FAIL] ADC init failed: {e}");
                        return;
                    }
                };
                let sensors = match Esp32Sensors::new(&adc1, current_pin, temp_pin) {
                    Ok(sensors) => sensors,
                    Err(e) => {
                        println!("[FAIL] Sensor init failed: {e}");
                        return;
                    }
                };
                let mut quad = match Esp32Quadrature::new(enc_a, enc_b, encoder) {
                    Ok(quad) => quad,
                    Err(e) => {
                        println!("[FAIL] Encoder init failed: {e}");
                        return;
                    }
                };
                println!("[OK] Sensors and encoder initialized (GPIO3/4 ADC, GPIO0/1)");
                let mut control = ControlLoop::new(&control_config, shared, encoder, perf, motor, sensors);
                #[cfg(feature = "peel")]
                let mut peel = gluon_feeder::PeelDrive::new(peel_motor);
                let mut next_tick = clock.now_us();
                loop {
                    quad.poll();
                    let now = clock.now_us();
                    if now >= next_tick {
                        control.tick(now);
                        #[cfg(feature = "peel")]
                        if let Err(e) = peel.update(shared, now) {
                            warn!(error = %e, "peel motor write failed");
                        }
                        next_tick += period_us;
                        if now > next_tick {
                            next_tick = now + period_us;
                        }
                    }
                    thread::yield_now();
                }
            })?;

        // =====================================================================
        // Bus + state machine
        // =====================================================================
        run_feeder(config, shared, encoder, perf, store, persist, indicator, bus, &mut buttons, clock)
    })
}

/// Writes a setting changed over the bus back to storage.
type Persist<S> = fn(&mut S, SettingKey, SettingValue);

#[allow(clippy::too_many_arguments)]
fn run_feeder<S: CalibrationStore, I: StatusIndicator>(
    config: FeederConfig,
    shared: &ControlShared,
    encoder: &EncoderCounter,
    perf: &PerformanceMonitor,
    store: S,
    persist: Persist<S>,
    indicator: I,
    bus: Esp32Rs485<'_>,
    buttons: &mut Buttons<'_>,
    clock: Esp32Clock,
) -> anyhow::Result<()> {
    let mut link = PhotonLink::new(bus, &config.bus, perf);
    let mut feeder = FeederStateMachine::new(config, shared, encoder, perf, store, indicator);
    let mut last_report = clock.now_us();

    loop {
        let now = clock.now_us();

        if let Err(e) = feeder.service_bus(&mut link, now) {
            warn!(error = %e, "bus write failed");
        }
        if let Some((key, value)) = feeder.take_setting_to_persist() {
            persist(feeder.store_mut(), key, value);
        }

        if let Some(event) = buttons.poll(now) {
            let reply = feeder.handle_button(event, now);
            info!(?event, result = ?reply.result, "button");
        }

        if now.saturating_sub(last_report) >= 10_000_000 {
            last_report = now;
            let snap = perf.snapshot();
            info!(
                moves = snap.moves_completed,
                frames = snap.frames_received,
                drops = snap.checksum_drops,
                "alive"
            );
        }

        FreeRtos::delay_ms(BUS_POLL_MS);
    }
}
