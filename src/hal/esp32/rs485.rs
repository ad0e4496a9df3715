//! RS485 transceiver on an ESP32 UART.
//!
//! # Wiring
//!
//! - TX → GPIO21 → transceiver DI
//! - RX → GPIO20 ← transceiver RO
//! - DE and /RE → GPIO2
//!
//! The UART driver buffers received bytes in its own ring; each poll
//! drains what has arrived and stamps it with the current time. Bytes
//! that land in the same poll share a timestamp, which is well inside
//! the inter-byte timeout as long as the bus loop runs every few
//! hundred microseconds.

use esp_idf_hal::delay::{BLOCK, NON_BLOCK};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Output, PinDriver};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::prelude::*;
use esp_idf_hal::sys::EspError;
use esp_idf_hal::uart::{config::Config, Uart, UartDriver};
use heapless::Deque;

use crate::traits::{HalfDuplexBus, RxByte};

/// Bus speed used by the feeder network.
pub const RS485_BAUD: u32 = 57_600;

/// Bytes pulled from the driver per poll.
const CHUNK: usize = 32;

/// Half-duplex RS485 link over a UART with a driver-enable pin.
pub struct Esp32Rs485<'d> {
    uart: UartDriver<'d>,
    de: PinDriver<'d, AnyOutputPin, Output>,
    pending: Deque<RxByte, 64>,
}

impl<'d> Esp32Rs485<'d> {
    /// Opens the UART at [`RS485_BAUD`] with the transceiver in receive mode.
    ///
    /// # Errors
    ///
    /// Returns an error if UART or GPIO initialization fails.
    pub fn new<U: Uart>(
        uart: impl Peripheral<P = U> + 'd,
        tx: AnyIOPin,
        rx: AnyIOPin,
        de: AnyOutputPin,
    ) -> Result<Self, EspError> {
        let config = Config::default().baudrate(Hertz(RS485_BAUD));
        let uart = UartDriver::new(
            uart,
            tx,
            rx,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &config,
        )?;
        let mut de = PinDriver::output(de)?;
        de.set_low()?;

        Ok(Self {
            uart,
            de,
            pending: Deque::new(),
        })
    }

    fn now_us() -> u64 {
        // Safe: plain read of the hardware timer
        unsafe { esp_idf_hal::sys::esp_timer_get_time() }.max(0) as u64
    }

    fn refill(&mut self) {
        let mut buf = [0u8; CHUNK];
        let room = self.pending.capacity() - self.pending.len();
        let want = room.min(CHUNK);
        if want == 0 {
            return;
        }
        let read = match self.uart.read(&mut buf[..want], NON_BLOCK) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(?err, "uart read failed");
                return;
            }
        };
        let at_us = Self::now_us();
        for &byte in &buf[..read] {
            // Capacity was checked above
            let _ = self.pending.push_back(RxByte { byte, at_us });
        }
    }
}

impl HalfDuplexBus for Esp32Rs485<'_> {
    type Error = EspError;

    fn read(&mut self) -> Option<RxByte> {
        if self.pending.is_empty() {
            self.refill();
        }
        self.pending.pop_front()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let n = self.uart.write(rest)?;
            rest = &rest[n..];
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.uart.wait_tx_done(BLOCK)
    }

    fn set_driver_enabled(&mut self, enabled: bool) -> Result<(), Self::Error> {
        if enabled {
            self.de.set_high()
        } else {
            self.de.set_low()
        }
    }
}
