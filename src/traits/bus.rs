//! Half-duplex serial bus abstraction.
//!
//! An RS485 transceiver shares one pair of wires between transmit and
//! receive. The driver-enable (DE) line selects the direction; the link
//! layer raises it only for the duration of a reply.

/// A received byte stamped with its arrival time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxByte {
    /// The byte.
    pub byte: u8,
    /// Arrival time in microseconds (same epoch as [`Clock`]).
    ///
    /// [`Clock`]: crate::traits::Clock
    pub at_us: u64,
}

/// Half-duplex byte transport with driver-enable control.
///
/// Receive is non-blocking: the UART interrupt fills a queue and
/// [`read`](Self::read) drains it from the processing context.
pub trait HalfDuplexBus {
    /// Error type for transmit operations.
    type Error;

    /// Next received byte, if any.
    fn read(&mut self) -> Option<RxByte>;

    /// Queue bytes for transmission.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Wait until the last queued bit has left the shift register.
    fn flush(&mut self) -> Result<(), Self::Error>;

    /// Drive (true) or release (false) the bus.
    fn set_driver_enabled(&mut self, enabled: bool) -> Result<(), Self::Error>;
}
