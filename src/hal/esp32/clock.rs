//! Microsecond time base from the ESP-IDF high-resolution timer.

use crate::traits::Clock;

/// Reads `esp_timer_get_time()`.
///
/// The timer is a 64-bit microsecond count since boot, so it never wraps
/// in practice. Both the control thread and the bus loop stamp time with
/// it, which keeps their epochs equal.
#[derive(Clone, Copy, Debug, Default)]
pub struct Esp32Clock;

impl Esp32Clock {
    /// Clock handle; carries no state.
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for Esp32Clock {
    #[inline]
    fn now_us(&self) -> u64 {
        // Safe: reads the timer and has no side effects
        unsafe { esp_idf_hal::sys::esp_timer_get_time() }.max(0) as u64
    }
}
