//! Quadrature encoder reader.
//!
//! [`EncoderCounter`] is written only from interrupt context and read by
//! the control loop and the feeder state machine. Two feed paths are
//! supported:
//!
//! - [`on_edge`](EncoderCounter::on_edge): software decode from a pin
//!   change interrupt. Transitions where both channels flip at once are
//!   impossible for a real encoder; they are counted and ignored.
//! - [`sync_hardware`](EncoderCounter::sync_hardware): a 16-bit hardware
//!   quadrature timer sampled faster than it can wrap. The wrapped
//!   difference is folded into the 32-bit count.
//!
//! [`set_inverted`](EncoderCounter::set_inverted) flips the sign of every
//! later step, for encoders mounted the other way round.
//!
//! The count is an atomic so that a 32-bit read never tears, even on
//! cores without native 32-bit atomics (`portable-atomic` covers those).
//!
//! ```rust
//! use gluon_feeder::encoder::EncoderCounter;
//!
//! let enc = EncoderCounter::new();
//! enc.sync_hardware(65_530);
//! enc.sync_hardware(4); // wrapped forward by 10
//! assert_eq!(enc.position(), -6 + 10);
//! ```

use portable_atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU8, Ordering};

/// Transition table indexed by `(prev << 2) | cur` over the 2-bit AB state.
/// `2` marks an impossible double transition.
const QDEC: [i8; 16] = [0, 1, -1, 2, -1, 0, 2, 1, 1, 2, 0, -1, 2, -1, 1, 0];

/// A point-in-time tick count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncoderSample {
    /// Signed ticks since boot.
    pub ticks: i32,
}

impl EncoderSample {
    /// Ticks moved since `earlier`, correct across 32-bit wraparound.
    pub fn delta_since(&self, earlier: EncoderSample) -> i32 {
        self.ticks.wrapping_sub(earlier.ticks)
    }
}

/// Interrupt-fed tick counter.
#[derive(Debug)]
pub struct EncoderCounter {
    count: AtomicI32,
    ab_state: AtomicU8,
    hw_last: AtomicU16,
    invalid: AtomicU32,
    inverted: AtomicBool,
}

impl Default for EncoderCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderCounter {
    /// Counter at zero with both channels low.
    pub const fn new() -> Self {
        Self {
            count: AtomicI32::new(0),
            ab_state: AtomicU8::new(0),
            hw_last: AtomicU16::new(0),
            invalid: AtomicU32::new(0),
            inverted: AtomicBool::new(false),
        }
    }

    /// Decode one pin-change interrupt.
    pub fn on_edge(&self, a: bool, b: bool) {
        let cur = ((a as u8) << 1) | b as u8;
        let prev = self.ab_state.swap(cur, Ordering::Relaxed);
        match QDEC[((prev << 2) | cur) as usize] {
            2 => {
                self.invalid.fetch_add(1, Ordering::Relaxed);
            }
            step => self.add(step as i32),
        }
    }

    /// Fold a 16-bit hardware counter reading into the count.
    ///
    /// Must be called at least once per half counter range of travel.
    pub fn sync_hardware(&self, raw: u16) {
        let last = self.hw_last.swap(raw, Ordering::Relaxed);
        let delta = raw.wrapping_sub(last) as i16;
        self.add(delta as i32);
    }

    fn add(&self, delta: i32) {
        let delta = if self.inverted.load(Ordering::Relaxed) {
            -delta
        } else {
            delta
        };
        self.count.fetch_add(delta, Ordering::Release);
    }

    /// Count in the opposite direction from now on.
    pub fn set_inverted(&self, inverted: bool) {
        self.inverted.store(inverted, Ordering::Relaxed);
    }

    /// True if steps are counted in the opposite direction.
    pub fn is_inverted(&self) -> bool {
        self.inverted.load(Ordering::Relaxed)
    }

    /// Current tick count.
    pub fn position(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    /// Current tick count as a sample.
    pub fn sample(&self) -> EncoderSample {
        EncoderSample {
            ticks: self.position(),
        }
    }

    /// Impossible transitions seen by [`on_edge`](Self::on_edge).
    pub fn invalid_transitions(&self) -> u32 {
        self.invalid.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_forward(enc: &EncoderCounter, steps: usize) {
        // 00 -> 01 -> 11 -> 10 -> 00
        const SEQ: [(bool, bool); 4] = [(false, true), (true, true), (true, false), (false, false)];
        for i in 0..steps {
            let (a, b) = SEQ[i % 4];
            enc.on_edge(a, b);
        }
    }

    #[test]
    fn decodes_forward_and_reverse() {
        let enc = EncoderCounter::new();
        step_forward(&enc, 8);
        assert_eq!(enc.position(), 8);

        // reverse: 00 -> 10 -> 11 -> 01 -> 00
        for (a, b) in [(true, false), (true, true), (false, true), (false, false)] {
            enc.on_edge(a, b);
        }
        assert_eq!(enc.position(), 4);
        assert_eq!(enc.invalid_transitions(), 0);
    }

    #[test]
    fn double_transition_is_counted_not_applied() {
        let enc = EncoderCounter::new();
        enc.on_edge(true, true); // 00 -> 11
        assert_eq!(enc.position(), 0);
        assert_eq!(enc.invalid_transitions(), 1);
    }

    #[test]
    fn repeated_state_is_ignored() {
        let enc = EncoderCounter::new();
        enc.on_edge(false, false);
        enc.on_edge(false, false);
        assert_eq!(enc.position(), 0);
        assert_eq!(enc.invalid_transitions(), 0);
    }

    #[test]
    fn hardware_counter_wraps_both_ways() {
        let enc = EncoderCounter::new();
        enc.sync_hardware(100);
        assert_eq!(enc.position(), 100);
        enc.sync_hardware(65_500); // -136 through zero
        assert_eq!(enc.position(), -36);
        enc.sync_hardware(20);
        assert_eq!(enc.position(), 20);
    }

    #[test]
    fn inverted_counter_negates_both_feeds() {
        let enc = EncoderCounter::new();
        step_forward(&enc, 4);
        enc.set_inverted(true);
        step_forward(&enc, 4);
        assert_eq!(enc.position(), 0);

        enc.sync_hardware(10);
        assert_eq!(enc.position(), -10);
        assert!(enc.is_inverted());
    }

    #[test]
    fn sample_delta_survives_i32_wrap() {
        let a = EncoderSample { ticks: i32::MAX - 5 };
        let b = EncoderSample {
            ticks: a.ticks.wrapping_add(10),
        };
        assert_eq!(b.delta_since(a), 10);
    }
}
