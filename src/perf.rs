//! Performance monitor.
//!
//! A passive observer: nothing here feeds back into control decisions.
//! Every counter is an atomic with exactly one writing component, so the
//! control tick, the link layer and the state machine can all record
//! without locks:
//!
//! | Writer | Counters |
//! |--------|----------|
//! | control loop | ticks, overruns, max jitter, encoder glitches |
//! | link layer | frames, checksum drops, address ignores, timeouts, replies |
//! | state machine | moves, move time, faults, calibrations |
//!
//! [`reset`](PerformanceMonitor::reset) is the one exception; it is only
//! reached from an explicit reset-performance command.

use portable_atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::FaultCode;

/// Lock-free counters.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    control_ticks: AtomicU32,
    overruns: AtomicU32,
    max_jitter_us: AtomicU32,
    encoder_glitches: AtomicU32,

    moves_completed: AtomicU32,
    moves_failed: AtomicU32,
    move_time_us: AtomicU64,
    calibrations: AtomicU32,
    faults: [AtomicU32; FaultCode::COUNT],

    frames_received: AtomicU32,
    checksum_drops: AtomicU32,
    address_ignored: AtomicU32,
    inter_byte_timeouts: AtomicU32,
    replies_sent: AtomicU32,
    error_replies: AtomicU32,
}

/// Plain copy of all counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PerfSnapshot {
    /// Control periods executed.
    pub control_ticks: u32,
    /// Periods that started at least one full period late.
    pub overruns: u32,
    /// Worst deviation from the nominal period in microseconds.
    pub max_jitter_us: u32,
    /// Encoder samples rejected as implausible.
    pub encoder_glitches: u32,
    /// Moves that reached their target.
    pub moves_completed: u32,
    /// Moves that ended in a fault.
    pub moves_failed: u32,
    /// Total time spent in completed moves.
    pub move_time_us: u64,
    /// Successful calibration runs.
    pub calibrations: u32,
    /// Count per [`FaultCode`], in [`FaultCode::ALL`] order.
    pub faults: [u32; FaultCode::COUNT],
    /// Frames that passed the checksum.
    pub frames_received: u32,
    /// Frames dropped for a bad checksum.
    pub checksum_drops: u32,
    /// Valid frames addressed to another feeder.
    pub address_ignored: u32,
    /// Partial frames discarded after an inter-byte gap.
    pub inter_byte_timeouts: u32,
    /// Replies transmitted.
    pub replies_sent: u32,
    /// Error replies transmitted.
    pub error_replies: u32,
}

impl PerfSnapshot {
    /// Mean duration of a completed move.
    pub fn average_move_us(&self) -> u32 {
        if self.moves_completed == 0 {
            0
        } else {
            (self.move_time_us / self.moves_completed as u64).min(u32::MAX as u64) as u32
        }
    }

    /// Count for one fault kind.
    pub fn fault_count(&self, code: FaultCode) -> u32 {
        self.faults[code.index()]
    }
}

impl PerformanceMonitor {
    /// All counters zero.
    pub fn new() -> Self {
        Self::default()
    }

    // ---- control loop ----

    /// Record one control tick given the measured interval since the last.
    pub fn record_tick(&self, interval_us: u32, period_us: u32) {
        self.control_ticks.fetch_add(1, Ordering::Relaxed);
        let jitter = interval_us.abs_diff(period_us);
        self.max_jitter_us.fetch_max(jitter, Ordering::Relaxed);
        if interval_us >= period_us.saturating_mul(2) {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an encoder sample rejected by the glitch filter.
    pub fn record_glitch(&self) {
        self.encoder_glitches.fetch_add(1, Ordering::Relaxed);
    }

    // ---- state machine ----

    /// Record a completed move and its duration.
    pub fn record_move(&self, duration_us: u64) {
        self.moves_completed.fetch_add(1, Ordering::Relaxed);
        self.move_time_us.fetch_add(duration_us, Ordering::Relaxed);
    }

    /// Record a move that ended in a fault.
    pub fn record_move_failed(&self) {
        self.moves_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful calibration.
    pub fn record_calibration(&self) {
        self.calibrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fault by kind.
    pub fn record_fault(&self, code: FaultCode) {
        self.faults[code.index()].fetch_add(1, Ordering::Relaxed);
    }

    // ---- link layer ----

    /// Record a frame that passed the checksum.
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a checksum drop.
    pub fn record_checksum_drop(&self) {
        self.checksum_drops.fetch_add(1, Ordering::Relaxed);
        self.record_fault(FaultCode::CommChecksum);
    }

    /// Record a frame for another address.
    pub fn record_address_ignored(&self) {
        self.address_ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a partial frame discarded by the inter-byte timeout.
    pub fn record_inter_byte_timeout(&self) {
        self.inter_byte_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transmitted reply.
    pub fn record_reply(&self, is_error: bool) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.error_replies.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> PerfSnapshot {
        let r = |a: &AtomicU32| a.load(Ordering::Relaxed);
        let mut faults = [0; FaultCode::COUNT];
        for (dst, src) in faults.iter_mut().zip(self.faults.iter()) {
            *dst = r(src);
        }
        PerfSnapshot {
            control_ticks: r(&self.control_ticks),
            overruns: r(&self.overruns),
            max_jitter_us: r(&self.max_jitter_us),
            encoder_glitches: r(&self.encoder_glitches),
            moves_completed: r(&self.moves_completed),
            moves_failed: r(&self.moves_failed),
            move_time_us: self.move_time_us.load(Ordering::Relaxed),
            calibrations: r(&self.calibrations),
            faults,
            frames_received: r(&self.frames_received),
            checksum_drops: r(&self.checksum_drops),
            address_ignored: r(&self.address_ignored),
            inter_byte_timeouts: r(&self.inter_byte_timeouts),
            replies_sent: r(&self.replies_sent),
            error_replies: r(&self.error_replies),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        let z = |a: &AtomicU32| a.store(0, Ordering::Relaxed);
        z(&self.control_ticks);
        z(&self.overruns);
        z(&self.max_jitter_us);
        z(&self.encoder_glitches);
        z(&self.moves_completed);
        z(&self.moves_failed);
        self.move_time_us.store(0, Ordering::Relaxed);
        z(&self.calibrations);
        self.faults.iter().for_each(z);
        z(&self.frames_received);
        z(&self.checksum_drops);
        z(&self.address_ignored);
        z(&self.inter_byte_timeouts);
        z(&self.replies_sent);
        z(&self.error_replies);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_jitter_tracks_worst_case() {
        let perf = PerformanceMonitor::new();
        perf.record_tick(1000, 1000);
        perf.record_tick(1040, 1000);
        perf.record_tick(990, 1000);
        let snap = perf.snapshot();
        assert_eq!(snap.control_ticks, 3);
        assert_eq!(snap.max_jitter_us, 40);
        assert_eq!(snap.overruns, 0);

        perf.record_tick(2100, 1000);
        assert_eq!(perf.snapshot().overruns, 1);
    }

    #[test]
    fn average_move_time() {
        let perf = PerformanceMonitor::new();
        assert_eq!(perf.snapshot().average_move_us(), 0);
        perf.record_move(40_000);
        perf.record_move(60_000);
        assert_eq!(perf.snapshot().average_move_us(), 50_000);
    }

    #[test]
    fn faults_counted_by_kind() {
        let perf = PerformanceMonitor::new();
        perf.record_fault(FaultCode::MotionStall);
        perf.record_fault(FaultCode::MotionStall);
        perf.record_checksum_drop();
        let snap = perf.snapshot();
        assert_eq!(snap.fault_count(FaultCode::MotionStall), 2);
        assert_eq!(snap.fault_count(FaultCode::CommChecksum), 1);
        assert_eq!(snap.checksum_drops, 1);
    }

    #[test]
    fn reset_zeroes_everything() {
        let perf = PerformanceMonitor::new();
        perf.record_tick(1500, 1000);
        perf.record_move(10);
        perf.record_fault(FaultCode::EmergencyStop);
        perf.record_reply(true);
        perf.reset();
        assert_eq!(perf.snapshot(), PerfSnapshot::default());
    }
}
