//! Half-duplex link layer: receive filtering and reply scheduling.
//!
//! [`PhotonLink`] owns the bus. On receive it assembles frames, drops
//! checksum failures and frames for other feeders, and hands the rest up
//! as [`Received`]. Replies are queued with a due time (guard delay, plus
//! an address-ordered slot for broadcasts) and transmitted by
//! [`service_tx`](PhotonLink::service_tx) with the driver-enable line
//! raised only for the duration of the write.
//!
//! While the reply queue is full no further frames are taken off the bus,
//! so every frame handed up has room for its reply.

use heapless::Deque;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::error::FrameError;
use crate::perf::PerformanceMonitor;
use crate::traits::HalfDuplexBus;

use super::assembler::{Assembly, FrameAssembler};
use super::frame::ProtocolFrame;
use super::opcode::Opcode;

/// Replies that may wait for their slot at once.
pub const REPLY_QUEUE: usize = 4;

/// A frame accepted for dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    /// The frame.
    pub frame: ProtocolFrame,
    /// Arrival time of its last byte.
    pub at_us: u64,
}

#[derive(Clone, Debug)]
struct PendingReply {
    due_us: u64,
    frame: ProtocolFrame,
}

/// Bus endpoint for one feeder.
pub struct PhotonLink<'a, B: HalfDuplexBus> {
    bus: B,
    assembler: FrameAssembler,
    address: u8,
    guard_us: u32,
    slot_us: u32,
    pending: Deque<PendingReply, REPLY_QUEUE>,
    perf: &'a PerformanceMonitor,
}

impl<'a, B: HalfDuplexBus> PhotonLink<'a, B> {
    /// Wrap a bus using the addressing and timing in `config`.
    pub fn new(bus: B, config: &BusConfig, perf: &'a PerformanceMonitor) -> Self {
        Self {
            bus,
            assembler: FrameAssembler::new(config.inter_byte_timeout_us),
            address: config.address,
            guard_us: config.guard_delay_us,
            slot_us: config.broadcast_slot_us,
            pending: Deque::new(),
            perf,
        }
    }

    /// Apply new bus settings. Queued replies keep their due times.
    pub fn reconfigure(&mut self, config: &BusConfig) {
        self.address = config.address;
        self.guard_us = config.guard_delay_us;
        self.slot_us = config.broadcast_slot_us;
        self.assembler.set_timeout(config.inter_byte_timeout_us);
    }

    /// This feeder's bus address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Borrow the bus.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Mutably borrow the bus.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Replies waiting for their slot.
    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    /// Drain received bytes until a frame for this feeder is complete.
    ///
    /// Returns `None` without reading while the reply queue is full; the
    /// bytes wait in the bus buffer with their arrival times intact.
    pub fn poll_frame(&mut self, now_us: u64) -> Option<Received> {
        if self.pending.is_full() {
            return None;
        }
        while let Some(rx) = self.bus.read() {
            match self.assembler.push(rx) {
                Assembly::Pending => {}
                Assembly::Frame(frame) => {
                    self.perf.record_frame();
                    if frame.to == self.address || frame.is_broadcast() {
                        return Some(Received {
                            frame,
                            at_us: rx.at_us,
                        });
                    }
                    self.perf.record_address_ignored();
                }
                Assembly::Rejected(FrameError::InterByteTimeout) => {
                    self.perf.record_inter_byte_timeout();
                }
                Assembly::Rejected(e @ FrameError::Checksum { .. }) => {
                    debug!(error = %e, "frame dropped");
                    self.perf.record_checksum_drop();
                }
                Assembly::Rejected(e) => {
                    debug!(error = %e, "frame dropped");
                }
            }
        }
        if self.assembler.expire(now_us) {
            self.perf.record_inter_byte_timeout();
        }
        None
    }

    /// Schedule the reply to `request`. Returns false if the queue is full,
    /// which cannot happen for a request taken from [`poll_frame`](Self::poll_frame).
    pub fn queue_reply(&mut self, reply: ProtocolFrame, request: &Received) -> bool {
        let mut due_us = request.at_us + self.guard_us as u64;
        if request.frame.is_broadcast() {
            due_us += self.address as u64 * self.slot_us as u64;
        }
        if self.pending.push_back(PendingReply { due_us, frame: reply }).is_err() {
            warn!(packet_id = request.frame.packet_id, "reply queue full, reply dropped");
            return false;
        }
        true
    }

    /// Transmit every reply whose slot has arrived. Returns how many went out.
    pub fn service_tx(&mut self, now_us: u64) -> Result<usize, B::Error> {
        let mut sent = 0;
        while self.pending.front().is_some_and(|p| p.due_us <= now_us) {
            let Some(reply) = self.pending.pop_front() else {
                break;
            };
            self.transmit(&reply.frame)?;
            self.perf
                .record_reply(reply.frame.opcode == Opcode::Error as u8);
            sent += 1;
        }
        Ok(sent)
    }

    fn transmit(&mut self, frame: &ProtocolFrame) -> Result<(), B::Error> {
        let bytes = frame.encode();
        self.bus.set_driver_enabled(true)?;
        let result = self.bus.write(&bytes).and_then(|_| self.bus.flush());
        // the line must be released even if the write failed
        let released = self.bus.set_driver_enabled(false);
        result.and(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockBus;
    use crate::protocol::BROADCAST;

    const HOST: u8 = 0xF0;

    fn config() -> BusConfig {
        BusConfig::default().with_address(5)
    }

    #[test]
    fn accepts_own_and_broadcast_frames() {
        let perf = PerformanceMonitor::new();
        let mut link = PhotonLink::new(MockBus::new(), &config(), &perf);
        let own = ProtocolFrame::new(5, HOST, 1, 0x10, &[]).unwrap();
        let other = ProtocolFrame::new(6, HOST, 2, 0x10, &[]).unwrap();
        let all = ProtocolFrame::new(BROADCAST, HOST, 3, 0x10, &[]).unwrap();
        link.bus_mut().inject(&own, 0);
        link.bus_mut().inject(&other, 100);
        link.bus_mut().inject(&all, 200);

        assert_eq!(link.poll_frame(300).unwrap().frame, own);
        assert_eq!(link.poll_frame(300).unwrap().frame, all);
        assert!(link.poll_frame(300).is_none());

        let snap = perf.snapshot();
        assert_eq!(snap.frames_received, 3);
        assert_eq!(snap.address_ignored, 1);
    }

    #[test]
    fn corrupted_frame_is_counted_not_answered() {
        let perf = PerformanceMonitor::new();
        let mut link = PhotonLink::new(MockBus::new(), &config(), &perf);
        let mut bytes = ProtocolFrame::new(5, HOST, 1, 0x04, &[10]).unwrap().encode();
        bytes[6] ^= 0xFF;
        link.bus_mut().inject_bytes(&bytes, 0);
        assert!(link.poll_frame(100).is_none());
        assert_eq!(perf.snapshot().checksum_drops, 1);
    }

    #[test]
    fn reply_waits_for_guard_delay() {
        let perf = PerformanceMonitor::new();
        let mut link = PhotonLink::new(MockBus::new(), &config(), &perf);
        let request = ProtocolFrame::new(5, HOST, 9, 0x10, &[]).unwrap();
        link.bus_mut().inject(&request, 0);
        let rx = link.poll_frame(10).unwrap();
        let reply = ProtocolFrame::new(HOST, 5, 9, 0x10, &[0]).unwrap();
        assert!(link.queue_reply(reply.clone(), &rx));

        assert_eq!(link.service_tx(rx.at_us + 100).unwrap(), 0);
        assert_eq!(link.service_tx(rx.at_us + 500).unwrap(), 1);
        assert_eq!(link.bus().sent_frames(), vec![reply]);
        // driver enabled only around the write
        assert_eq!(link.bus().driver_log, vec![true, false]);
        assert_eq!(perf.snapshot().replies_sent, 1);
    }

    #[test]
    fn broadcast_reply_slotted_by_address() {
        let perf = PerformanceMonitor::new();
        let mut link = PhotonLink::new(MockBus::new(), &config(), &perf);
        let request = ProtocolFrame::new(BROADCAST, HOST, 1, 0x01, &[]).unwrap();
        link.bus_mut().inject(&request, 0);
        let rx = link.poll_frame(10).unwrap();
        link.queue_reply(ProtocolFrame::new(HOST, 5, 1, 0x01, &[0]).unwrap(), &rx);

        // guard 500 + 5 * 1000
        assert_eq!(link.service_tx(rx.at_us + 5_499).unwrap(), 0);
        assert_eq!(link.service_tx(rx.at_us + 5_500).unwrap(), 1);
    }

    #[test]
    fn stale_partial_frame_expires() {
        let perf = PerformanceMonitor::new();
        let mut link = PhotonLink::new(MockBus::new(), &config(), &perf);
        link.bus_mut().inject_bytes(&[5, HOST, 1], 0);
        assert!(link.poll_frame(100).is_none());
        assert!(link.poll_frame(10_000).is_none());
        assert_eq!(perf.snapshot().inter_byte_timeouts, 1);
    }

    #[test]
    fn queue_overflow_drops_reply() {
        let perf = PerformanceMonitor::new();
        let mut link = PhotonLink::new(MockBus::new(), &config(), &perf);
        let rx = Received {
            frame: ProtocolFrame::new(5, HOST, 1, 0x10, &[]).unwrap(),
            at_us: 0,
        };
        for _ in 0..REPLY_QUEUE {
            assert!(link.queue_reply(rx.frame.clone(), &rx));
        }
        assert!(!link.queue_reply(rx.frame.clone(), &rx));
        assert_eq!(link.pending_replies(), REPLY_QUEUE);
    }

    #[test]
    fn full_queue_holds_requests_on_the_bus() {
        let perf = PerformanceMonitor::new();
        let mut link = PhotonLink::new(MockBus::new(), &config(), &perf);
        for id in 0..(REPLY_QUEUE as u8 + 2) {
            let request = ProtocolFrame::new(BROADCAST, HOST, id, 0x10, &[]).unwrap();
            link.bus_mut().inject(&request, u64::from(id) * 1_000);
        }

        // every request taken off the bus gets a reply slot
        let mut answered = 0;
        while let Some(rx) = link.poll_frame(10_000) {
            let reply = ProtocolFrame::new(HOST, 5, rx.frame.packet_id, 0x10, &[0]).unwrap();
            assert!(link.queue_reply(reply, &rx));
            answered += 1;
        }
        assert_eq!(answered, REPLY_QUEUE);

        // once slots drain the held requests are read
        assert_eq!(link.service_tx(1_000_000).unwrap(), REPLY_QUEUE);
        while let Some(rx) = link.poll_frame(1_000_000) {
            let reply = ProtocolFrame::new(HOST, 5, rx.frame.packet_id, 0x10, &[0]).unwrap();
            assert!(link.queue_reply(reply, &rx));
        }
        assert_eq!(link.service_tx(2_000_000).unwrap(), 2);
        let ids: Vec<u8> = link.bus().sent_frames().iter().map(|f| f.packet_id).collect();
        assert_eq!(ids, (0..REPLY_QUEUE as u8 + 2).collect::<Vec<_>>());
        assert_eq!(perf.snapshot().inter_byte_timeouts, 0);
    }
}
