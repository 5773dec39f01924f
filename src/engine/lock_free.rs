use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use crate::buffers::bounded_queue::BoundedQueue;
use crate::buffers::slot_table::SlotTable;
use crate::config::ReliabilityConfig;
use crate::congestion::{CongestionWindow, RttEstimate};
use crate::engine::{EngineStats, ReliabilityEngine, SequenceAllocator};
use crate::error::EngineError;
use crate::packet::{Packet, PacketType};
use crate::receive_buffer::{Delivery, ReceiveBuffer};
use crate::retransmit_tracker::{Expired, UnackedEntry};
use crate::sequence_number::SequenceNumber;

/// Work for the receive ordering buffer
enum Work {
    Data(Packet),
    Resync { next_expected: SequenceNumber, forward_only: bool },
}

type Outcome = Arc<OnceLock<Result<Vec<Packet>, EngineError>>>;

/// Work queued by a caller that found the ordering buffer busy. Whoever processes it stores
///  the result in `outcome`, where the queueing caller picks it up.
struct Inbound {
    work: Work,
    outcome: Outcome,
}

/// The receive ordering buffer, accessible only to whoever wins the `draining` flag. A caller
///  that does not get the flag leaves its work in the queue and keeps trying to take the flag
///  until somebody processed its work.
struct DrainCell {
    draining: AtomicBool,
    buffer: UnsafeCell<ReceiveBuffer>,
}

// the buffer is only ever accessed through a DrainGuard
unsafe impl Sync for DrainCell {}

impl DrainCell {
    fn try_acquire(&self) -> Option<DrainGuard<'_>> {
        self.draining.compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| DrainGuard { cell: self })
    }
}

struct DrainGuard<'a> {
    cell: &'a DrainCell,
}

impl Deref for DrainGuard<'_> {
    type Target = ReceiveBuffer;

    fn deref(&self) -> &ReceiveBuffer {
        // the guard's existence means we won the `draining` flag
        unsafe { &*self.cell.buffer.get() }
    }
}

impl DerefMut for DrainGuard<'_> {
    fn deref_mut(&mut self) -> &mut ReceiveBuffer {
        unsafe { &mut *self.cell.buffer.get() }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.cell.draining.store(false, Ordering::SeqCst);
    }
}

/// Reliability engine without locks. Unacknowledged packets live in a [SlotTable] indexed
///  by sequence number, and scalar state is updated by compare-and-swap. Inbound packets go
///  through a [BoundedQueue] to whichever caller is currently draining.
///
/// Congestion window and RTT estimate are packed into one `u64` each, so every update applies
///  the same transition as the locked engine to a consistent snapshot.
pub struct LockFreeEngine {
    config: ReliabilityConfig,
    sequence: SequenceAllocator,

    unacked: SlotTable<UnackedEntry>,
    /// reserved before inserting into `unacked`, which makes the flow control gate atomic
    num_in_flight: AtomicU32,
    /// `u64::MAX` if nothing was recorded yet
    highest_recorded: AtomicU64,

    congestion: AtomicU64,
    rtt: AtomicU64,

    inbound: BoundedQueue<Inbound>,
    ordering: DrainCell,
    /// published by the drainer to filter duplicates before they are queued
    next_expected: AtomicU32,

    sent: AtomicU64,
    received: AtomicU64,
    lost: AtomicU64,
    retransmitted: AtomicU64,
}

impl LockFreeEngine {
    const NOTHING_RECORDED: u64 = u64::MAX;

    /// NB: the config is expected to be validated
    pub fn new(config: ReliabilityConfig) -> LockFreeEngine {
        let receive_buffer = ReceiveBuffer::from_config(&config);
        let next_expected = receive_buffer.next_expected().to_raw();
        let queue_capacity = config.receive_buffer_capacity.next_power_of_two().max(2);

        LockFreeEngine {
            sequence: SequenceAllocator::new(),
            unacked: SlotTable::new(config.unacked_table_size),
            num_in_flight: AtomicU32::new(0),
            highest_recorded: AtomicU64::new(Self::NOTHING_RECORDED),
            congestion: AtomicU64::new(CongestionWindow::from_config(&config).to_bits()),
            rtt: AtomicU64::new(RttEstimate::from_config(&config).to_bits()),
            inbound: BoundedQueue::new(queue_capacity),
            ordering: DrainCell {
                draining: AtomicBool::new(false),
                buffer: UnsafeCell::new(receive_buffer),
            },
            next_expected: AtomicU32::new(next_expected),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            retransmitted: AtomicU64::new(0),
            config,
        }
    }

    fn congestion_window(&self) -> CongestionWindow {
        CongestionWindow::from_bits(self.congestion.load(Ordering::Acquire))
    }

    fn update_congestion_window(&self, f: impl Fn(CongestionWindow) -> CongestionWindow) {
        let _ = self.congestion.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            Some(f(CongestionWindow::from_bits(bits)).to_bits())
        });
    }

    fn rtt_estimate(&self) -> RttEstimate {
        RttEstimate::from_bits(self.rtt.load(Ordering::Acquire))
    }

    fn highest_recorded(&self) -> Option<SequenceNumber> {
        match self.highest_recorded.load(Ordering::Acquire) {
            Self::NOTHING_RECORDED => None,
            raw => Some(SequenceNumber::from_raw(raw as u32)),
        }
    }

    fn update_highest_recorded(&self, sequence_number: SequenceNumber) {
        let _ = self.highest_recorded.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            let highest = match raw {
                Self::NOTHING_RECORDED => sequence_number,
                raw => SequenceNumber::from_raw(raw as u32).latest(sequence_number),
            };
            Some(highest.to_raw() as u64)
        });
    }

    fn with_unacked<R>(&self, sequence_number: SequenceNumber, f: impl FnOnce(&UnackedEntry) -> R) -> Option<R> {
        self.unacked.with_entry(sequence_number.to_raw(), |entry| {
            (entry.packet.sequence_number() == sequence_number).then(|| f(entry))
        })
        .flatten()
    }

    fn effective_window(&self) -> u32 {
        self.congestion_window().cwnd().min(self.config.window_size)
    }

    fn reserve_in_flight(&self) -> Result<(), EngineError> {
        let window = self.effective_window();
        self.num_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < window).then_some(n + 1))
            .map(|_| ())
            .map_err(|in_flight| {
                debug!("send window full: {} packets in flight", in_flight);
                EngineError::WindowFull { in_flight, window }
            })
    }

    /// NB: requires an in-flight reservation, which is released if the packet's slot is taken
    fn track(&self, packet: Packet, now: Instant) -> Result<(), EngineError> {
        let sequence_number = packet.sequence_number();
        let entry = UnackedEntry {
            packet,
            sent_at: now,
            retries: 0,
        };
        if self.unacked.try_insert(sequence_number.to_raw(), entry).is_err() {
            self.num_in_flight.fetch_sub(1, Ordering::AcqRel);
            warn!("slot for packet #{} is occupied", sequence_number);
            return Err(EngineError::SlotCollision { sequence_number });
        }

        trace!("tracking #{}", sequence_number);
        self.update_highest_recorded(sequence_number);
        self.sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Processes `work` directly if the ordering buffer is free. Otherwise the work is queued,
    ///  and the caller helps draining the queue until its own result is there.
    fn receive_inbound(&self, work: Work) -> Result<Vec<Packet>, EngineError> {
        let outcome = Outcome::default();
        let mut pending = Some(Inbound { work, outcome: outcome.clone() });

        loop {
            if let Some(mut buffer) = self.ordering.try_acquire() {
                if let Some(own) = pending.take() {
                    let result = self.process(&mut buffer, own.work);
                    self.drain_queue(&mut buffer);
                    return result;
                }
                self.drain_queue(&mut buffer);
            }
            else if let Some(own) = pending.take() {
                if let Err(rejected) = self.inbound.push(own) {
                    trace!("receive queue full - retrying");
                    pending = Some(rejected);
                }
            }

            if let Some(result) = outcome.get() {
                return result.clone();
            }
            std::thread::yield_now();
        }
    }

    fn drain_queue(&self, buffer: &mut ReceiveBuffer) {
        while let Some(inbound) = self.inbound.pop() {
            let result = self.process(buffer, inbound.work);
            if let Err(e) = &result {
                debug!("queued packet failed: {}", e);
            }
            let _ = inbound.outcome.set(result);
        }
    }

    fn process(&self, buffer: &mut ReceiveBuffer, work: Work) -> Result<Vec<Packet>, EngineError> {
        let released = match work {
            Work::Data(packet) => match buffer.receive(packet)? {
                Delivery::Duplicate => Vec::new(),
                Delivery::Accepted(released) => {
                    self.received.fetch_add(1, Ordering::AcqRel);
                    released
                }
            },
            Work::Resync { next_expected, forward_only: true } => buffer.advance(next_expected),
            Work::Resync { next_expected, forward_only: false } => buffer.resync(next_expected),
        };
        self.next_expected.store(buffer.next_expected().to_raw(), Ordering::Release);
        Ok(released)
    }
}

impl ReliabilityEngine for LockFreeEngine {
    fn next_sequence_number(&self) -> SequenceNumber {
        self.sequence.allocate()
    }

    fn send_budget(&self) -> u32 {
        self.congestion_window().send_budget(self.config.window_size, self.num_in_flight.load(Ordering::Acquire))
    }

    fn send_at(&self, packet: Packet, now: Instant) -> Result<(), EngineError> {
        if !packet.is_data() {
            trace!("{} - not tracked", packet);
            return Ok(());
        }

        self.reserve_in_flight()?;
        self.track(packet, now)
    }

    fn send_data_at(&self, payload: Bytes, now: Instant) -> Result<Packet, EngineError> {
        // reserving first means a full window never uses up a sequence number
        self.reserve_in_flight()?;
        let Some(sequence_number) = self.sequence.allocate_if(|seq| self.unacked.is_vacant(seq.to_raw())) else {
            let in_flight = self.num_in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
            debug!("slot for the next sequence number is still in flight");
            return Err(EngineError::WindowFull { in_flight, window: self.effective_window() });
        };
        let packet = Packet::data(sequence_number, payload);
        self.track(packet.clone(), now)?;
        Ok(packet)
    }

    fn is_unacknowledged(&self, sequence_number: SequenceNumber) -> bool {
        self.with_unacked(sequence_number, |_| ()).is_some()
    }

    fn retry_count(&self, sequence_number: SequenceNumber) -> Option<u32> {
        self.with_unacked(sequence_number, |entry| entry.retries)
    }

    fn handle_ack_at(&self, packet: &Packet, now: Instant) -> Result<bool, EngineError> {
        if !packet.has_ack() {
            return Err(EngineError::NotAnAck);
        }
        let ack_number = packet.ack_number();
        let sequence_number = ack_number.prev();

        let removed = self.unacked.remove_if(sequence_number.to_raw(), |entry| entry.packet.sequence_number() == sequence_number);
        let Some(entry) = removed else {
            let highest_issued = self.sequence.highest_issued(self.highest_recorded());
            if sequence_number.is_after(highest_issued) {
                warn!("ACK {} for a packet that was never sent - highest issued is #{}", ack_number, highest_issued);
                return Err(EngineError::FutureAck { ack_number, highest_issued });
            }
            debug!("duplicate or unknown ACK {} - ignoring", ack_number);
            return Ok(false);
        };

        trace!("acknowledged #{}", sequence_number);
        self.num_in_flight.fetch_sub(1, Ordering::AcqRel);

        let sample = now.saturating_duration_since(entry.sent_at);
        let _ = self.rtt.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            Some(RttEstimate::from_bits(bits)
                .on_sample(sample, self.config.min_retransmission_timeout, self.config.max_retransmission_timeout)
                .to_bits())
        });
        self.update_congestion_window(|w| w.on_ack(self.config.window_size, self.config.congestion_avoidance));
        Ok(true)
    }

    fn receive(&self, packet: Packet) -> Result<Vec<Packet>, EngineError> {
        match packet.packet_type() {
            PacketType::Data => {
                let next_expected = SequenceNumber::from_raw(self.next_expected.load(Ordering::Acquire));
                if packet.sequence_number().is_before(next_expected) {
                    debug!("duplicate packet #{} - ignoring", packet.sequence_number());
                    return Ok(Vec::new());
                }
                self.receive_inbound(Work::Data(packet))
            }
            PacketType::Syn => {
                self.receive_inbound(Work::Resync {
                    next_expected: packet.sequence_number().next(),
                    forward_only: packet.has_ack(),
                })
            }
            _ => {
                trace!("{} - ignored on receive path", packet);
                Ok(Vec::new())
            }
        }
    }

    fn timed_out_packets(&self, now: Instant) -> Vec<Packet> {
        let timeout = self.rtt_estimate().rto();

        let mut expired = Vec::new();
        self.unacked.for_each(|entry| {
            if now.saturating_duration_since(entry.sent_at) > timeout {
                entry.sent_at = now;
                entry.retries += 1;
                expired.push(Expired {
                    packet: entry.packet.clone(),
                    retry_count: entry.retries,
                });
            }
        });

        if expired.is_empty() {
            return Vec::new();
        }

        if let Some(highest) = self.highest_recorded() {
            let reference = highest.next();
            expired.sort_by_key(|e| e.packet.sequence_number().distance_from(reference));
        }

        self.lost.fetch_add(expired.iter().filter(|e| e.retry_count == 1).count() as u64, Ordering::AcqRel);
        self.retransmitted.fetch_add(expired.len() as u64, Ordering::AcqRel);
        debug!("{} packets timed out", expired.len());
        self.on_loss();

        expired.into_iter()
            .map(|e| e.packet)
            .collect()
    }

    fn on_loss(&self) {
        self.update_congestion_window(|w| w.on_loss());
    }

    fn stats(&self) -> EngineStats {
        let congestion = self.congestion_window();
        let rtt = self.rtt_estimate();

        EngineStats {
            sent: self.sent.load(Ordering::Acquire),
            received: self.received.load(Ordering::Acquire),
            lost: self.lost.load(Ordering::Acquire),
            retransmitted: self.retransmitted.load(Ordering::Acquire),
            congestion_window: congestion.cwnd(),
            slow_start_threshold: congestion.ssthresh(),
            rtt_estimate: rtt.srtt(),
            retransmission_timeout: rtt.rto(),
            unacknowledged: self.num_in_flight.load(Ordering::Acquire) as usize,
        }
    }
}
