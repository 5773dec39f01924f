use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use crate::config::ReliabilityConfig;
use crate::congestion::{CongestionWindow, RttEstimate};
use crate::engine::{EngineStats, ReliabilityEngine, SequenceAllocator};
use crate::error::EngineError;
use crate::packet::{Packet, PacketType};
use crate::receive_buffer::{Delivery, ReceiveBuffer};
use crate::retransmit_tracker::RetransmitTracker;
use crate::safe_converter::PrecheckedCast;
use crate::sequence_number::SequenceNumber;

#[derive(Default)]
struct Counters {
    sent: u64,
    received: u64,
    lost: u64,
    retransmitted: u64,
}

/// Reliability engine with a separate mutex per piece of state. No lock is held while
///  acquiring another one except for tracker -> congestion window in the send path, so there
///  is no lock ordering issue.
pub struct LockedEngine {
    config: ReliabilityConfig,
    sequence: SequenceAllocator,
    tracker: Mutex<RetransmitTracker>,
    congestion: Mutex<CongestionWindow>,
    rtt: Mutex<RttEstimate>,
    receive_buffer: Mutex<ReceiveBuffer>,
    counters: Mutex<Counters>,
}

/// The guarded state is consistent after every single operation, so a panic while holding a
///  lock can not leave it half-modified
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LockedEngine {
    /// NB: the config is expected to be validated
    pub fn new(config: ReliabilityConfig) -> LockedEngine {
        LockedEngine {
            sequence: SequenceAllocator::new(),
            tracker: Mutex::new(RetransmitTracker::new(config.unacked_table_size)),
            congestion: Mutex::new(CongestionWindow::from_config(&config)),
            rtt: Mutex::new(RttEstimate::from_config(&config)),
            receive_buffer: Mutex::new(ReceiveBuffer::from_config(&config)),
            counters: Default::default(),
            config,
        }
    }

    fn effective_window(&self) -> u32 {
        lock(&self.congestion).cwnd().min(self.config.window_size)
    }

    /// the caller must hold the tracker lock until the packet is recorded
    fn check_window(&self, tracker: &RetransmitTracker) -> Result<(), EngineError> {
        let num_in_flight: u32 = tracker.len().prechecked_cast();
        let window = self.effective_window();
        if num_in_flight >= window {
            debug!("send window full: {} packets in flight", num_in_flight);
            return Err(EngineError::WindowFull { in_flight: num_in_flight, window });
        }
        Ok(())
    }

    /// An unacknowledged packet still holding the next sequence number's slot blocks sending
    ///  just like a full window does
    fn allocate_vacant(&self, tracker: &RetransmitTracker) -> Result<SequenceNumber, EngineError> {
        self.sequence.allocate_if(|seq| tracker.is_slot_vacant(seq))
            .ok_or_else(|| {
                debug!("slot for the next sequence number is still in flight");
                EngineError::WindowFull { in_flight: tracker.len().prechecked_cast(), window: self.effective_window() }
            })
    }

    fn record(&self, tracker: &mut RetransmitTracker, packet: Packet, now: Instant) -> Result<(), EngineError> {
        let sequence_number = packet.sequence_number();
        if !tracker.record(packet, now) {
            warn!("packet #{} is already in flight", sequence_number);
            return Err(EngineError::SlotCollision { sequence_number });
        }
        Ok(())
    }
}

impl ReliabilityEngine for LockedEngine {
    fn next_sequence_number(&self) -> SequenceNumber {
        self.sequence.allocate()
    }

    fn send_budget(&self) -> u32 {
        let num_in_flight: u32 = lock(&self.tracker).len().prechecked_cast();
        lock(&self.congestion).send_budget(self.config.window_size, num_in_flight)
    }

    fn send_at(&self, packet: Packet, now: Instant) -> Result<(), EngineError> {
        if !packet.is_data() {
            trace!("{} - not tracked", packet);
            return Ok(());
        }

        {
            // the gate check and the insert must be atomic
            let mut tracker = lock(&self.tracker);
            self.check_window(&tracker)?;
            self.record(&mut tracker, packet, now)?;
        }

        lock(&self.counters).sent += 1;
        Ok(())
    }

    fn send_data_at(&self, payload: Bytes, now: Instant) -> Result<Packet, EngineError> {
        let packet = {
            let mut tracker = lock(&self.tracker);
            self.check_window(&tracker)?;
            let packet = Packet::data(self.allocate_vacant(&tracker)?, payload);
            self.record(&mut tracker, packet.clone(), now)?;
            packet
        };

        lock(&self.counters).sent += 1;
        Ok(packet)
    }

    fn is_unacknowledged(&self, sequence_number: SequenceNumber) -> bool {
        lock(&self.tracker).is_unacknowledged(sequence_number)
    }

    fn retry_count(&self, sequence_number: SequenceNumber) -> Option<u32> {
        lock(&self.tracker).retry_count(sequence_number)
    }

    fn handle_ack_at(&self, packet: &Packet, now: Instant) -> Result<bool, EngineError> {
        if !packet.has_ack() {
            return Err(EngineError::NotAnAck);
        }
        let ack_number = packet.ack_number();

        let entry = {
            let mut tracker = lock(&self.tracker);
            match tracker.acknowledge(ack_number) {
                Some(entry) => entry,
                None => {
                    let highest_issued = self.sequence.highest_issued(tracker.highest_recorded());
                    if ack_number.prev().is_after(highest_issued) {
                        warn!("ACK {} for a packet that was never sent - highest issued is #{}", ack_number, highest_issued);
                        return Err(EngineError::FutureAck { ack_number, highest_issued });
                    }
                    debug!("duplicate or unknown ACK {} - ignoring", ack_number);
                    return Ok(false);
                }
            }
        };

        let sample = now.saturating_duration_since(entry.sent_at);
        {
            let mut rtt = lock(&self.rtt);
            *rtt = rtt.on_sample(sample, self.config.min_retransmission_timeout, self.config.max_retransmission_timeout);
        }
        {
            let mut congestion = lock(&self.congestion);
            *congestion = congestion.on_ack(self.config.window_size, self.config.congestion_avoidance);
        }
        Ok(true)
    }

    fn receive(&self, packet: Packet) -> Result<Vec<Packet>, EngineError> {
        match packet.packet_type() {
            PacketType::Data => {
                let delivery = lock(&self.receive_buffer).receive(packet)?;
                match delivery {
                    Delivery::Duplicate => Ok(Vec::new()),
                    Delivery::Accepted(released) => {
                        lock(&self.counters).received += 1;
                        Ok(released)
                    }
                }
            }
            PacketType::Syn if packet.has_ack() => {
                Ok(lock(&self.receive_buffer).advance(packet.sequence_number().next()))
            }
            PacketType::Syn => {
                Ok(lock(&self.receive_buffer).resync(packet.sequence_number().next()))
            }
            _ => {
                trace!("{} - ignored on receive path", packet);
                Ok(Vec::new())
            }
        }
    }

    fn timed_out_packets(&self, now: Instant) -> Vec<Packet> {
        let timeout = lock(&self.rtt).rto();
        let expired = lock(&self.tracker).scan_expired(now, timeout);
        if expired.is_empty() {
            return Vec::new();
        }

        {
            let mut counters = lock(&self.counters);
            counters.lost += expired.iter().filter(|e| e.retry_count == 1).count() as u64;
            counters.retransmitted += expired.len() as u64;
        }
        debug!("{} packets timed out", expired.len());
        self.on_loss();

        expired.into_iter()
            .map(|e| e.packet)
            .collect()
    }

    fn on_loss(&self) {
        let mut congestion = lock(&self.congestion);
        *congestion = congestion.on_loss();
    }

    fn stats(&self) -> EngineStats {
        let (sent, received, lost, retransmitted) = {
            let counters = lock(&self.counters);
            (counters.sent, counters.received, counters.lost, counters.retransmitted)
        };
        let congestion = *lock(&self.congestion);
        let rtt = *lock(&self.rtt);

        EngineStats {
            sent,
            received,
            lost,
            retransmitted,
            congestion_window: congestion.cwnd(),
            slow_start_threshold: congestion.ssthresh(),
            rtt_estimate: rtt.srtt(),
            retransmission_timeout: rtt.rto(),
            unacknowledged: lock(&self.tracker).len(),
        }
    }
}
