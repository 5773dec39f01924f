use std::time::{Duration, Instant};
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::packet::Packet;
use crate::safe_converter::PrecheckedCast;
use crate::sequence_number::SequenceNumber;

#[derive(Debug, Clone)]
pub struct UnackedEntry {
    pub packet: Packet,
    pub sent_at: Instant,
    pub retries: u32,
}

/// A packet whose retransmission timeout expired, re-offered for sending
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Expired {
    pub packet: Packet,
    /// number of retransmissions including this one
    pub retry_count: u32,
}

/// Keeps track of DATA packets that were sent but not yet acknowledged. Control packets are
///  fire-and-forget and never tracked.
///
/// Entries are keyed by slot, `sequence_number & (num_slots - 1)`, with at most one entry per
///  slot. This is the same admission rule as the lock-free engine's table, so both engines
///  accept and refuse exactly the same packets.
pub struct RetransmitTracker {
    entries: FxHashMap<u32, UnackedEntry>,
    mask: u32,
    highest_recorded: Option<SequenceNumber>,
}

impl RetransmitTracker {
    /// NB: `num_slots` must be a power of two, which is ensured by configuration validation
    pub fn new(num_slots: usize) -> RetransmitTracker {
        assert!(num_slots.is_power_of_two(), "number of slots must be a power of two: {}", num_slots);
        let mask: u32 = (num_slots - 1).prechecked_cast();

        RetransmitTracker {
            entries: FxHashMap::default(),
            mask,
            highest_recorded: None,
        }
    }

    fn slot(&self, sequence_number: SequenceNumber) -> u32 {
        sequence_number.to_raw() & self.mask
    }

    /// `true` if a packet with this sequence number could be recorded now
    pub fn is_slot_vacant(&self, sequence_number: SequenceNumber) -> bool {
        !self.entries.contains_key(&self.slot(sequence_number))
    }

    /// Returns `true` if the packet is tracked as a result of this call: non-DATA packets and
    ///  packets whose slot is taken, typically by the same sequence number, are left alone.
    pub fn record(&mut self, packet: Packet, now: Instant) -> bool {
        if !packet.is_data() {
            return false;
        }

        let sequence_number = packet.sequence_number();
        if !self.is_slot_vacant(sequence_number) {
            return false;
        }

        trace!("tracking #{}", sequence_number);
        self.highest_recorded = Some(match self.highest_recorded {
            Some(highest) => highest.latest(sequence_number),
            None => sequence_number,
        });
        let slot = self.slot(sequence_number);
        self.entries.insert(slot, UnackedEntry {
            packet,
            sent_at: now,
            retries: 0,
        });
        true
    }

    fn get(&self, sequence_number: SequenceNumber) -> Option<&UnackedEntry> {
        self.entries.get(&self.slot(sequence_number))
            .filter(|e| e.packet.sequence_number() == sequence_number)
    }

    /// `ack_number` is the next sequence number the peer expects, so this acknowledges the
    ///  packet before it. Unknown and duplicate acknowledgments return `None`.
    pub fn acknowledge(&mut self, ack_number: SequenceNumber) -> Option<UnackedEntry> {
        let sequence_number = ack_number.prev();
        self.get(sequence_number)?;

        trace!("acknowledged #{}", sequence_number);
        let slot = self.slot(sequence_number);
        self.entries.remove(&slot)
    }

    pub fn is_unacknowledged(&self, sequence_number: SequenceNumber) -> bool {
        self.get(sequence_number).is_some()
    }

    pub fn retry_count(&self, sequence_number: SequenceNumber) -> Option<u32> {
        self.get(sequence_number)
            .map(|e| e.retries)
    }

    pub fn highest_recorded(&self) -> Option<SequenceNumber> {
        self.highest_recorded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns all entries that were (re)sent more than `timeout` ago, oldest sequence number
    ///  first. Each returned entry counts as resent at `now`, so it is offered again only
    ///  after another full timeout.
    pub fn scan_expired(&mut self, now: Instant, timeout: Duration) -> Vec<Expired> {
        let mut result = self.entries.values_mut()
            .filter(|e| now.saturating_duration_since(e.sent_at) > timeout)
            .map(|e| {
                e.sent_at = now;
                e.retries += 1;
                Expired {
                    packet: e.packet.clone(),
                    retry_count: e.retries,
                }
            })
            .collect::<Vec<_>>();

        if let Some(highest) = self.highest_recorded {
            let reference = highest.next();
            result.sort_by_key(|e| e.packet.sequence_number().distance_from(reference));
        }
        result
    }
}
