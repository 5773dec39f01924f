use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::config::ReliabilityConfig;
use crate::error::EngineError;
use crate::packet::Packet;
use crate::sequence_number::SequenceNumber;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Delivery {
    /// The sequence number was delivered or buffered before. This is normal with
    ///  retransmission and not an error.
    Duplicate,
    /// The packet was accepted; contains all packets that became deliverable in sequence
    ///  order, which may be none if there is still a gap
    Accepted(Vec<Packet>),
}

/// Holds back DATA packets that arrive out of order and releases them strictly in sequence.
///
/// A sequence number counts as seen if it is before `next_expected` or currently buffered, so
///  duplicate suppression needs no memory beyond the buffered packets themselves.
pub struct ReceiveBuffer {
    next_expected: SequenceNumber,
    buffered: FxHashMap<SequenceNumber, Packet>,
    capacity: usize,
}

impl ReceiveBuffer {
    pub fn new(next_expected: SequenceNumber, capacity: usize) -> ReceiveBuffer {
        ReceiveBuffer {
            next_expected,
            buffered: FxHashMap::default(),
            capacity,
        }
    }

    pub fn from_config(config: &ReliabilityConfig) -> ReceiveBuffer {
        Self::new(SequenceNumber::from_raw(config.initial_receive_sequence), config.receive_buffer_capacity)
    }

    pub fn next_expected(&self) -> SequenceNumber {
        self.next_expected
    }

    /// number of packets held back waiting for a gap to be filled
    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_duplicate(&self, sequence_number: SequenceNumber) -> bool {
        sequence_number.is_before(self.next_expected) || self.buffered.contains_key(&sequence_number)
    }

    /// NB: The capacity limits only packets that must be held back. The packet that fills the
    ///      gap at `next_expected` is always accepted, otherwise a full buffer could never drain.
    pub fn receive(&mut self, packet: Packet) -> Result<Delivery, EngineError> {
        let sequence_number = packet.sequence_number();
        if self.is_duplicate(sequence_number) {
            debug!("duplicate packet #{} - ignoring", sequence_number);
            return Ok(Delivery::Duplicate);
        }

        if sequence_number != self.next_expected && self.buffered.len() >= self.capacity {
            warn!("receive buffer full ({} packets) - dropping packet #{}", self.capacity, sequence_number);
            return Err(EngineError::BufferOverflow { capacity: self.capacity });
        }

        trace!("buffering packet #{}", sequence_number);
        self.buffered.insert(sequence_number, packet);
        Ok(Delivery::Accepted(self.drain()))
    }

    /// Moves the receive position to `next_expected`, e.g. because the peer (re)started its
    ///  sequence. Buffered packets before the new position are discarded, buffered packets
    ///  that became deliverable are returned.
    pub fn resync(&mut self, next_expected: SequenceNumber) -> Vec<Packet> {
        debug!("resync: next expected #{} -> #{}", self.next_expected, next_expected);
        self.next_expected = next_expected;
        self.buffered.retain(|seq, _| !seq.is_before(next_expected));
        self.drain()
    }

    /// Like [ReceiveBuffer::resync], but never moves the receive position backwards. A live
    ///  connection re-synchronizes this way, since going back would deliver packets twice.
    pub fn advance(&mut self, next_expected: SequenceNumber) -> Vec<Packet> {
        if !next_expected.is_after(self.next_expected) {
            debug!("advance to #{} is not ahead of #{} - ignoring", next_expected, self.next_expected);
            return Vec::new();
        }
        self.resync(next_expected)
    }

    fn drain(&mut self) -> Vec<Packet> {
        let mut result = Vec::new();
        while let Some(packet) = self.buffered.remove(&self.next_expected) {
            trace!("releasing packet #{}", self.next_expected);
            result.push(packet);
            self.next_expected = self.next_expected.next();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use bytes::Bytes;

    fn seq(raw: u32) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn data(raw: u32) -> Packet {
        Packet::data(seq(raw), Bytes::from(format!("packet {}", raw)))
    }

    fn released(delivery: Delivery) -> Vec<u32> {
        match delivery {
            Delivery::Accepted(packets) => packets.iter().map(|p| p.sequence_number().to_raw()).collect(),
            Delivery::Duplicate => panic!("unexpected duplicate"),
        }
    }

    #[test]
    fn test_out_of_order_released_in_order() {
        let mut buffer = ReceiveBuffer::new(seq(1), 1000);
        assert!(buffer.resync(seq(501)).is_empty());

        assert_eq!(released(buffer.receive(data(503)).unwrap()), Vec::<u32>::new());
        assert_eq!(released(buffer.receive(data(501)).unwrap()), vec![501]);
        assert_eq!(buffer.len(), 1);
        assert_eq!(released(buffer.receive(data(502)).unwrap()), vec![502, 503]);

        assert_eq!(buffer.next_expected(), seq(504));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_payloads_survive() {
        let mut buffer = ReceiveBuffer::new(seq(1), 10);
        buffer.receive(data(2)).unwrap();
        match buffer.receive(data(1)).unwrap() {
            Delivery::Accepted(packets) => {
                assert_eq!(packets, vec![data(1), data(2)]);
            }
            Delivery::Duplicate => panic!(),
        }
    }

    #[rstest]
    #[case::delivered(1, true)]
    #[case::buffered(3, true)]
    #[case::gap(2, false)]
    #[case::ahead(4, false)]
    #[case::long_ago(0, true)]
    fn test_duplicates(#[case] raw: u32, #[case] expected_duplicate: bool) {
        let mut buffer = ReceiveBuffer::new(seq(1), 10);
        buffer.receive(data(1)).unwrap();
        buffer.receive(data(3)).unwrap();

        assert_eq!(buffer.is_duplicate(seq(raw)), expected_duplicate);
        let delivery = buffer.receive(data(raw)).unwrap();
        assert_eq!(delivery == Delivery::Duplicate, expected_duplicate);
    }

    #[test]
    fn test_each_packet_delivered_once() {
        let mut buffer = ReceiveBuffer::new(seq(10), 100);
        let mut delivered = Vec::new();
        for raw in [12, 10, 12, 11, 10, 13, 11, 13, 14] {
            if let Delivery::Accepted(packets) = buffer.receive(data(raw)).unwrap() {
                delivered.extend(packets.iter().map(|p| p.sequence_number().to_raw()));
            }
        }
        assert_eq!(delivered, vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_overflow() {
        let mut buffer = ReceiveBuffer::new(seq(1), 2);
        buffer.receive(data(3)).unwrap();
        buffer.receive(data(4)).unwrap();

        assert_eq!(buffer.receive(data(5)), Err(EngineError::BufferOverflow { capacity: 2 }));
        assert_eq!(buffer.len(), 2);

        // a duplicate is not an overflow
        assert_eq!(buffer.receive(data(4)), Ok(Delivery::Duplicate));

        // the gap filler is accepted even when the buffer is full
        assert_eq!(released(buffer.receive(data(1)).unwrap()), vec![1]);
        assert_eq!(released(buffer.receive(data(2)).unwrap()), vec![2, 3, 4]);

        // the rejected packet is accepted on retransmission
        assert_eq!(released(buffer.receive(data(5)).unwrap()), vec![5]);
    }

    #[test]
    fn test_resync_discards_stale_packets() {
        let mut buffer = ReceiveBuffer::new(seq(1), 10);
        buffer.receive(data(3)).unwrap();
        buffer.receive(data(5)).unwrap();
        buffer.receive(data(6)).unwrap();

        let released = buffer.resync(seq(5))
            .iter()
            .map(|p| p.sequence_number().to_raw())
            .collect::<Vec<_>>();
        assert_eq!(released, vec![5, 6]);
        assert_eq!(buffer.next_expected(), seq(7));
        assert!(buffer.is_empty());
    }

    #[rstest]
    #[case::behind(1, vec![], 3)]
    #[case::current(3, vec![], 3)]
    #[case::ahead(5, vec![5, 6], 7)]
    fn test_advance_moves_forward_only(#[case] target: u32, #[case] expected_released: Vec<u32>, #[case] expected_next: u32) {
        let mut buffer = ReceiveBuffer::new(seq(1), 10);
        buffer.receive(data(1)).unwrap();
        buffer.receive(data(2)).unwrap();
        buffer.receive(data(5)).unwrap();
        buffer.receive(data(6)).unwrap();

        let released = buffer.advance(seq(target))
            .iter()
            .map(|p| p.sequence_number().to_raw())
            .collect::<Vec<_>>();
        assert_eq!(released, expected_released);
        assert_eq!(buffer.next_expected(), seq(expected_next));
        assert!(buffer.is_duplicate(seq(1)));
    }

    #[test]
    fn test_wrap_around() {
        let mut buffer = ReceiveBuffer::new(seq(u32::MAX - 1), 10);
        assert_eq!(released(buffer.receive(data(0)).unwrap()), Vec::<u32>::new());
        assert_eq!(released(buffer.receive(data(u32::MAX)).unwrap()), Vec::<u32>::new());
        assert_eq!(released(buffer.receive(data(u32::MAX - 1)).unwrap()), vec![u32::MAX - 1, u32::MAX, 0]);
        assert_eq!(buffer.next_expected(), seq(1));
        assert!(buffer.is_duplicate(seq(u32::MAX)));
    }
}
