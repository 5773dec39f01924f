//! The reliability engine combines retransmission tracking, congestion control, RTT estimation
//!  and receive ordering for a single connection.
//!
//! There are two interchangeable implementations of the [ReliabilityEngine] contract:
//! * [locked::LockedEngine] guards each piece of state with its own mutex, holding it only for
//!   the in-memory operation on that piece
//! * [lock_free::LockFreeEngine] uses a table of atomically swapped slots for unacknowledged
//!   packets, a lock-free queue on the receive path and compare-and-swap updates for all scalar
//!   state
//!
//! Engine operations never do I/O. The caller is responsible for actually sending packets,
//!  including the ones returned by [ReliabilityEngine::timed_out_packets].

pub mod locked;
pub mod lock_free;

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use bytes::Bytes;
use crate::config::{EngineKind, ReliabilityConfig};
use crate::error::EngineError;
use crate::packet::Packet;
use crate::sequence_number::SequenceNumber;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct EngineStats {
    /// DATA packets accepted for tracking
    pub sent: u64,
    /// DATA packets accepted into the ordering buffer, i.e. not counting duplicates
    pub received: u64,
    /// packets that timed out at least once
    pub lost: u64,
    /// number of times a timed out packet was offered for retransmission
    pub retransmitted: u64,
    pub congestion_window: u32,
    pub slow_start_threshold: u32,
    pub rtt_estimate: Duration,
    pub retransmission_timeout: Duration,
    pub unacknowledged: usize,
}

impl Display for EngineStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sent={} received={} lost={} retransmitted={} cwnd={} ssthresh={} rtt={:?} rto={:?} unacked={}",
               self.sent,
               self.received,
               self.lost,
               self.retransmitted,
               self.congestion_window,
               self.slow_start_threshold,
               self.rtt_estimate,
               self.retransmission_timeout,
               self.unacknowledged,
        )
    }
}

/// All operations may be called concurrently from any number of threads, typically the
///  application sending, a receive loop and a periodic retransmission scan.
pub trait ReliabilityEngine: Send + Sync {
    /// Allocates the next sequence number for outgoing DATA. Starts at 1 and wraps.
    fn next_sequence_number(&self) -> SequenceNumber;

    /// the number of DATA packets that may currently be sent, `min(cwnd, window) - unacknowledged`
    fn send_budget(&self) -> u32;

    fn can_send(&self) -> bool {
        self.send_budget() > 0
    }

    fn send(&self, packet: Packet) -> Result<(), EngineError> {
        self.send_at(packet, Instant::now())
    }

    /// Records an outgoing packet before it is put on the wire. DATA packets are subject to
    ///  flow control and tracked until acknowledged; control packets always pass untracked.
    fn send_at(&self, packet: Packet, now: Instant) -> Result<(), EngineError>;

    fn send_data(&self, payload: Bytes) -> Result<Packet, EngineError> {
        self.send_data_at(payload, Instant::now())
    }

    /// Allocates the next sequence number for a DATA packet with the given payload and records
    ///  it. If the window is full, or the next sequence number's slot is still held by an
    ///  unacknowledged packet, this fails with `WindowFull` without using up a sequence number.
    ///  So the peer never waits for a packet that was never sent.
    fn send_data_at(&self, payload: Bytes, now: Instant) -> Result<Packet, EngineError>;

    fn is_unacknowledged(&self, sequence_number: SequenceNumber) -> bool;

    fn retry_count(&self, sequence_number: SequenceNumber) -> Option<u32>;

    fn handle_ack(&self, packet: &Packet) -> Result<bool, EngineError> {
        self.handle_ack_at(packet, Instant::now())
    }

    /// Processes an acknowledgment, i.e. a packet with the ACK flag whose `ack_number` is the
    ///  next sequence number the peer expects. Returns `true` if this acknowledged a tracked
    ///  packet, `false` for duplicate or unknown acknowledgments.
    fn handle_ack_at(&self, packet: &Packet, now: Instant) -> Result<bool, EngineError>;

    /// Processes an incoming packet, returning the DATA packets that became deliverable in
    ///  sequence order. A SYN re-synchronizes the expected sequence to the one after its own, a
    ///  SYN|ACK only if that moves it forward.
    fn receive(&self, packet: Packet) -> Result<Vec<Packet>, EngineError>;

    /// Returns the packets that were not acknowledged within the retransmission timeout, each
    ///  once per timeout. Finding any counts as a loss event for congestion control.
    fn timed_out_packets(&self, now: Instant) -> Vec<Packet>;

    /// explicit loss signal, e.g. from a NAK
    fn on_loss(&self);

    fn stats(&self) -> EngineStats;
}

pub fn new_engine(kind: EngineKind, config: ReliabilityConfig) -> anyhow::Result<Arc<dyn ReliabilityEngine>> {
    config.validate()?;
    Ok(match kind {
        EngineKind::Locked => Arc::new(locked::LockedEngine::new(config)),
        EngineKind::LockFree => Arc::new(lock_free::LockFreeEngine::new(config)),
    })
}

/// Shared sequence number counter for outgoing DATA
pub(crate) struct SequenceAllocator {
    next: AtomicU32,
}

impl SequenceAllocator {
    pub fn new() -> SequenceAllocator {
        SequenceAllocator {
            next: AtomicU32::new(SequenceNumber::INITIAL.to_raw()),
        }
    }

    pub fn allocate(&self) -> SequenceNumber {
        SequenceNumber::from_raw(self.next.fetch_add(1, Ordering::AcqRel))
    }

    /// Allocates the next sequence number only if `accept` holds for it. Nothing is used up
    ///  otherwise.
    pub fn allocate_if(&self, accept: impl Fn(SequenceNumber) -> bool) -> Option<SequenceNumber> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                accept(SequenceNumber::from_raw(raw)).then(|| raw.wrapping_add(1))
            })
            .ok()
            .map(SequenceNumber::from_raw)
    }

    /// The highest sequence number ever issued: the later of the last allocated number and
    ///  the highest recorded DATA sequence number. An acknowledgment beyond this can only come
    ///  from a peer with corrupted or stale state.
    pub fn highest_issued(&self, highest_recorded: Option<SequenceNumber>) -> SequenceNumber {
        let last_allocated = SequenceNumber::from_raw(self.next.load(Ordering::Acquire)).prev();
        match highest_recorded {
            Some(highest) => highest.latest(last_allocated),
            None => last_allocated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex;
    use rustc_hash::FxHashSet;

    fn seq(raw: u32) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn data(raw: u32) -> Packet {
        Packet::data(seq(raw), Bytes::from(format!("payload {}", raw)))
    }

    fn engine(kind: EngineKind, tweak: impl FnOnce(&mut ReliabilityConfig)) -> Arc<dyn ReliabilityEngine> {
        let mut config = ReliabilityConfig::default();
        tweak(&mut config);
        new_engine(kind, config).unwrap()
    }

    fn raw(packets: &[Packet]) -> Vec<u32> {
        packets.iter().map(|p| p.sequence_number().to_raw()).collect()
    }

    #[rstest]
    fn test_next_sequence_number(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        assert_eq!(engine.next_sequence_number(), seq(1));
        assert_eq!(engine.next_sequence_number(), seq(2));
        assert_eq!(engine.next_sequence_number(), seq(3));
    }

    #[test]
    fn test_allocate_if() {
        let allocator = SequenceAllocator::new();
        assert_eq!(allocator.allocate_if(|s| s != seq(1)), None);
        assert_eq!(allocator.allocate_if(|s| s == seq(1)), Some(seq(1)));
        assert_eq!(allocator.allocate(), seq(2));
        assert_eq!(allocator.highest_issued(None), seq(2));
    }

    #[test]
    fn test_sequence_allocator_wraps() {
        let allocator = SequenceAllocator { next: AtomicU32::new(u32::MAX) };
        assert_eq!(allocator.allocate(), seq(u32::MAX));
        assert_eq!(allocator.allocate(), seq(0));
        assert_eq!(allocator.highest_issued(None), seq(0));
        assert_eq!(allocator.highest_issued(Some(seq(3))), seq(3));
        assert_eq!(allocator.highest_issued(Some(seq(u32::MAX - 5))), seq(0));
    }

    #[rstest]
    fn test_invalid_config_is_rejected(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let mut config = ReliabilityConfig::default();
        config.unacked_table_size = 1000;
        assert!(new_engine(kind, config).is_err());
    }

    #[rstest]
    fn test_flow_control(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |c| {
            c.window_size = 3;
            c.initial_congestion_window = 3;
        });

        for _ in 0..3 {
            assert!(engine.can_send());
            let seq = engine.next_sequence_number();
            engine.send(data(seq.to_raw())).unwrap();
        }

        assert!(!engine.can_send());
        assert_eq!(engine.send_budget(), 0);
        assert_eq!(engine.send(data(4)), Err(EngineError::WindowFull { in_flight: 3, window: 3 }));
        assert!(!engine.is_unacknowledged(seq(4)));

        // control packets are not subject to flow control
        engine.send(Packet::fin(seq(4))).unwrap();
        engine.send(Packet::ack(seq(17))).unwrap();

        assert_eq!(engine.handle_ack(&Packet::ack(seq(2))), Ok(true));
        assert!(engine.can_send());
        engine.send(data(4)).unwrap();
        assert!(!engine.can_send());

        assert_eq!(engine.stats().sent, 4);
        assert_eq!(engine.stats().unacknowledged, 3);
    }

    #[rstest]
    fn test_send_data(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |c| c.initial_congestion_window = 2);

        let first = engine.send_data(Bytes::from_static(b"a")).unwrap();
        assert_eq!(first, Packet::data(seq(1), Bytes::from_static(b"a")));
        assert_eq!(engine.send_data(Bytes::from_static(b"b")).unwrap().sequence_number(), seq(2));
        assert!(engine.is_unacknowledged(seq(2)));

        assert_eq!(engine.send_data(Bytes::from_static(b"c")), Err(EngineError::WindowFull { in_flight: 2, window: 2 }));
        assert_eq!(engine.handle_ack(&Packet::ack(seq(2))), Ok(true));
        assert_eq!(engine.send_data(Bytes::from_static(b"c")).unwrap().sequence_number(), seq(3));
        assert_eq!(engine.stats().sent, 3);
    }

    #[rstest]
    fn test_send_data_waits_for_occupied_slot(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |c| {
            c.window_size = 4;
            c.initial_congestion_window = 4;
            c.unacked_table_size = 16;
        });

        let held = engine.send_data(Bytes::from_static(b"held")).unwrap();
        assert_eq!(held.sequence_number(), seq(1));
        for r in 2..=16 {
            assert_eq!(engine.send_data(Bytes::new()).unwrap().sequence_number(), seq(r));
            assert_eq!(engine.handle_ack(&Packet::ack(seq(r + 1))), Ok(true));
        }

        // #17 would go into the slot #1 still holds
        assert_eq!(engine.send_data(Bytes::new()), Err(EngineError::WindowFull { in_flight: 1, window: 4 }));
        assert_eq!(engine.send_data(Bytes::new()), Err(EngineError::WindowFull { in_flight: 1, window: 4 }));
        assert_eq!(engine.stats().unacknowledged, 1);
        assert!(engine.is_unacknowledged(seq(1)));

        assert_eq!(engine.handle_ack(&Packet::ack(seq(2))), Ok(true));
        assert_eq!(engine.send_data(Bytes::new()).unwrap().sequence_number(), seq(17));
        assert_eq!(engine.stats().sent, 17);
    }

    #[rstest]
    fn test_congestion_window_limits_sending(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        assert_eq!(engine.send_budget(), 1);
        engine.send(data(1)).unwrap();
        assert_eq!(engine.send(data(2)), Err(EngineError::WindowFull { in_flight: 1, window: 1 }));

        // slow start: every ACK grows the window by one
        assert_eq!(engine.handle_ack(&Packet::ack(seq(2))), Ok(true));
        assert_eq!(engine.stats().congestion_window, 2);
        assert_eq!(engine.send_budget(), 2);
    }

    #[rstest]
    fn test_duplicate_send_is_rejected(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |c| c.initial_congestion_window = 8);
        engine.send(data(5)).unwrap();
        assert_eq!(engine.send(data(5)), Err(EngineError::SlotCollision { sequence_number: seq(5) }));
        assert_eq!(engine.stats().unacknowledged, 1);
        assert_eq!(engine.stats().sent, 1);
    }

    #[rstest]
    fn test_ack_idempotent(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        engine.send(data(1)).unwrap();
        assert!(engine.is_unacknowledged(seq(1)));
        assert_eq!(engine.retry_count(seq(1)), Some(0));

        assert_eq!(engine.handle_ack(&Packet::ack(seq(2))), Ok(true));
        assert!(!engine.is_unacknowledged(seq(1)));
        assert_eq!(engine.retry_count(seq(1)), None);

        assert_eq!(engine.handle_ack(&Packet::ack(seq(2))), Ok(false));
        assert_eq!(engine.stats().unacknowledged, 0);
        assert_eq!(engine.stats().congestion_window, 2);
    }

    #[rstest]
    fn test_ack_requires_ack_flag(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        engine.send(data(1)).unwrap();

        let not_an_ack = Packet::new(crate::packet::PacketType::Ack, crate::packet::PacketFlags::empty(), seq(0), seq(2), Bytes::new());
        assert_eq!(engine.handle_ack(&not_an_ack), Err(EngineError::NotAnAck));
        assert_eq!(engine.handle_ack(&data(2)), Err(EngineError::NotAnAck));
        assert!(engine.is_unacknowledged(seq(1)));

        // the flag counts, not the type
        assert_eq!(engine.handle_ack(&Packet::syn_ack(seq(9), seq(2))), Ok(true));
    }

    #[rstest]
    #[case::far_ahead(900, Err(EngineError::FutureAck { ack_number: seq(900), highest_issued: seq(800) }))]
    #[case::just_ahead(802, Err(EngineError::FutureAck { ack_number: seq(802), highest_issued: seq(800) }))]
    #[case::matching(801, Ok(true))]
    #[case::old(500, Ok(false))]
    #[case::below_highest(800, Ok(false))]
    fn test_future_ack(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind, #[case] ack: u32, #[case] expected: Result<bool, EngineError>) {
        let engine = engine(kind, |_| {});
        engine.send(data(800)).unwrap();

        assert_eq!(engine.handle_ack(&Packet::ack(seq(ack))), expected);
    }

    #[rstest]
    fn test_future_ack_uses_allocated_sequence(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        assert_eq!(engine.handle_ack(&Packet::ack(seq(1))), Ok(false));
        assert!(engine.handle_ack(&Packet::ack(seq(2))).is_err());

        for _ in 0..5 {
            engine.next_sequence_number();
        }
        assert_eq!(engine.handle_ack(&Packet::ack(seq(6))), Ok(false));
        assert!(engine.handle_ack(&Packet::ack(seq(7))).is_err());
    }

    #[rstest]
    fn test_ordering(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        assert!(engine.receive(Packet::syn(seq(500))).unwrap().is_empty());

        assert!(engine.receive(data(503)).unwrap().is_empty());
        assert_eq!(raw(&engine.receive(data(501)).unwrap()), vec![501]);
        assert_eq!(engine.receive(data(502)).unwrap(), vec![data(502), data(503)]);

        assert_eq!(engine.stats().received, 3);
    }

    #[rstest]
    fn test_receive_from_initial_sequence(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        assert!(engine.receive(data(2)).unwrap().is_empty());
        assert_eq!(raw(&engine.receive(data(1)).unwrap()), vec![1, 2]);
    }

    #[rstest]
    fn test_receive_ignores_control_packets(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        for packet in [Packet::ack(seq(1)), Packet::fin(seq(1)), Packet::rst(seq(1))] {
            assert!(engine.receive(packet).unwrap().is_empty());
        }
        assert_eq!(engine.stats().received, 0);
        assert_eq!(raw(&engine.receive(data(1)).unwrap()), vec![1]);
    }

    #[rstest]
    fn test_receive_duplicates(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        let mut delivered = Vec::new();
        for r in [3, 1, 3, 1, 2, 2, 3] {
            delivered.extend(raw(&engine.receive(data(r)).unwrap()));
        }
        assert_eq!(delivered, vec![1, 2, 3]);
        assert_eq!(engine.stats().received, 3);
    }

    #[rstest]
    fn test_receive_overflow(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |c| c.receive_buffer_capacity = 2);
        assert!(engine.receive(data(3)).unwrap().is_empty());
        assert!(engine.receive(data(4)).unwrap().is_empty());

        assert_eq!(engine.receive(data(5)), Err(EngineError::BufferOverflow { capacity: 2 }));
        assert!(engine.receive(data(4)).unwrap().is_empty());

        assert_eq!(raw(&engine.receive(data(1)).unwrap()), vec![1]);
        assert_eq!(raw(&engine.receive(data(2)).unwrap()), vec![2, 3, 4]);
        assert_eq!(raw(&engine.receive(data(5)).unwrap()), vec![5]);
    }

    #[rstest]
    fn test_syn_resync_discards_stale_packets(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        engine.receive(data(3)).unwrap();
        engine.receive(data(11)).unwrap();

        assert_eq!(raw(&engine.receive(Packet::syn(seq(10))).unwrap()), vec![11]);
        assert!(engine.receive(data(3)).unwrap().is_empty());
        assert_eq!(raw(&engine.receive(data(12)).unwrap()), vec![12]);
    }

    #[rstest]
    fn test_late_syn_ack_does_not_rewind(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        assert_eq!(raw(&engine.receive(data(1)).unwrap()), vec![1]);

        // a retransmitted SYN|ACK for sequence 0 arrives after DATA #1 was delivered
        assert!(engine.receive(Packet::syn_ack(seq(0), seq(1))).unwrap().is_empty());
        assert!(engine.receive(data(1)).unwrap().is_empty());
        assert_eq!(raw(&engine.receive(data(2)).unwrap()), vec![2]);
        assert_eq!(engine.stats().received, 2);
    }

    #[rstest]
    fn test_syn_ack_moves_forward(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        engine.receive(data(3)).unwrap();
        engine.receive(data(11)).unwrap();

        assert_eq!(raw(&engine.receive(Packet::syn_ack(seq(10), seq(1))).unwrap()), vec![11]);
        assert!(engine.receive(data(3)).unwrap().is_empty());
        assert_eq!(raw(&engine.receive(data(12)).unwrap()), vec![12]);
    }

    #[rstest]
    fn test_timeout_retransmission(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |c| c.initial_retransmission_timeout = Duration::from_millis(100));
        let t0 = Instant::now();
        engine.send_at(data(1), t0).unwrap();

        assert!(engine.timed_out_packets(t0 + Duration::from_millis(50)).is_empty());
        assert!(engine.timed_out_packets(t0 + Duration::from_millis(100)).is_empty());

        assert_eq!(engine.timed_out_packets(t0 + Duration::from_millis(101)), vec![data(1)]);
        assert_eq!(engine.retry_count(seq(1)), Some(1));
        assert!(engine.timed_out_packets(t0 + Duration::from_millis(150)).is_empty());
        assert!(engine.timed_out_packets(t0 + Duration::from_millis(201)).is_empty());

        assert_eq!(engine.timed_out_packets(t0 + Duration::from_millis(202)), vec![data(1)]);
        assert_eq!(engine.retry_count(seq(1)), Some(2));

        let stats = engine.stats();
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.retransmitted, 2);
        assert_eq!(stats.unacknowledged, 1);

        // an ACK for the retransmitted packet still removes it
        assert_eq!(engine.handle_ack_at(&Packet::ack(seq(2)), t0 + Duration::from_millis(210)), Ok(true));
        assert!(engine.timed_out_packets(t0 + Duration::from_secs(10)).is_empty());
    }

    #[rstest]
    fn test_timeout_is_one_loss_per_scan(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |c| {
            c.initial_congestion_window = 16;
            c.initial_retransmission_timeout = Duration::from_millis(100);
        });
        let t0 = Instant::now();
        for r in 1..=4 {
            engine.send_at(data(r), t0).unwrap();
        }

        let expired = engine.timed_out_packets(t0 + Duration::from_millis(200));
        assert_eq!(raw(&expired), vec![1, 2, 3, 4]);

        let stats = engine.stats();
        assert_eq!(stats.congestion_window, 8);
        assert_eq!(stats.slow_start_threshold, 8);
        assert_eq!(stats.lost, 4);
        assert_eq!(stats.retransmitted, 4);
    }

    #[rstest]
    #[case::large(64, vec![32, 16, 8, 4, 2, 1, 1])]
    #[case::odd(5, vec![2, 1, 1])]
    #[case::one(1, vec![1, 1])]
    fn test_congestion_backoff(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind, #[case] initial: u32, #[case] expected: Vec<u32>) {
        let engine = engine(kind, |c| c.initial_congestion_window = initial);
        for expected_cwnd in expected {
            engine.on_loss();
            assert_eq!(engine.stats().congestion_window, expected_cwnd);
        }
    }

    #[rstest]
    fn test_ack_updates_rtt(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |_| {});
        let stats = engine.stats();
        assert_eq!(stats.rtt_estimate, Duration::from_millis(100));
        assert_eq!(stats.retransmission_timeout, Duration::from_millis(1000));

        let t0 = Instant::now();
        engine.send_at(data(1), t0).unwrap();
        assert_eq!(engine.handle_ack_at(&Packet::ack(seq(2)), t0 + Duration::from_millis(20)), Ok(true));

        let stats = engine.stats();
        assert_eq!(stats.rtt_estimate, Duration::from_millis(90));
        assert_eq!(stats.retransmission_timeout, Duration::from_millis(360));
    }

    #[rstest]
    fn test_concurrent_send_ack(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        const NUM_THREADS: usize = 4;
        const PER_THREAD: usize = 2000;

        let engine = engine(kind, |c| c.initial_congestion_window = 64);
        let stop_scanning = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                while !stop_scanning.load(Ordering::Acquire) {
                    engine.timed_out_packets(Instant::now());
                    std::thread::yield_now();
                }
            });

            let senders = (0..NUM_THREADS)
                .map(|_| s.spawn(|| {
                    for _ in 0..PER_THREAD {
                        let seq = engine.next_sequence_number();
                        loop {
                            match engine.send(data(seq.to_raw())) {
                                Ok(()) => break,
                                Err(EngineError::WindowFull { .. }) => std::thread::yield_now(),
                                Err(e) => panic!("unexpected error {:?}", e),
                            }
                        }
                        // the scan never hides an entry from its ACK
                        assert_eq!(engine.handle_ack(&Packet::ack(seq.next())), Ok(true));
                    }
                }))
                .collect::<Vec<_>>();

            for sender in senders {
                sender.join().unwrap();
            }
            stop_scanning.store(true, Ordering::Release);
        });

        let stats = engine.stats();
        assert_eq!(stats.sent, (NUM_THREADS * PER_THREAD) as u64);
        assert_eq!(stats.unacknowledged, 0);
        assert_eq!(engine.send_budget(), stats.congestion_window);
    }

    #[rstest]
    fn test_concurrent_acks_remove_once(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        let engine = engine(kind, |c| c.initial_congestion_window = 64);

        for round in 0..20u32 {
            let base = round * 64 + 1;
            for r in base..base + 64 {
                engine.send(data(r)).unwrap();
            }

            let num_removed = Mutex::new(vec![0; 64]);
            std::thread::scope(|s| {
                for _ in 0..4 {
                    s.spawn(|| {
                        for r in base..base + 64 {
                            if engine.handle_ack(&Packet::ack(seq(r + 1))).unwrap() {
                                num_removed.lock().unwrap()[(r - base) as usize] += 1;
                            }
                        }
                    });
                }
                s.spawn(|| engine.timed_out_packets(Instant::now()));
            });

            let mut num_removed = num_removed.into_inner().unwrap();
            for r in base..base + 64 {
                if engine.handle_ack(&Packet::ack(seq(r + 1))).unwrap() {
                    num_removed[(r - base) as usize] += 1;
                }
            }
            assert!(num_removed.iter().all(|n| *n == 1), "{:?}", num_removed);
            assert_eq!(engine.stats().unacknowledged, 0);
        }
    }

    #[rstest]
    fn test_concurrent_receive_delivers_once(#[values(EngineKind::Locked, EngineKind::LockFree)] kind: EngineKind) {
        const N: u32 = 4000;

        let engine = engine(kind, |c| c.receive_buffer_capacity = N as usize);
        let delivered = Mutex::new(Vec::new());

        std::thread::scope(|s| {
            for t in 0..4u32 {
                let engine = &engine;
                let delivered = &delivered;
                s.spawn(move || {
                    // every packet is received twice, by different threads
                    let mut mine = (1..=N).filter(|r| r % 4 == t || (r + 1) % 4 == t).collect::<Vec<_>>();
                    if t % 2 == 1 {
                        mine.reverse();
                    }
                    for r in mine {
                        let released = raw(&engine.receive(data(r)).unwrap());
                        assert!(released.windows(2).all(|w| w[1] == w[0] + 1), "{:?}", released);
                        delivered.lock().unwrap().extend(released);
                    }
                });
            }
        });

        let delivered = delivered.into_inner().unwrap();
        assert_eq!(delivered.len(), N as usize);
        assert_eq!(delivered.iter().copied().collect::<FxHashSet<_>>().len(), N as usize);
        assert_eq!(engine.stats().received, N as u64);
    }
}
