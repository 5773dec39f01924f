use thiserror::Error;
use crate::sequence_number::SequenceNumber;

/// Reasons for rejecting a received datagram. A datagram that fails to decode never reaches
///  the reliability engine: the caller drops it and counts it as an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("malformed packet: {len} bytes")]
    MalformedPacket { len: usize },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("packet length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: u16, actual: usize },

    #[error("checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),
}

/// Per-packet errors reported by a reliability engine. None of these is fatal: they are
///  recovered from by retransmission, duplicate suppression or back pressure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("packet is not an acknowledgment")]
    NotAnAck,

    #[error("ACK for future packet: ack={ack_number}, highest issued={highest_issued}")]
    FutureAck { ack_number: SequenceNumber, highest_issued: SequenceNumber },

    #[error("receive buffer overflow: capacity {capacity}")]
    BufferOverflow { capacity: usize },

    #[error("send window is full: {in_flight} packets in flight, window {window}")]
    WindowFull { in_flight: u32, window: u32 },

    #[error("slot for sequence number {sequence_number} is occupied")]
    SlotCollision { sequence_number: SequenceNumber },
}
