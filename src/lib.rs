//! Reliable, ordered, congestion-controlled delivery of datagrams over UDP.
//!
//! Every packet is a single UDP datagram with a fixed 16 byte header followed by up to
//!  1400 bytes of payload. All numbers are in network byte order:
//!
//! ```ascii
//! 0: version (4 bits) | packet type (4 bits)
//! 1: flags (u8)
//! 2: length (u16) - header plus payload
//! 4: sequence number (u32)
//! 8: acknowledgment number (u32)
//! 12: checksum (u32) - over the rest of the header and the payload
//! 16: payload
//! ```
//!
//! Each DATA packet is acknowledged individually by an ACK carrying the sequence number the
//!  receiver expects next. Senders track unacknowledged packets, retransmit them after an
//!  RTT based timeout, and limit the number of packets in flight by a congestion window with
//!  slow start and additive increase / multiplicative decrease. Receivers hold back
//!  out-of-order packets and deliver payloads in sequence, exactly once.
//!
//! [engine::ReliabilityEngine] is the per-connection protocol state with no I/O of its own,
//!  in a mutex based and a lock-free variant. [end_point::EndPoint] runs it on a UDP socket.

pub mod buffers;
pub mod config;
pub mod congestion;
pub mod dispatcher;
pub mod end_point;
pub mod engine;
pub mod error;
pub mod packet;
pub mod receive_buffer;
pub mod retransmit_tracker;
pub mod safe_converter;
pub mod sequence_number;
pub mod transport;
