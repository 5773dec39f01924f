use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

/// Window growth once the congestion window has reached the slow start threshold.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum CongestionAvoidance {
    /// Classic additive increase: every ACK adds `1/cwnd` to the window, accumulated in a
    ///  counter so the window grows by one packet per window's worth of ACKs.
    #[default]
    Fractional,
    /// `cwnd += 1/cwnd` in integer arithmetic, i.e. no growth at all once the window is above 1.
    ///  This freezes the window at the slow start threshold.
    IntegerDivision,
}

#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Upper bound for the congestion window, in packets. The flow control gate never lets
    ///  more than this number of DATA packets be in flight.
    pub window_size: u32,
    pub initial_congestion_window: u32,
    pub initial_slow_start_threshold: u32,

    pub initial_rtt: Duration,
    pub initial_retransmission_timeout: Duration,
    pub min_retransmission_timeout: Duration,
    pub max_retransmission_timeout: Duration,

    /// maximum number of out-of-order packets held back by the receive ordering buffer
    pub receive_buffer_capacity: usize,

    /// Number of slots for unacknowledged packets, indexed by sequence number modulo the size.
    ///  Must be a power of two, and bigger than twice the window. `send_data` waits with the
    ///  next sequence number while its slot is still held by an unacknowledged packet.
    pub unacked_table_size: usize,

    pub congestion_avoidance: CongestionAvoidance,

    /// The first sequence number the receive side expects if no SYN re-synchronizes it
    pub initial_receive_sequence: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        ReliabilityConfig {
            window_size: 64,
            initial_congestion_window: 1,
            initial_slow_start_threshold: 32,
            initial_rtt: Duration::from_millis(100),
            initial_retransmission_timeout: Duration::from_millis(1000),
            min_retransmission_timeout: Duration::from_millis(100),
            max_retransmission_timeout: Duration::from_secs(5),
            receive_buffer_capacity: 1000,
            unacked_table_size: 16384,
            congestion_avoidance: CongestionAvoidance::Fractional,
            initial_receive_sequence: 1,
        }
    }
}

impl ReliabilityConfig {
    /// congestion window and threshold are packed into 21 bits each
    pub const MAX_WINDOW_SIZE: u32 = (1 << 21) - 1;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size == 0 {
            bail!("window size must be at least 1");
        }
        if self.window_size > Self::MAX_WINDOW_SIZE {
            bail!("window size {} exceeds the maximum of {}", self.window_size, Self::MAX_WINDOW_SIZE);
        }
        if self.initial_congestion_window == 0 || self.initial_congestion_window > self.window_size {
            bail!("initial congestion window {} must be between 1 and the window size {}", self.initial_congestion_window, self.window_size);
        }
        if self.initial_slow_start_threshold > Self::MAX_WINDOW_SIZE {
            bail!("initial slow start threshold {} exceeds the maximum of {}", self.initial_slow_start_threshold, Self::MAX_WINDOW_SIZE);
        }
        if !self.unacked_table_size.is_power_of_two() {
            bail!("unacked table size {} is not a power of two", self.unacked_table_size);
        }
        if self.unacked_table_size as u64 <= 2 * self.window_size as u64 {
            bail!("unacked table size {} must be more than twice the window size {}", self.unacked_table_size, self.window_size);
        }
        if self.min_retransmission_timeout > self.max_retransmission_timeout {
            bail!("min retransmission timeout {:?} is bigger than max retransmission timeout {:?}", self.min_retransmission_timeout, self.max_retransmission_timeout);
        }
        if self.receive_buffer_capacity == 0 {
            bail!("receive buffer capacity must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum EngineKind {
    #[default]
    Locked,
    LockFree,
}

#[derive(Debug, Clone)]
pub struct EndPointConfig {
    pub self_addr: SocketAddr,

    /// interval at which every connection is scanned for timed-out packets
    pub scan_interval: Duration,
    /// interval for logging end point and connection statistics
    pub stats_interval: Duration,
    /// size of the buffer for a single incoming datagram
    pub receive_buffer_len: usize,

    pub engine_kind: EngineKind,
    pub reliability: ReliabilityConfig,
}

impl EndPointConfig {
    pub fn new(self_addr: SocketAddr) -> EndPointConfig {
        EndPointConfig {
            self_addr,
            scan_interval: Duration::from_millis(1),
            stats_interval: Duration::from_secs(10),
            receive_buffer_len: 65536,
            engine_kind: EngineKind::Locked,
            reliability: ReliabilityConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scan_interval.is_zero() {
            bail!("scan interval must not be zero");
        }
        if self.stats_interval.is_zero() {
            bail!("stats interval must not be zero");
        }
        if self.receive_buffer_len < crate::packet::Packet::MAX_PACKET_SIZE {
            bail!("receive buffer length {} is too small for a maximum size packet", self.receive_buffer_len);
        }
        self.reliability.validate()
    }
}
