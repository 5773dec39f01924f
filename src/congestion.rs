//! Congestion window and RTT estimation.
//!
//! Both are small `Copy` state machines with pure transition functions: the locked engine keeps
//!  them behind a mutex, the lock-free engine packs each into a single `u64` and applies the
//!  same transitions in a compare-and-swap loop. This keeps the two engines' behavior identical
//!  by construction.
//!
//! The window follows plain AIMD with slow start: +1 per ACK below the slow start threshold,
//!  additive increase above it, and halving (with a floor of 1) on loss.

use std::cmp::{max, min};
use std::time::Duration;
use tracing::{debug, instrument, trace};
use crate::config::{CongestionAvoidance, ReliabilityConfig};
use crate::safe_converter::{SafeCast, SaturatingMicros};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CongestionWindow {
    cwnd: u32,
    ssthresh: u32,
    /// ACKs accumulated towards the next additive increase in congestion avoidance
    cwnd_cnt: u32,
}

impl CongestionWindow {
    const FIELD_BITS: u32 = 21;
    const FIELD_MASK: u64 = (1 << Self::FIELD_BITS) - 1;

    pub fn new(cwnd: u32, ssthresh: u32) -> CongestionWindow {
        CongestionWindow {
            cwnd,
            ssthresh,
            cwnd_cnt: 0,
        }
    }

    pub fn from_config(config: &ReliabilityConfig) -> CongestionWindow {
        Self::new(config.initial_congestion_window, config.initial_slow_start_threshold)
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn is_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    /// number of additional packets that may be sent given the number currently in flight
    pub fn send_budget(&self, window_size: u32, num_in_flight: u32) -> u32 {
        min(self.cwnd, window_size).saturating_sub(num_in_flight)
    }

    #[must_use]
    #[instrument(level = "trace")]
    pub fn on_ack(self, window_size: u32, mode: CongestionAvoidance) -> CongestionWindow {
        if self.cwnd >= window_size {
            // no point for cwnd to become greater than the window
            return self;
        }

        let mut result = self;
        if result.is_slow_start() {
            result.cwnd += 1;
        }
        else {
            match mode {
                CongestionAvoidance::Fractional => {
                    result.cwnd_cnt += 1;
                    if result.cwnd_cnt >= result.cwnd {
                        result.cwnd_cnt -= result.cwnd;
                        result.cwnd += 1;
                    }
                }
                CongestionAvoidance::IntegerDivision => {
                    result.cwnd += 1 / result.cwnd;
                }
            }
        }

        result.cwnd = min(result.cwnd, window_size);
        if result.cwnd != self.cwnd {
            trace!("adjusted cwnd to {} packets", result.cwnd);
        }
        result
    }

    #[must_use]
    pub fn on_loss(self) -> CongestionWindow {
        let ssthresh = max(1, self.cwnd / 2);
        debug!("loss -> adjusting cwnd downwards from {} to {}", self.cwnd, ssthresh);

        CongestionWindow {
            cwnd: ssthresh,
            ssthresh,
            cwnd_cnt: 0,
        }
    }

    /// All three fields fit into 21 bits since the window size is validated accordingly
    pub fn to_bits(self) -> u64 {
        let field = |value: u32| SafeCast::<u64>::safe_cast(value) & Self::FIELD_MASK;
        field(self.cwnd)
            | (field(self.ssthresh) << Self::FIELD_BITS)
            | (field(self.cwnd_cnt) << (2 * Self::FIELD_BITS))
    }

    pub fn from_bits(bits: u64) -> CongestionWindow {
        let field = |shift: u32| ((bits >> shift) & Self::FIELD_MASK) as u32;
        CongestionWindow {
            cwnd: field(0),
            ssthresh: field(Self::FIELD_BITS),
            cwnd_cnt: field(2 * Self::FIELD_BITS),
        }
    }
}

/// Smoothed round trip time and the retransmission timeout derived from it, both with
///  microsecond resolution.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RttEstimate {
    srtt_micros: u32,
    rto_micros: u32,
}

impl RttEstimate {
    pub fn new(initial_rtt: Duration, initial_rto: Duration) -> RttEstimate {
        RttEstimate {
            srtt_micros: initial_rtt.saturating_micros(),
            rto_micros: initial_rto.saturating_micros(),
        }
    }

    pub fn from_config(config: &ReliabilityConfig) -> RttEstimate {
        Self::new(config.initial_rtt, config.initial_retransmission_timeout)
    }

    pub fn srtt(&self) -> Duration {
        Duration::from_micros(SafeCast::<u64>::safe_cast(self.srtt_micros))
    }

    pub fn rto(&self) -> Duration {
        Duration::from_micros(SafeCast::<u64>::safe_cast(self.rto_micros))
    }

    /// `srtt = 7/8 srtt + 1/8 sample`, `rto = clamp(4 srtt, min_rto, max_rto)`
    #[must_use]
    pub fn on_sample(self, sample: Duration, min_rto: Duration, max_rto: Duration) -> RttEstimate {
        let old_srtt: u64 = self.srtt_micros.safe_cast();
        let sample: u64 = sample.saturating_micros().safe_cast();

        let srtt = (7 * old_srtt + sample) / 8;
        let min_rto: u64 = min_rto.saturating_micros().safe_cast();
        let max_rto: u64 = max_rto.saturating_micros().safe_cast();
        let rto = (4 * srtt).max(min_rto).min(max_rto);

        RttEstimate {
            // both are bounded by u32::MAX: srtt is a weighted average of u32 values, rto is
            //  capped by a u32 value
            srtt_micros: srtt as u32,
            rto_micros: rto as u32,
        }
    }

    pub fn to_bits(self) -> u64 {
        let srtt: u64 = self.srtt_micros.safe_cast();
        let rto: u64 = self.rto_micros.safe_cast();
        srtt | (rto << 32)
    }

    pub fn from_bits(bits: u64) -> RttEstimate {
        RttEstimate {
            srtt_micros: bits as u32,
            rto_micros: (bits >> 32) as u32,
        }
    }
}
