//! Congestion control policy invoked by the TCP state machine.
//!
//! The state machine only asks a policy for its current window and reports
//! acknowledgments and retransmission timeouts to it; the algorithm itself
//! is pluggable through [CongestionControl].

use std::fmt;

/// Pluggable congestion control policy.
///
/// All quantities are in bytes of sequence space.
pub trait CongestionControl: Send + fmt::Debug {
    /// Returns the congestion window (`cwnd`).
    fn window(&self) -> u32;

    /// Called once the connection is synchronized and the sender MSS is
    /// known.
    fn on_established(&mut self, mss: u16);

    /// Called when an ACK acknowledges `acked` new bytes.
    fn on_ack(&mut self, acked: u32, mss: u16);

    /// Called when the retransmission timer expires with `flight` bytes
    /// outstanding.
    fn on_retransmit_timeout(&mut self, flight: u32, mss: u16);
}

/// Slow start and congestion avoidance.
///
/// RFC 5681 (3.1)
#[derive(Debug, Clone)]
pub struct SlowStart {
    /// Congestion window, in bytes.
    cwnd: u32,
    /// Slow start threshold, in bytes.
    ssthresh: u32,
    /// Initial window in segments, 0 selects the RFC 5681 upper bound.
    icw: u32,
}

impl SlowStart {
    /// Creates the policy with an initial window of `icw` segments, or the
    /// RFC 5681 upper bound when `icw` is 0.
    pub fn new(icw: u32) -> Self {
        Self {
            // Until the connection is synchronized only the SYN is in flight.
            cwnd: u32::MAX,
            ssthresh: u32::MAX,
            icw,
        }
    }

    /// Returns the slow start threshold.
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }
}

impl Default for SlowStart {
    fn default() -> Self {
        Self::new(0)
    }
}

impl CongestionControl for SlowStart {
    fn window(&self) -> u32 {
        self.cwnd
    }

    fn on_established(&mut self, mss: u16) {
        let mss = mss as u32;

        self.cwnd = if self.icw != 0 {
            self.icw.saturating_mul(mss)
        } else {
            // RFC 5681 (3.1)
            //
            //   If SMSS > 2190 bytes:
            //       IW = 2 * SMSS bytes and MUST NOT be more than 2 segments
            //   If (SMSS > 1095 bytes) and (SMSS <= 2190 bytes):
            //       IW = 3 * SMSS bytes and MUST NOT be more than 3 segments
            //   if SMSS <= 1095 bytes:
            //       IW = 4 * SMSS bytes and MUST NOT be more than 4 segments
            match mss {
                m if m > 2190 => 2 * m,
                m if m > 1095 => 3 * m,
                m => 4 * m,
            }
        };
    }

    fn on_ack(&mut self, acked: u32, mss: u16) {
        let mss = mss as u32;

        if self.cwnd < self.ssthresh {
            // During slow start, TCP increments cwnd by at most SMSS bytes
            // for each ACK received that cumulatively acknowledges new data.
            self.cwnd = self.cwnd.saturating_add(acked.min(mss));
        } else {
            // cwnd += SMSS*SMSS/cwnd
            let incr = (mss * mss / self.cwnd.max(1)).max(1);
            self.cwnd = self.cwnd.saturating_add(incr);
        }
    }

    fn on_retransmit_timeout(&mut self, flight: u32, mss: u16) {
        let mss = mss as u32;

        // ssthresh = max (FlightSize / 2, 2*SMSS)
        self.ssthresh = (flight / 2).max(2 * mss);
        // The loss window is one full-sized segment.
        self.cwnd = mss;
    }
}
