//! Per-connection telemetry.
//!
//! Lifetime counters plus rolling per-second history. Each rolling series
//! is a FIFO of one-second bins: lower indexes are older samples, the last
//! bin is the current second.

use std::collections::VecDeque;

use serde::Serialize;

/// Seconds of rolling history retained.
pub const ROLLING_WINDOW_SECS: usize = 5 * 60;

/// EWMA smoothing factor for RTT samples.
pub const RTT_EWMA_ALPHA: f64 = 1.0 / 8.0;

/// Rolling per-second counter.
#[derive(Debug, Clone, Serialize)]
pub struct RollingCounter {
    bins: VecDeque<u64>,
}

impl RollingCounter {
    pub fn new() -> Self {
        let mut bins = VecDeque::with_capacity(ROLLING_WINDOW_SECS);
        bins.push_back(0);
        Self { bins }
    }

    /// Add to the current second's bin.
    pub fn add(&mut self, value: u64) {
        if let Some(bin) = self.bins.back_mut() {
            *bin += value;
        }
    }

    /// Close the current second and open a fresh bin.
    pub fn roll(&mut self) {
        self.bins.push_back(0);
        while self.bins.len() > ROLLING_WINDOW_SECS {
            self.bins.pop_front();
        }
    }

    /// Value accumulated in the current second.
    pub fn current(&self) -> u64 {
        self.bins.back().copied().unwrap_or(0)
    }

    /// Sum over the retained window.
    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }

    pub fn bins(&self) -> impl Iterator<Item = u64> + '_ {
        self.bins.iter().copied()
    }
}

impl Default for RollingCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling per-second samples of a gauge value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollingSamples {
    samples: VecDeque<f64>,
}

impl RollingSamples {
    pub fn push(&mut self, value: f64) {
        self.samples.push_back(value);
        while self.samples.len() > ROLLING_WINDOW_SECS {
            self.samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }
}

/// All statistics for one connection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    /// Lifetime count of outgoing packets assembled.
    pub assembled: u64,
    /// Lifetime count of user messages queued for sending.
    pub sent: u64,
    /// Lifetime count of packets received and accepted.
    pub received: u64,
    /// Lifetime count of received packets dropped (malformed, duplicate,
    /// stale, or failing authentication).
    pub dropped: u64,
    /// Lifetime count of outgoing packets acked by the remote.
    pub acked: u64,
    /// Lifetime count of outgoing packets that timed out unacked.
    pub timeouts: u64,
    /// Lifetime count of duplicate user messages suppressed.
    pub duplicates: u64,
    /// Times the send window was full and packet assembly stalled.
    pub window_stalls: u64,
    /// Rolling packets sent per second.
    pub pkts_sent: RollingCounter,
    /// Rolling packets received per second.
    pub pkts_recv: RollingCounter,
    /// Rolling bytes sent per second.
    pub bytes_sent: RollingCounter,
    /// Rolling bytes received per second.
    pub bytes_recv: RollingCounter,
    /// Rolling one-second latency samples (seconds).
    pub latency: RollingSamples,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound datagram.
    pub fn on_send(&mut self, bytes: usize) {
        self.pkts_sent.add(1);
        self.bytes_sent.add(bytes as u64);
    }

    /// Record an accepted inbound datagram.
    pub fn on_receive(&mut self, bytes: usize) {
        self.received += 1;
        self.pkts_recv.add(1);
        self.bytes_recv.add(bytes as u64);
    }

    /// Close out one second of history.
    pub fn roll_second(&mut self, latency: f64) {
        self.pkts_sent.roll();
        self.pkts_recv.roll();
        self.bytes_sent.roll();
        self.bytes_recv.roll();
        self.latency.push(latency);
    }
}

/// Exponentially weighted moving average, as used for RTT smoothing.
pub fn ewma(current: f64, sample: f64, alpha: f64) -> f64 {
    current + alpha * (sample - current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_counter() {
        let mut c = RollingCounter::new();
        c.add(3);
        c.add(2);
        assert_eq!(c.current(), 5);

        c.roll();
        assert_eq!(c.current(), 0);
        assert_eq!(c.total(), 5);

        c.add(1);
        assert_eq!(c.total(), 6);
    }

    #[test]
    fn test_rolling_counter_bounded() {
        let mut c = RollingCounter::new();
        for _ in 0..(ROLLING_WINDOW_SECS * 2) {
            c.add(1);
            c.roll();
        }
        assert_eq!(c.bins().count(), ROLLING_WINDOW_SECS);
    }

    #[test]
    fn test_rolling_samples_bounded() {
        let mut s = RollingSamples::default();
        for i in 0..(ROLLING_WINDOW_SECS * 2) {
            s.push(i as f64);
        }
        assert_eq!(s.samples().count(), ROLLING_WINDOW_SECS);
        assert_eq!(s.latest(), Some((ROLLING_WINDOW_SECS * 2 - 1) as f64));
    }

    #[test]
    fn test_stats_accounting() {
        let mut stats = ConnectionStats::new();
        stats.on_send(100);
        stats.on_send(200);
        stats.on_receive(50);

        assert_eq!(stats.pkts_sent.current(), 2);
        assert_eq!(stats.bytes_sent.current(), 300);
        assert_eq!(stats.received, 1);
        assert_eq!(stats.bytes_recv.current(), 50);

        stats.roll_second(0.012);
        assert_eq!(stats.pkts_sent.current(), 0);
        assert_eq!(stats.latency.latest(), Some(0.012));
    }

    #[test]
    fn test_ewma_converges() {
        let mut v = 0.0;
        for _ in 0..100 {
            v = ewma(v, 1.0, RTT_EWMA_ALPHA);
        }
        assert!((v - 1.0).abs() < 0.01);
    }
}
