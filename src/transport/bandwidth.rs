//! Fixed-interval bandwidth measurement
//!
//! The congestion monitor samples the transport's total-bytes-sent counter
//! on a fixed interval; each sample yields an instantaneous throughput
//! estimate and is consumed immediately, never retained.

use std::time::{Duration, Instant};

/// One interval's worth of send activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSample {
    /// Bytes sent since the previous sample
    pub bytes_delta: u64,
    /// Wall time since the previous sample
    pub elapsed_ms: u64,
}

impl BandwidthSample {
    /// Instantaneous throughput in kilobits per second.
    pub fn kbps(&self) -> u32 {
        if self.elapsed_ms == 0 {
            return 0;
        }
        ((self.bytes_delta * 8) / self.elapsed_ms) as u32
    }
}

/// Turns successive byte-counter readings into [`BandwidthSample`]s.
pub struct BandwidthMeter {
    last: Option<(Instant, u64)>,
}

impl BandwidthMeter {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Feed the current total-bytes-sent reading.
    ///
    /// The first call only establishes a baseline and yields nothing; so do
    /// calls spaced too closely to measure (under a millisecond).
    pub fn sample(&mut self, total_bytes: u64) -> Option<BandwidthSample> {
        let now = Instant::now();
        let Some((last_at, last_bytes)) = self.last.replace((now, total_bytes)) else {
            return None;
        };

        let elapsed = now.duration_since(last_at);
        if elapsed < Duration::from_millis(1) {
            return None;
        }

        Some(BandwidthSample {
            bytes_delta: total_bytes.saturating_sub(last_bytes),
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }
}

impl Default for BandwidthMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_sample_is_baseline_only() {
        let mut meter = BandwidthMeter::new();
        assert!(meter.sample(1000).is_none());
    }

    #[test]
    fn sample_reports_delta_and_elapsed() {
        let mut meter = BandwidthMeter::new();
        meter.sample(1000);
        thread::sleep(Duration::from_millis(50));
        let sample = meter.sample(26_000).unwrap();
        assert_eq!(sample.bytes_delta, 25_000);
        assert!(sample.elapsed_ms >= 50);
    }

    #[test]
    fn kbps_formula() {
        // 125_000 bytes in 500 ms = 1_000_000 bits / 500 ms = 2000 kbps
        let sample = BandwidthSample {
            bytes_delta: 125_000,
            elapsed_ms: 500,
        };
        assert_eq!(sample.kbps(), 2000);

        let zero = BandwidthSample {
            bytes_delta: 1000,
            elapsed_ms: 0,
        };
        assert_eq!(zero.kbps(), 0);
    }

    #[test]
    fn counter_going_backwards_saturates() {
        let mut meter = BandwidthMeter::new();
        meter.sample(5000);
        thread::sleep(Duration::from_millis(10));
        // Counter reset (new session); never underflow
        let sample = meter.sample(100).unwrap();
        assert_eq!(sample.bytes_delta, 0);
    }
}
