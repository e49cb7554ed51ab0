//! Latency accounting: the in-flight issue-time ring and the quantile
//! recorder backing the final report.

use std::time::{Duration, Instant};

use hdrhistogram::Histogram;

/// Fixed-capacity ring of request issue timestamps.
///
/// Slot `i` holds the issue time of the most recent request whose
/// cumulative number satisfies `total_count % capacity == i`. Because at
/// most `pipeline_count` requests are ever in flight, a slot cannot be
/// overwritten before its request has been acked.
#[derive(Debug)]
pub struct LatencyRing {
    slots: Vec<Instant>,
}

impl LatencyRing {
    /// Create a ring with one slot per pipeline credit.
    pub fn new(pipeline_count: u32) -> Self {
        assert!(pipeline_count > 0, "pipeline count must be positive");
        Self { slots: vec![Instant::now(); pipeline_count as usize] }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Record the issue time of request `req_num`.
    #[inline]
    pub fn stamp(&mut self, req_num: u64, at: Instant) {
        let idx = (req_num % self.slots.len() as u64) as usize;
        self.slots[idx] = at;
    }

    /// Issue time recorded for request `req_num`.
    #[inline]
    pub fn issued_at(&self, req_num: u64) -> Instant {
        self.slots[(req_num % self.slots.len() as u64) as usize]
    }
}

/// Microsecond-resolution latency recorder for the end-of-run summary.
///
/// This sits next to the metrics histogram: the metrics binding exports
/// exponential buckets for scraping, while this recorder keeps enough
/// resolution to log p50/p90/p99/max in the final report.
pub struct LatencyRecorder {
    hist: Histogram<u64>,
}

/// One hour in microseconds; anything slower is clamped.
const MAX_RECORDABLE_US: u64 = 3_600_000_000;

impl LatencyRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        let hist = Histogram::new_with_bounds(1, MAX_RECORDABLE_US, 3)
            .expect("histogram bounds are static");
        Self { hist }
    }

    /// Record one request latency.
    #[inline]
    pub fn record(&mut self, latency: Duration) {
        self.hist.saturating_record(latency.as_micros() as u64);
    }

    /// Number of recorded samples.
    #[inline]
    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    /// Latency at the given quantile, in microseconds.
    pub fn quantile_us(&self, quantile: f64) -> u64 {
        self.hist.value_at_quantile(quantile)
    }

    /// Largest recorded latency, in microseconds.
    pub fn max_us(&self) -> u64 {
        self.hist.max()
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.hist.reset();
    }
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new()
    }
}
