//! Windowed throughput tracking for the steady-state figure in the final
//! report.

use std::time::{Duration, Instant};

/// One closed wall-clock window.
#[derive(Debug, Clone, Copy)]
pub struct WindowSample {
    /// Zero-based window index.
    pub index: u32,
    /// Requests acknowledged during the window.
    pub requests: u64,
    /// Bytes acknowledged during the window.
    pub bytes: u64,
    /// Actual window length.
    pub elapsed: Duration,
}

impl WindowSample {
    /// Requests per second over this window.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.requests as f64 / secs
        } else {
            0.0
        }
    }
}

/// Accumulates acked requests/bytes into fixed wall-clock windows.
///
/// The bench loop's ack path calls [`ThroughputWindows::record`]; whenever
/// the interval has elapsed the current window is closed and returned so
/// the caller can log it.
#[derive(Debug)]
pub struct ThroughputWindows {
    interval: Duration,
    samples: Vec<WindowSample>,
    window_start: Instant,
    requests: u64,
    bytes: u64,
    next_index: u32,
}

impl ThroughputWindows {
    /// Create a collector with the given window length.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            samples: Vec::new(),
            window_start: Instant::now(),
            requests: 0,
            bytes: 0,
            next_index: 0,
        }
    }

    /// Add newly acknowledged work. Returns the closed window, if this call
    /// rolled one over.
    pub fn record(&mut self, requests: u64, bytes: u64) -> Option<WindowSample> {
        self.requests += requests;
        self.bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed < self.interval {
            return None;
        }
        Some(self.roll(elapsed))
    }

    /// Close the final, possibly partial, window.
    pub fn finish(&mut self) {
        let elapsed = self.window_start.elapsed();
        if self.requests > 0 {
            self.roll(elapsed);
        }
    }

    fn roll(&mut self, elapsed: Duration) -> WindowSample {
        let sample = WindowSample {
            index: self.next_index,
            requests: self.requests,
            bytes: self.bytes,
            elapsed,
        };
        self.samples.push(sample);
        self.next_index += 1;
        self.requests = 0;
        self.bytes = 0;
        self.window_start = Instant::now();
        sample
    }

    /// All closed windows.
    pub fn samples(&self) -> &[WindowSample] {
        &self.samples
    }

    /// Mean request rate over the windows left after trimming `trim` from
    /// each end; `None` when nothing survives the trim.
    pub fn steady_rate(&self, trim: usize) -> Option<f64> {
        let len = self.samples.len();
        if len <= trim * 2 {
            return None;
        }
        let steady = &self.samples[trim..len - trim];
        let sum: f64 = steady.iter().map(WindowSample::rate).sum();
        Some(sum / steady.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollover_on_interval() {
        let mut w = ThroughputWindows::new(Duration::ZERO);
        // Zero interval: every record closes a window.
        let first = w.record(10, 5120).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.requests, 10);
        assert_eq!(first.bytes, 5120);

        let second = w.record(4, 2048).unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.requests, 4);
        assert_eq!(w.samples().len(), 2);
    }

    #[test]
    fn test_no_rollover_within_interval() {
        let mut w = ThroughputWindows::new(Duration::from_secs(3600));
        assert!(w.record(1, 512).is_none());
        assert!(w.record(1, 512).is_none());
        assert!(w.samples().is_empty());

        w.finish();
        assert_eq!(w.samples().len(), 1);
        assert_eq!(w.samples()[0].requests, 2);
    }

    #[test]
    fn test_finish_skips_empty_window() {
        let mut w = ThroughputWindows::new(Duration::from_secs(3600));
        w.finish();
        assert!(w.samples().is_empty());
    }

    #[test]
    fn test_steady_rate_trims_both_ends() {
        let mut w = ThroughputWindows::new(Duration::ZERO);
        for requests in [1u64, 100, 100, 100, 1] {
            w.record(requests, requests * 512).unwrap();
        }
        assert!(w.steady_rate(3).is_none());
        let steady = w.steady_rate(1).unwrap();
        // Only the three middle windows contribute.
        let expected: f64 =
            w.samples()[1..4].iter().map(WindowSample::rate).sum::<f64>() / 3.0;
        assert_eq!(steady, expected);
    }
}
