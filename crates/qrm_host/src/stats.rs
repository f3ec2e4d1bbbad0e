//! Latency statistics for stress runs.
//!
//! Collects per-operation service times and reports min, max, average and a
//! fixed-width histogram.

use std::time::Duration;

const BUCKETS: usize = 20;

/// Width of one histogram bucket in nanoseconds.
const BUCKET_NANOS: u64 = 1_000;

/// Tracks latency statistics with minimal overhead.
///
/// Accumulates latency measurements and computes summary statistics including
/// min, max, average, and histogram distribution. Trackers filled on
/// different threads are combined with `merge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub count: u64,
    pub buckets: [u64; BUCKETS],
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    /// Creates a new latency statistics tracker with empty state.
    ///
    /// Min starts at u64::MAX so the first measurement becomes the minimum.
    pub fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            buckets: [0; BUCKETS],
        }
    }

    /// Records a latency measurement in nanoseconds.
    ///
    /// # Arguments
    ///
    /// * `nanos` - Latency measurement in nanoseconds
    pub fn update(&mut self, nanos: u64) {
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.sum += nanos;
        self.count += 1;

        let idx = (nanos / BUCKET_NANOS).min(BUCKETS as u64 - 1) as usize;
        self.buckets[idx] += 1;
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.update(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX));
    }

    /// Folds another tracker into this one.
    pub fn merge(mut self, other: &LatencyStats) -> Self {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
        self
    }

    /// Average latency in nanoseconds, or 0.0 if nothing was recorded.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// Prints a formatted report of latency statistics.
    ///
    /// Values are shown in nanoseconds below one microsecond average and in
    /// microseconds above it, followed by the non-empty histogram buckets.
    pub fn print_report(&self, title: &str) {
        println!("\n{title}");
        println!("Count: {}", self.count);
        if self.count == 0 {
            return;
        }

        let avg_ns = self.avg();
        if avg_ns < 1000.0 {
            println!("Min:   {:.2} ns", self.min as f64);
            println!("Avg:   {:.2} ns", avg_ns);
            println!("Max:   {:.2} ns", self.max as f64);
        } else {
            println!("Min:   {:.2} us", self.min as f64 / 1000.0);
            println!("Avg:   {:.2} us", avg_ns / 1000.0);
            println!("Max:   {:.2} us", self.max as f64 / 1000.0);
        }

        println!("Distribution (1us buckets):");
        for (i, &count) in self.buckets.iter().enumerate() {
            if count > 0 {
                let range_end = if i == BUCKETS - 1 { ">" } else { "" };
                println!("[{:3}-{:3}{} us]: {}", i, i + 1, range_end, count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_and_extremes() {
        let mut s = LatencyStats::new();
        s.update(500);
        s.update(2_500);
        s.update(1_000_000);
        assert_eq!((s.min, s.max, s.count), (500, 1_000_000, 3));
        assert_eq!(s.buckets[0], 1);
        assert_eq!(s.buckets[2], 1);
        assert_eq!(s.buckets[BUCKETS - 1], 1);
    }

    #[test]
    fn merge_matches_single_tracker() {
        let samples = [10u64, 900, 4_200, 77_000];
        let mut whole = LatencyStats::new();
        let mut left = LatencyStats::new();
        let mut right = LatencyStats::new();
        for (i, &n) in samples.iter().enumerate() {
            whole.update(n);
            if i % 2 == 0 {
                left.update(n);
            } else {
                right.update(n);
            }
        }
        assert_eq!(left.merge(&right), whole);
        assert_eq!(LatencyStats::default().avg(), 0.0);
    }
}
