// Bounded histogram of handler ack latencies, in whole seconds.
use std::sync::atomic::{AtomicU64, Ordering};

/// Widest latency the histogram distinguishes; everything above is clamped.
pub const MAX_LATENCY_SECONDS: u64 = 600;

/// Shared latency histogram sized for percentile queries, not exact order.
///
/// Many writers (one per resolving handler), occasional readers (the
/// deadline tuning tick). Buckets are one second wide.
pub struct LatencyDistribution {
    buckets: Box<[AtomicU64]>,
    count: AtomicU64,
}

impl LatencyDistribution {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(MAX_LATENCY_SECONDS as usize + 1);
        buckets.resize_with(MAX_LATENCY_SECONDS as usize + 1, AtomicU64::default);
        Self {
            buckets: buckets.into_boxed_slice(),
            count: AtomicU64::new(0),
        }
    }

    /// Record one observed latency, clamped into the histogram range.
    pub fn record(&self, seconds: u64) {
        let bucket = seconds.min(MAX_LATENCY_SECONDS) as usize;
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Smallest bucket boundary at or below which at least `fraction` of all
    /// samples fall. Returns 0 when no samples were recorded.
    pub fn percentile(&self, fraction: f64) -> u64 {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let threshold = (total as f64 * fraction).ceil() as u64;
        let mut cumulative = 0u64;
        for (seconds, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= threshold {
                return seconds as u64;
            }
        }
        MAX_LATENCY_SECONDS
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for LatencyDistribution {
    fn default() -> Self {
        Self::new()
    }
}
