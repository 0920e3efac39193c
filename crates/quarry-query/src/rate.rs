//! Rolling per-second rate over a fixed window of samples.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Counts events into fixed-length buckets and reports the average rate over
/// the last `capacity` completed buckets.
#[derive(Debug, Clone)]
pub struct RateSampler {
    interval: Duration,
    capacity: usize,
    samples: VecDeque<u32>,
    current: u32,
    bucket_start: Instant,
}

impl RateSampler {
    /// Zero-length intervals are raised to one millisecond.
    pub fn new(interval: Duration, capacity: usize, now: Instant) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
            current: 0,
            bucket_start: now,
        }
    }

    /// Count `n` events at `now`.
    pub fn record(&mut self, n: u32, now: Instant) {
        self.roll(now);
        self.current = self.current.saturating_add(n);
    }

    /// Average events per second over the completed buckets.
    pub fn per_second(&mut self, now: Instant) -> f32 {
        self.roll(now);
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|&s| u64::from(s)).sum();
        let window = self.interval.as_secs_f64() * self.samples.len() as f64;
        (total as f64 / window) as f32
    }

    /// Completed buckets currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.bucket_start);
        let interval_ns = self.interval.as_nanos();
        let steps = elapsed.as_nanos() / interval_ns;
        if steps == 0 {
            return;
        }

        self.push(self.current);
        self.current = 0;
        // Buckets that passed with no events at all.
        let idle = (steps - 1).min(self.capacity as u128);
        for _ in 0..idle {
            self.push(0);
        }

        let remainder = (elapsed.as_nanos() % interval_ns) as u64;
        self.bucket_start = now - Duration::from_nanos(remainder);
    }

    fn push(&mut self, sample: u32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}
