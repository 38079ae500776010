//! Closed-loop controller for the dispatcher's fetch size.
//!
//! AIMD-flavoured: grow ~20% while iterations land under the latency target,
//! shrink to ~70% when they overrun, snap back to the minimum as soon as the
//! queue drains (a short fetch means the backlog is gone, so a big batch
//! only adds latency to the next burst).

use std::time::Duration;

use tcap_config::OutboxSettings;

pub struct AdaptiveBatchSizer {
    current: i64,
    min: i64,
    max: i64,
    target_latency_ms: u64,
}

impl AdaptiveBatchSizer {
    pub fn new(settings: &OutboxSettings) -> Self {
        AdaptiveBatchSizer {
            current: settings.min_batch,
            min: settings.min_batch,
            max: settings.max_batch,
            target_latency_ms: settings.target_latency_ms,
        }
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    /// Snap back to the minimum (idle queue).
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn adjust(&mut self, elapsed: Duration, records_returned: i64) {
        if records_returned < self.current {
            // The fetch came back short: the queue is draining.
            self.current = self.min;
            return;
        }
        if (elapsed.as_millis() as u64) < self.target_latency_ms {
            let grown = (self.current as f64 * 1.2).round() as i64;
            // Step by at least one so growth cannot stall at small sizes.
            self.current = grown.max(self.current + 1).min(self.max);
        } else {
            let shrunk = (self.current as f64 * 0.7).round() as i64;
            // Overrunning the target must strictly shrink the next batch.
            self.current = shrunk.min(self.current - 1).max(self.min);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer(min: i64, max: i64, target_ms: u64) -> AdaptiveBatchSizer {
        let mut s = OutboxSettings::default();
        s.min_batch = min;
        s.max_batch = max;
        s.target_latency_ms = target_ms;
        AdaptiveBatchSizer::new(&s)
    }

    #[test]
    fn grows_under_target_until_max() {
        let mut s = sizer(10, 50, 200);
        for _ in 0..30 {
            let cur = s.current();
            s.adjust(Duration::from_millis(50), cur);
        }
        assert_eq!(s.current(), 50);
    }

    #[test]
    fn growth_steps_at_least_one() {
        let mut s = sizer(1, 100, 200);
        s.adjust(Duration::from_millis(10), 1);
        assert!(s.current() >= 2);
    }

    #[test]
    fn over_target_strictly_shrinks() {
        let mut s = sizer(10, 2000, 200);
        for _ in 0..10 {
            let cur = s.current();
            s.adjust(Duration::from_millis(50), cur);
        }
        let before = s.current();
        s.adjust(Duration::from_millis(500), before);
        assert!(s.current() < before);
        assert!(s.current() >= 10);
    }

    #[test]
    fn short_fetch_resets_to_min() {
        let mut s = sizer(10, 2000, 200);
        for _ in 0..10 {
            let cur = s.current();
            s.adjust(Duration::from_millis(50), cur);
        }
        assert!(s.current() > 10);
        let cur = s.current();
        s.adjust(Duration::from_millis(50), cur - 1);
        assert_eq!(s.current(), 10);
    }

    #[test]
    fn reset_returns_to_min() {
        let mut s = sizer(10, 2000, 200);
        let cur = s.current();
        s.adjust(Duration::from_millis(10), cur);
        s.reset();
        assert_eq!(s.current(), 10);
    }
}
