//! Dual-buffer sliding-window rate tracker.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use super::estimator::Estimator;

pub struct Rate {
    red_slot: Estimator,
    blue_slot: Estimator,
    red_or_blue: AtomicBool,
    start: Instant,
    reset_interval_ms: u64,
    last_reset_time: AtomicU64,
}

impl Rate {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            red_slot: Estimator::new(3, 1024),
            blue_slot: Estimator::new(3, 1024),
            red_or_blue: AtomicBool::new(true),
            start: Instant::now(),
            reset_interval_ms: interval_ms.max(1),
            last_reset_time: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> u64 {
        self.reset_interval_ms
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn active(&self) -> &Estimator {
        if self.red_or_blue.load(Ordering::SeqCst) {
            &self.red_slot
        } else {
            &self.blue_slot
        }
    }

    fn standby(&self) -> &Estimator {
        if self.red_or_blue.load(Ordering::SeqCst) {
            &self.blue_slot
        } else {
            &self.red_slot
        }
    }

    fn maybe_reset(&self) {
        let now = self.now_ms();
        let last = self.last_reset_time.load(Ordering::SeqCst);
        if now < last {
            tracing::warn!(now, last, "rate limiter observed a non-monotonic timestamp");
            return;
        }
        if now.saturating_sub(last) < self.reset_interval_ms {
            return;
        }
        if self.last_reset_time.compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            self.standby().reset();
            self.red_or_blue.fetch_xor(true, Ordering::SeqCst);
        }
    }

    pub fn observe<T: Hash>(&self, key: &T, events: isize) -> isize {
        self.maybe_reset();
        self.active().incr(key, events)
    }

    pub fn rate<T: Hash>(&self, key: &T) -> f64 {
        self.maybe_reset();
        let count = self.active().get(key).max(0) as f64;
        count / (self.reset_interval_ms as f64 / 1000.0)
    }
}
