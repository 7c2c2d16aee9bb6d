//! Token-bucket-flavored check built on top of [`Rate`], retargeted
//! from request counting to byte-count throttling.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use super::rate::Rate;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitResult {
    Allowed { limit: u64, remaining: u64 },
    Limited { limit: u64, remaining: u64, reset_after_ms: u64 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    pub fn remaining(&self) -> u64 {
        match self {
            RateLimitResult::Allowed { remaining, .. } | RateLimitResult::Limited { remaining, .. } => *remaining,
        }
    }
}

pub struct RateLimiter {
    rate: Rate,
    max_per_window: AtomicU64,
}

impl RateLimiter {
    pub fn new(bytes_per_second: u64, window_ms: u64) -> Self {
        let limiter = Self { rate: Rate::new(window_ms), max_per_window: AtomicU64::new(1) };
        limiter.set_bytes_per_second(bytes_per_second);
        limiter
    }

    pub fn set_bytes_per_second(&self, bytes_per_second: u64) {
        let max_per_window = bytes_per_second.saturating_mul(self.rate.interval()) / 1000;
        self.max_per_window.store(max_per_window.max(1), Ordering::Relaxed);
    }

    pub fn window(&self) -> u64 {
        self.rate.interval()
    }

    pub fn max_per_window(&self) -> u64 {
        self.max_per_window.load(Ordering::Relaxed)
    }

    pub fn check<T: Hash>(&self, key: &T, bytes: isize) -> RateLimitResult {
        let limit = self.max_per_window();
        let used = self.rate.observe(key, bytes).max(0) as u64;
        if used > limit {
            RateLimitResult::Limited { limit, remaining: 0, reset_after_ms: self.rate.interval() }
        } else {
            RateLimitResult::Allowed { limit, remaining: limit - used }
        }
    }
}
