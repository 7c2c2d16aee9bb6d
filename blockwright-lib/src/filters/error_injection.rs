//! Deterministic error injection per operation kind, for fault-testing
//! pipelines. Rather than drawing a fresh random number per call, this
//! counts calls and injects every Nth one (N = round(1/rate)), the same
//! "fail 1 in N" idea expressed with the atomic counters this crate's
//! rate-limit machinery already uses, and deterministic enough to
//! assert on in tests. A trigger-file option (arm the filter only once
//! a marker file exists) is intentionally not supported — no
//! filesystem side channel here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::backend::types::OpFlags;
use crate::backend::{Backend, Filter};
use crate::context::Context;
use crate::error::Errno;
use crate::extent::ExtentSet;
use crate::BlockwrightError;

struct OpSetting {
    error: RwLock<Errno>,
    rate: RwLock<f64>,
    counter: AtomicU64,
}

impl OpSetting {
    fn new() -> Self {
        Self { error: RwLock::new(Errno::Io), rate: RwLock::new(0.0), counter: AtomicU64::new(0) }
    }

    fn trigger(&self) -> Option<Errno> {
        let rate = *self.rate.read().unwrap();
        if rate <= 0.0 {
            return None;
        }
        if rate >= 1.0 {
            return Some(*self.error.read().unwrap());
        }
        let every_nth = (1.0 / rate).round().max(1.0) as u64;
        let call = self.counter.fetch_add(1, Ordering::Relaxed);
        if call % every_nth == 0 {
            Some(*self.error.read().unwrap())
        } else {
            None
        }
    }
}

fn parse_errno(name: &str) -> Result<Errno, BlockwrightError> {
    match name {
        "EPERM" => Ok(Errno::Perm),
        "EIO" => Ok(Errno::Io),
        "ENOMEM" => Ok(Errno::NoMem),
        "EINVAL" => Ok(Errno::Inval),
        "ENOSPC" => Ok(Errno::NoSpc),
        "ESHUTDOWN" => Ok(Errno::Shutdown),
        other => Err(BlockwrightError::Config(format!("error: unknown error name {other:?}"))),
    }
}

fn parse_rate(value: &str) -> Result<f64, BlockwrightError> {
    let (digits, percent) = match value.strip_suffix('%') {
        Some(p) => (p, true),
        None => (value, false),
    };
    let mut d: f64 = digits.parse().map_err(|_| BlockwrightError::Config(format!("error: invalid rate {value:?}")))?;
    if percent {
        d /= 100.0;
    }
    if !(0.0..=1.0).contains(&d) {
        return Err(BlockwrightError::Config(format!("error: rate out of range: {value:?}")));
    }
    Ok(d)
}

pub struct ErrorInjectionFilter {
    pread: OpSetting,
    pwrite: OpSetting,
    trim: OpSetting,
    zero: OpSetting,
    extents: OpSetting,
    cache: OpSetting,
}

impl ErrorInjectionFilter {
    pub fn new() -> Self {
        Self {
            pread: OpSetting::new(),
            pwrite: OpSetting::new(),
            trim: OpSetting::new(),
            zero: OpSetting::new(),
            extents: OpSetting::new(),
            cache: OpSetting::new(),
        }
    }

    fn all(&self) -> [&OpSetting; 6] {
        [&self.pread, &self.pwrite, &self.trim, &self.zero, &self.extents, &self.cache]
    }
}

impl Default for ErrorInjectionFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for ErrorInjectionFilter {
    fn name(&self) -> &str {
        "error"
    }

    fn config(&self, key: &str, value: &str, next: &Backend) -> Result<(), BlockwrightError> {
        match key {
            "error" => {
                let e = parse_errno(value)?;
                for op in self.all() {
                    *op.error.write().unwrap() = e;
                }
                Ok(())
            }
            "error-pread" => {
                *self.pread.error.write().unwrap() = parse_errno(value)?;
                Ok(())
            }
            "error-pwrite" => {
                *self.pwrite.error.write().unwrap() = parse_errno(value)?;
                Ok(())
            }
            "error-trim" => {
                *self.trim.error.write().unwrap() = parse_errno(value)?;
                Ok(())
            }
            "error-zero" => {
                *self.zero.error.write().unwrap() = parse_errno(value)?;
                Ok(())
            }
            "error-extents" => {
                *self.extents.error.write().unwrap() = parse_errno(value)?;
                Ok(())
            }
            "error-cache" => {
                *self.cache.error.write().unwrap() = parse_errno(value)?;
                Ok(())
            }
            "error-rate" => {
                let r = parse_rate(value)?;
                for op in self.all() {
                    *op.rate.write().unwrap() = r;
                }
                Ok(())
            }
            "error-pread-rate" => {
                *self.pread.rate.write().unwrap() = parse_rate(value)?;
                Ok(())
            }
            "error-pwrite-rate" => {
                *self.pwrite.rate.write().unwrap() = parse_rate(value)?;
                Ok(())
            }
            "error-trim-rate" => {
                *self.trim.rate.write().unwrap() = parse_rate(value)?;
                Ok(())
            }
            "error-zero-rate" => {
                *self.zero.rate.write().unwrap() = parse_rate(value)?;
                Ok(())
            }
            "error-extents-rate" => {
                *self.extents.rate.write().unwrap() = parse_rate(value)?;
                Ok(())
            }
            "error-cache-rate" => {
                *self.cache.rate.write().unwrap() = parse_rate(value)?;
                Ok(())
            }
            other => next.config(other, value),
        }
    }

    fn pread(&self, next: &Backend, ctx: &mut Context, buf: &mut [u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        if let Some(e) = self.pread.trigger() {
            return Err(e);
        }
        next.pread(ctx.next_mut().expect("error context missing next"), buf, offset, flags)
    }

    fn pwrite(&self, next: &Backend, ctx: &mut Context, buf: &[u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        if let Some(e) = self.pwrite.trigger() {
            return Err(e);
        }
        next.pwrite(ctx.next_mut().expect("error context missing next"), buf, offset, flags)
    }

    fn trim(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        if let Some(e) = self.trim.trigger() {
            return Err(e);
        }
        next.trim(ctx.next_mut().expect("error context missing next"), count, offset, flags)
    }

    fn zero(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        if let Some(e) = self.zero.trigger() {
            return Err(e);
        }
        next.zero(ctx.next_mut().expect("error context missing next"), count, offset, flags)
    }

    fn extents(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags, out: &mut ExtentSet) -> Result<(), Errno> {
        if let Some(e) = self.extents.trigger() {
            return Err(e);
        }
        next.extents(ctx.next_mut().expect("error context missing next"), count, offset, flags, out)
    }

    fn cache(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        if let Some(e) = self.cache.trigger() {
            return Err(e);
        }
        next.cache(ctx.next_mut().expect("error context missing next"), count, offset, flags)
    }
}
