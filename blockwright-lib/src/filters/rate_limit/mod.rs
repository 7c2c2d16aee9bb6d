//! Throttles pread/pwrite bytes/sec per connection using a Count-Min
//! Sketch over a dual-buffer sliding window (see [`estimator`],
//! [`rate`], [`limiter`]), retargeted from request counting to
//! byte-count throttling on the data path. A throttled call rejects
//! with `Errno::NoSpc`, distinct from `Errno::Shutdown` (reserved for
//! the server-wide quit signal), so a client can tell "retry" apart
//! from "the connection is going away."

pub mod estimator;
pub mod limiter;
pub mod rate;

use std::sync::atomic::{AtomicU64, Ordering};

use limiter::RateLimiter;

use crate::backend::types::OpFlags;
use crate::backend::{Backend, Filter};
use crate::context::Context;
use crate::error::Errno;
use crate::BlockwrightError;

const DEFAULT_WINDOW_MS: u64 = 1000;

pub struct RateLimitFilter {
    read_limiter: RateLimiter,
    write_limiter: RateLimiter,
    next_connection_id: AtomicU64,
}

impl RateLimitFilter {
    pub fn new() -> Self {
        Self {
            read_limiter: RateLimiter::new(u64::MAX, DEFAULT_WINDOW_MS),
            write_limiter: RateLimiter::new(u64::MAX, DEFAULT_WINDOW_MS),
            next_connection_id: AtomicU64::new(1),
        }
    }
}

impl Default for RateLimitFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn connection_id(ctx: &mut Context) -> u64 {
    *ctx.handle_mut().downcast_mut::<u64>().expect("rate-limit context handle is not a connection id")
}

fn parse_bytes_per_second(value: &str) -> Result<u64, BlockwrightError> {
    value.parse().map_err(|_| BlockwrightError::Config(format!("rate-limit: invalid bytes/sec {value:?}")))
}

impl Filter for RateLimitFilter {
    fn name(&self) -> &str {
        "rate-limit"
    }

    fn config(&self, key: &str, value: &str, next: &Backend) -> Result<(), BlockwrightError> {
        match key {
            "rate" => {
                let bps = parse_bytes_per_second(value)?;
                self.read_limiter.set_bytes_per_second(bps);
                self.write_limiter.set_bytes_per_second(bps);
                Ok(())
            }
            "rate-read" => {
                self.read_limiter.set_bytes_per_second(parse_bytes_per_second(value)?);
                Ok(())
            }
            "rate-write" => {
                self.write_limiter.set_bytes_per_second(parse_bytes_per_second(value)?);
                Ok(())
            }
            other => next.config(other, value),
        }
    }

    fn open(&self, next: &Backend, readonly: bool, exportname: &str, using_tls: bool, peer: Option<std::net::IpAddr>) -> Result<Context, Errno> {
        let next_ctx = next.open(readonly, exportname, using_tls, peer)?;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        Ok(Context::new(Box::new(id), Some(Box::new(next_ctx))))
    }

    fn pread(&self, next: &Backend, ctx: &mut Context, buf: &mut [u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        let id = connection_id(ctx);
        if !self.read_limiter.check(&id, buf.len() as isize).is_allowed() {
            return Err(Errno::NoSpc);
        }
        next.pread(ctx.next_mut().expect("rate-limit context missing next"), buf, offset, flags)
    }

    fn pwrite(&self, next: &Backend, ctx: &mut Context, buf: &[u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        let id = connection_id(ctx);
        if !self.write_limiter.check(&id, buf.len() as isize).is_allowed() {
            return Err(Errno::NoSpc);
        }
        next.pwrite(ctx.next_mut().expect("rate-limit context missing next"), buf, offset, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::memory::MemoryPlugin;

    fn pipeline() -> (RateLimitFilter, Backend) {
        (RateLimitFilter::new(), Backend::plugin(MemoryPlugin::new()))
    }

    #[test]
    fn reads_under_the_budget_pass_through() {
        let (filter, plugin_backend) = pipeline();
        let backend = Backend::filter(filter, 1, plugin_backend);
        let mut ctx = backend.open(false, "", false, None).unwrap();
        backend.prepare(&mut ctx, false).unwrap();

        let mut buf = [0u8; 16];
        assert!(backend.pread(&mut ctx, &mut buf, 0, OpFlags::empty()).is_ok());
    }

    #[test]
    fn exceeding_the_configured_write_budget_is_throttled() {
        let (filter, plugin_backend) = pipeline();
        filter.config("rate-write", "16", &plugin_backend).unwrap();
        let backend = Backend::filter(filter, 1, plugin_backend);
        let mut ctx = backend.open(false, "", false, None).unwrap();
        backend.prepare(&mut ctx, false).unwrap();

        let small = [0u8; 8];
        assert!(backend.pwrite(&mut ctx, &small, 0, OpFlags::empty()).is_ok());
        let big = [0u8; 4096];
        assert_eq!(backend.pwrite(&mut ctx, &big, 0, OpFlags::empty()).unwrap_err(), Errno::NoSpc);
    }
}
