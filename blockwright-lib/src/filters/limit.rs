//! Caps the number of concurrently open contexts through this layer.
//! Some implementations of this idea enforce the cap twice: once in a
//! `preconnect` stage (before any TLS/negotiation) and again in `open`
//! (because a client can stall between the two). This rewrite has no
//! preconnect phase, so the cap is enforced once, at `open`/`close` —
//! noted as an Open Question resolution in the design ledger.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::backend::{Backend, Filter};
use crate::context::Context;
use crate::error::Errno;
use crate::BlockwrightError;

pub struct LimitFilter {
    /// 0 disables the filter.
    limit: AtomicU32,
    connections: AtomicUsize,
}

impl LimitFilter {
    pub fn new() -> Self {
        Self { limit: AtomicU32::new(1), connections: AtomicUsize::new(0) }
    }
}

impl Default for LimitFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for LimitFilter {
    fn name(&self) -> &str {
        "limit"
    }

    fn config(&self, key: &str, value: &str, next: &Backend) -> Result<(), BlockwrightError> {
        match key {
            "limit" => {
                let v: u32 = value.parse().map_err(|_| BlockwrightError::Config(format!("limit: invalid limit {value:?}")))?;
                self.limit.store(v, Ordering::Relaxed);
                Ok(())
            }
            other => next.config(other, value),
        }
    }

    fn open(&self, next: &Backend, readonly: bool, exportname: &str, using_tls: bool, peer: Option<std::net::IpAddr>) -> Result<Context, Errno> {
        let next_ctx = next.open(readonly, exportname, using_tls, peer)?;

        let limit = self.limit.load(Ordering::Relaxed);
        if limit > 0 {
            // Re-checked here, not just at a preconnect stage, so a
            // client can't race past the limit by stalling negotiation.
            let current = self.connections.fetch_add(1, Ordering::SeqCst);
            if current >= limit as usize {
                self.connections.fetch_sub(1, Ordering::SeqCst);
                next.close(next_ctx);
                return Err(Errno::Inval);
            }
        }

        Ok(Context::new(Box::new(()), Some(Box::new(next_ctx))))
    }

    fn close(&self, _ctx: &mut Context) {
        if self.limit.load(Ordering::Relaxed) > 0 {
            self.connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
