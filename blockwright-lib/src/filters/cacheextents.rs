//! Memoizes the inner backend's last `extents` answer so that repeated
//! `block-status` queries against a slowly-changing backend don't
//! re-dispatch. The cache is a single slot shared across every
//! connection through this filter instance (not per-connection), and is
//! invalidated by any write, trim, or zero.

use std::sync::Mutex;

use crate::backend::types::OpFlags;
use crate::backend::{Backend, Filter};
use crate::context::Context;
use crate::error::Errno;
use crate::extent::{Extent, ExtentSet};

struct Cached {
    start: u64,
    end: u64,
    records: Vec<Extent>,
}

pub struct CacheExtentsFilter {
    cache: Mutex<Option<Cached>>,
}

impl CacheExtentsFilter {
    pub fn new() -> Self {
        Self { cache: Mutex::new(None) }
    }
}

impl Default for CacheExtentsFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for CacheExtentsFilter {
    fn name(&self) -> &str {
        "cacheextents"
    }

    fn extents(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags, out: &mut ExtentSet) -> Result<(), Errno> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(c) = cache.as_ref() {
                if offset >= c.start && offset < c.end {
                    // Re-window the cached records (spanning the whole
                    // last-fetched range) down to this query's
                    // [offset, offset+count) before re-adding, so a
                    // follow-up query narrower than the cached range
                    // doesn't feed an offset below `out`'s frontier.
                    let window_end = offset.saturating_add(count).min(c.end).max(offset + 1);
                    let mut windowed = ExtentSet::new(c.start, c.end).map_err(|_| Errno::Io)?;
                    for ex in &c.records {
                        windowed.add(ex.offset, ex.length, ex.ty).map_err(|_| Errno::Io)?;
                    }
                    windowed.trim_to(offset, window_end);
                    for ex in windowed.iter() {
                        out.add(ex.offset, ex.length, ex.ty).map_err(|_| Errno::Io)?;
                    }
                    return Ok(());
                }
            }
        }

        // Cache miss: ask for as much as the backend is willing to give,
        // not just one extent, so the cache is worth refilling.
        let relaxed_flags = flags.difference(OpFlags::REQ_ONE);
        next.extents(ctx.next_mut().expect("cacheextents context missing next"), count, offset, relaxed_flags, out)?;

        if out.count() > 0 {
            let first = out.get(0).unwrap();
            let last = out.get(out.count() - 1).unwrap();
            let mut cache = self.cache.lock().unwrap();
            *cache = Some(Cached { start: first.offset, end: last.offset + last.length, records: out.iter().copied().collect() });
        }
        Ok(())
    }

    fn pwrite(&self, next: &Backend, ctx: &mut Context, buf: &[u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        *self.cache.lock().unwrap() = None;
        next.pwrite(ctx.next_mut().expect("cacheextents context missing next"), buf, offset, flags)
    }

    fn trim(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        *self.cache.lock().unwrap() = None;
        next.trim(ctx.next_mut().expect("cacheextents context missing next"), count, offset, flags)
    }

    fn zero(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        *self.cache.lock().unwrap() = None;
        next.zero(ctx.next_mut().expect("cacheextents context missing next"), count, offset, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::{BlockSize, Handle};
    use crate::backend::{Backend, Plugin};
    use crate::extent::ExtentType;

    struct CountingPlugin {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            "counting"
        }
        fn open(&self, _readonly: bool, _exportname: &str, _using_tls: bool, _peer: Option<std::net::IpAddr>) -> Result<Handle, Errno> {
            Ok(Box::new(()))
        }
        fn get_size(&self, _handle: &mut Handle) -> Result<i64, Errno> {
            Ok(65536)
        }
        fn block_size(&self, _handle: &mut Handle) -> Result<BlockSize, Errno> {
            Ok(BlockSize::default())
        }
        fn can_write(&self, _handle: &mut Handle) -> Result<bool, Errno> {
            Ok(true)
        }
        fn can_extents(&self, _handle: &mut Handle) -> Result<bool, Errno> {
            Ok(true)
        }
        fn pread(&self, _handle: &mut Handle, buf: &mut [u8], _offset: u64, _flags: OpFlags) -> Result<(), Errno> {
            buf.fill(0);
            Ok(())
        }
        fn pwrite(&self, _handle: &mut Handle, _buf: &[u8], _offset: u64, _flags: OpFlags) -> Result<(), Errno> {
            Ok(())
        }
        fn extents(&self, _handle: &mut Handle, _count: u64, _offset: u64, _flags: OpFlags, out: &mut crate::extent::ExtentSet) -> Result<(), Errno> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            out.add(0, 65536, ExtentType::ZERO).map_err(|_| Errno::Io)
        }
    }

    #[test]
    fn repeat_queries_within_the_cached_range_do_not_redispatch() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let plugin_backend = Backend::plugin(CountingPlugin { calls: calls.clone() });
        let backend = Backend::filter(CacheExtentsFilter::new(), 1, plugin_backend);
        let mut ctx = backend.open(false, "", false, None).unwrap();
        backend.prepare(&mut ctx, false).unwrap();

        let mut out1 = ExtentSet::new(0, 65536).unwrap();
        backend.extents(&mut ctx, 4096, 0, OpFlags::empty(), &mut out1).unwrap();

        // Anchored at the query's actual offset (100), like a real
        // caller's `out` would be (`wire/server.rs` builds it from the
        // request header's offset) — not re-anchored at 0.
        let mut out2 = ExtentSet::new(100, 100 + 4096).unwrap();
        backend.extents(&mut ctx, 4096, 100, OpFlags::empty(), &mut out2).unwrap();
        assert_eq!(out2.count(), 1);
        assert_eq!(out2.get(0), Some(&Extent { offset: 100, length: 4096, ty: ExtentType::ZERO }));
        assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn a_write_invalidates_the_cache() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let plugin_backend = Backend::plugin(CountingPlugin { calls: calls.clone() });
        let backend = Backend::filter(CacheExtentsFilter::new(), 1, plugin_backend);
        let mut ctx = backend.open(false, "", false, None).unwrap();
        backend.prepare(&mut ctx, false).unwrap();

        let mut out = ExtentSet::new(0, 65536).unwrap();
        backend.extents(&mut ctx, 4096, 0, OpFlags::empty(), &mut out).unwrap();
        backend.pwrite(&mut ctx, &[0u8; 16], 0, OpFlags::empty()).unwrap();

        let mut out2 = ExtentSet::new(0, 65536).unwrap();
        backend.extents(&mut ctx, 4096, 0, OpFlags::empty(), &mut out2).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
