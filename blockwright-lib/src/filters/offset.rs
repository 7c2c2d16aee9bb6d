//! Translates every request by a fixed byte offset and optionally clamps
//! the advertised size to a fixed range.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::backend::types::{BlockSize, CacheLevel, FuaLevel, OpFlags, ZeroLevel};
use crate::backend::{Backend, Filter};
use crate::context::Context;
use crate::error::Errno;
use crate::extent::ExtentSet;
use crate::BlockwrightError;

pub struct OffsetFilter {
    offset: AtomicU64,
    /// -1 means "unset": serve the rest of the underlying size.
    range: AtomicI64,
}

impl OffsetFilter {
    pub fn new() -> Self {
        Self { offset: AtomicU64::new(0), range: AtomicI64::new(-1) }
    }

    fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    fn range(&self) -> Option<u64> {
        let r = self.range.load(Ordering::Relaxed);
        if r < 0 {
            None
        } else {
            Some(r as u64)
        }
    }
}

impl Default for OffsetFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for OffsetFilter {
    fn name(&self) -> &str {
        "offset"
    }

    fn config(&self, key: &str, value: &str, next: &Backend) -> Result<(), BlockwrightError> {
        match key {
            "offset" => {
                let v: u64 = value.parse().map_err(|_| BlockwrightError::Config(format!("offset: invalid offset {value:?}")))?;
                self.offset.store(v, Ordering::Relaxed);
                Ok(())
            }
            "range" => {
                let v: i64 = value.parse().map_err(|_| BlockwrightError::Config(format!("offset: invalid range {value:?}")))?;
                self.range.store(v, Ordering::Relaxed);
                Ok(())
            }
            other => next.config(other, value),
        }
    }

    fn get_size(&self, next: &Backend, ctx: &mut Context) -> Result<i64, Errno> {
        let real_size = next.get_size(ctx.next_mut().expect("offset context missing next"))?;
        let offset = self.offset() as i64;
        match self.range() {
            Some(range) => {
                let range = range as i64;
                if offset > real_size - range {
                    return Err(Errno::Inval);
                }
                Ok(range)
            }
            None => {
                if offset > real_size {
                    Err(Errno::Inval)
                } else {
                    Ok(real_size - offset)
                }
            }
        }
    }

    fn block_size(&self, next: &Backend, ctx: &mut Context) -> Result<BlockSize, Errno> {
        next.block_size(ctx.next_mut().expect("offset context missing next"))
    }

    fn pread(&self, next: &Backend, ctx: &mut Context, buf: &mut [u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        next.pread(ctx.next_mut().expect("offset context missing next"), buf, offset + self.offset(), flags)
    }

    fn pwrite(&self, next: &Backend, ctx: &mut Context, buf: &[u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        next.pwrite(ctx.next_mut().expect("offset context missing next"), buf, offset + self.offset(), flags)
    }

    fn trim(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        next.trim(ctx.next_mut().expect("offset context missing next"), count, offset + self.offset(), flags)
    }

    fn zero(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        next.zero(ctx.next_mut().expect("offset context missing next"), count, offset + self.offset(), flags)
    }

    fn cache(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        next.cache(ctx.next_mut().expect("offset context missing next"), count, offset + self.offset(), flags)
    }

    fn extents(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags, out: &mut ExtentSet) -> Result<(), Errno> {
        let next_ctx = ctx.next_mut().expect("offset context missing next");
        let base = self.offset();
        let real_end = match self.range() {
            Some(range) => base + range,
            None => next.get_size(next_ctx)? as u64,
        };
        let mut inner = ExtentSet::new(offset + base, real_end).map_err(|_| Errno::Inval)?;
        next.extents(next_ctx, count, offset + base, flags, &mut inner)?;
        for ex in inner.iter() {
            out.add(ex.offset - base, ex.length, ex.ty).map_err(|_| Errno::Io)?;
        }
        Ok(())
    }

    fn can_fua(&self, next: &Backend, ctx: &mut Context) -> Result<FuaLevel, Errno> {
        next.can_fua(ctx.next_mut().expect("offset context missing next"))
    }

    fn can_zero(&self, next: &Backend, ctx: &mut Context) -> Result<ZeroLevel, Errno> {
        next.can_zero(ctx.next_mut().expect("offset context missing next"))
    }

    fn can_cache(&self, next: &Backend, ctx: &mut Context) -> Result<CacheLevel, Errno> {
        next.can_cache(ctx.next_mut().expect("offset context missing next"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::plugins::memory::MemoryPlugin;

    fn pipeline(size: &str, offset: &str, range: Option<&str>) -> Backend {
        let plugin = MemoryPlugin::new();
        plugin.config("size", size).unwrap();
        let plugin_backend = Backend::plugin(plugin);
        let filter = OffsetFilter::new();
        filter.config("offset", offset, &plugin_backend).unwrap();
        if let Some(r) = range {
            filter.config("range", r, &plugin_backend).unwrap();
        }
        Backend::filter(filter, 1, plugin_backend)
    }

    #[test]
    fn s1_translates_offset_and_clamps_size() {
        let backend = pipeline("8192", "4096", None);
        let mut ctx = backend.open(false, "", false, None).unwrap();
        backend.prepare(&mut ctx, false).unwrap();
        assert_eq!(backend.get_size(&mut ctx).unwrap(), 4096);

        let mut buf = [0u8; 16];
        backend.pwrite(&mut ctx, &[0xAB; 16], 0, OpFlags::empty()).unwrap();
        backend.pread(&mut ctx, &mut buf, 0, OpFlags::empty()).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn range_clamps_further_than_offset_alone() {
        let backend = pipeline("8192", "1024", Some("2048"));
        let mut ctx = backend.open(false, "", false, None).unwrap();
        backend.prepare(&mut ctx, false).unwrap();
        assert_eq!(backend.get_size(&mut ctx).unwrap(), 2048);
    }

    #[test]
    fn offset_beyond_real_size_is_rejected() {
        let backend = pipeline("1024", "2048", None);
        let mut ctx = backend.open(false, "", false, None).unwrap();
        assert_eq!(backend.get_size(&mut ctx).unwrap_err(), Errno::Inval);
    }
}
