//! The tagged plugin/filter backend node (spec §9: "cyclic graph and
//! inheritance → tagged variant + successor pointer"). A [`Backend`] is
//! immutable after construction; the recursive dispatch methods here
//! are the "vtable" of spec §4.3. Capability *gating* and *caching* are
//! layered on top by `crate::dispatcher`, which is the only caller that
//! should invoke the raw probes below directly.

pub mod registry;
pub mod types;

use crate::context::Context;
use crate::error::Errno;
use crate::export::ExportsSet;
use crate::extent::ExtentSet;
use crate::thread_model::ThreadModel;
use crate::BlockwrightError;
use types::{BlockSize, CacheLevel, FuaLevel, Handle, OpFlags, ZeroLevel};

/// A leaf backend: the node that owns the underlying data source.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }

    fn load(&self) -> Result<(), BlockwrightError> {
        Ok(())
    }

    fn unload(&self) {}

    fn magic_config_key(&self) -> Option<&str> {
        None
    }

    fn config(&self, key: &str, _value: &str) -> Result<(), BlockwrightError> {
        Err(BlockwrightError::Config(format!("{}: unrecognized parameter {key:?}", self.name())))
    }

    fn open(&self, readonly: bool, exportname: &str, using_tls: bool, peer: Option<std::net::IpAddr>) -> Result<Handle, Errno>;
    fn prepare(&self, _handle: &mut Handle, _readonly: bool) -> Result<(), Errno> {
        Ok(())
    }
    fn finalize(&self, _handle: &mut Handle) -> Result<(), Errno> {
        Ok(())
    }
    fn close(&self, _handle: Handle) {}

    fn get_size(&self, handle: &mut Handle) -> Result<i64, Errno>;
    fn block_size(&self, _handle: &mut Handle) -> Result<BlockSize, Errno> {
        Ok(BlockSize::default())
    }

    fn can_write(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(false)
    }
    fn can_flush(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(false)
    }
    fn is_rotational(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(false)
    }
    fn can_trim(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(false)
    }
    fn can_extents(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(false)
    }
    fn can_multi_conn(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(false)
    }
    fn can_zero(&self, _handle: &mut Handle) -> Result<ZeroLevel, Errno> {
        Ok(ZeroLevel::None)
    }
    fn can_fast_zero(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(false)
    }
    fn can_fua(&self, _handle: &mut Handle) -> Result<FuaLevel, Errno> {
        Ok(FuaLevel::None)
    }
    fn can_cache(&self, _handle: &mut Handle) -> Result<CacheLevel, Errno> {
        Ok(CacheLevel::None)
    }

    fn export_description(&self, _handle: &mut Handle) -> Option<String> {
        None
    }
    fn list_exports(&self, _readonly: bool, _using_tls: bool, _out: &mut ExportsSet) -> Result<(), Errno> {
        Ok(())
    }
    fn default_export(&self, _readonly: bool, _using_tls: bool) -> Option<String> {
        None
    }

    fn pread(&self, handle: &mut Handle, buf: &mut [u8], offset: u64, flags: OpFlags) -> Result<(), Errno>;
    fn pwrite(&self, _handle: &mut Handle, _buf: &[u8], _offset: u64, _flags: OpFlags) -> Result<(), Errno> {
        Err(Errno::NotSup)
    }
    fn flush(&self, _handle: &mut Handle, _flags: OpFlags) -> Result<(), Errno> {
        Err(Errno::NotSup)
    }
    fn trim(&self, _handle: &mut Handle, _count: u64, _offset: u64, _flags: OpFlags) -> Result<(), Errno> {
        Err(Errno::NotSup)
    }
    fn zero(&self, _handle: &mut Handle, _count: u64, _offset: u64, _flags: OpFlags) -> Result<(), Errno> {
        Err(Errno::NotSup)
    }
    fn extents(&self, _handle: &mut Handle, _count: u64, _offset: u64, _flags: OpFlags, _out: &mut ExtentSet) -> Result<(), Errno> {
        Err(Errno::NotSup)
    }
    fn cache(&self, _handle: &mut Handle, _count: u64, _offset: u64, _flags: OpFlags) -> Result<(), Errno> {
        Err(Errno::NotSup)
    }
}

/// A backend that wraps a successor to transform requests or
/// responses. Every method defaults to forwarding unchanged to `next`,
/// mirroring nbdkit's "unimplemented callback delegates" convention:
/// a filter overrides only what it actually transforms.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn thread_model(&self, next: ThreadModel) -> ThreadModel {
        next
    }

    /// Whether this filter keeps state across requests on one
    /// connection in a way that is unsafe to share between connections
    /// on the same export (spec §9's `can_multi_conn` open question).
    fn keeps_per_connection_state(&self) -> bool {
        false
    }

    fn load(&self) -> Result<(), BlockwrightError> {
        Ok(())
    }

    fn unload(&self) {}

    fn magic_config_key(&self) -> Option<&str> {
        None
    }

    fn config(&self, key: &str, value: &str, next: &Backend) -> Result<(), BlockwrightError> {
        next.config(key, value)
    }

    fn open(&self, next: &Backend, readonly: bool, exportname: &str, using_tls: bool, peer: Option<std::net::IpAddr>) -> Result<Context, Errno> {
        let next_ctx = next.open(readonly, exportname, using_tls, peer)?;
        Ok(Context::new(Box::new(()), Some(Box::new(next_ctx))))
    }
    fn prepare(&self, _ctx: &mut Context, _readonly: bool) -> Result<(), Errno> {
        Ok(())
    }
    fn finalize(&self, _ctx: &mut Context) -> Result<(), Errno> {
        Ok(())
    }
    fn close(&self, _ctx: &mut Context) {}

    fn get_size(&self, next: &Backend, ctx: &mut Context) -> Result<i64, Errno> {
        next.get_size(ctx.next_mut().expect("filter context missing next"))
    }
    fn block_size(&self, next: &Backend, ctx: &mut Context) -> Result<BlockSize, Errno> {
        next.block_size(ctx.next_mut().expect("filter context missing next"))
    }

    fn can_write(&self, next: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
        next.can_write(ctx.next_mut().expect("filter context missing next"))
    }
    fn can_flush(&self, next: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
        next.can_flush(ctx.next_mut().expect("filter context missing next"))
    }
    fn is_rotational(&self, next: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
        next.is_rotational(ctx.next_mut().expect("filter context missing next"))
    }
    fn can_trim(&self, next: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
        next.can_trim(ctx.next_mut().expect("filter context missing next"))
    }
    fn can_extents(&self, next: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
        next.can_extents(ctx.next_mut().expect("filter context missing next"))
    }
    fn can_multi_conn(&self, next: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
        next.can_multi_conn(ctx.next_mut().expect("filter context missing next"))
    }
    fn can_zero(&self, next: &Backend, ctx: &mut Context) -> Result<ZeroLevel, Errno> {
        next.can_zero(ctx.next_mut().expect("filter context missing next"))
    }
    fn can_fast_zero(&self, next: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
        next.can_fast_zero(ctx.next_mut().expect("filter context missing next"))
    }
    fn can_fua(&self, next: &Backend, ctx: &mut Context) -> Result<FuaLevel, Errno> {
        next.can_fua(ctx.next_mut().expect("filter context missing next"))
    }
    fn can_cache(&self, next: &Backend, ctx: &mut Context) -> Result<CacheLevel, Errno> {
        next.can_cache(ctx.next_mut().expect("filter context missing next"))
    }

    fn export_description(&self, next: &Backend, ctx: &mut Context) -> Option<String> {
        next.export_description(ctx.next_mut()?)
    }
    fn list_exports(&self, next: &Backend, readonly: bool, using_tls: bool, out: &mut ExportsSet) -> Result<(), Errno> {
        next.list_exports(readonly, using_tls, out)
    }
    fn default_export(&self, next: &Backend, readonly: bool, using_tls: bool) -> Option<String> {
        next.default_export(readonly, using_tls)
    }

    fn pread(&self, next: &Backend, ctx: &mut Context, buf: &mut [u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        next.pread(ctx.next_mut().expect("filter context missing next"), buf, offset, flags)
    }
    fn pwrite(&self, next: &Backend, ctx: &mut Context, buf: &[u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        next.pwrite(ctx.next_mut().expect("filter context missing next"), buf, offset, flags)
    }
    fn flush(&self, next: &Backend, ctx: &mut Context, flags: OpFlags) -> Result<(), Errno> {
        next.flush(ctx.next_mut().expect("filter context missing next"), flags)
    }
    fn trim(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        next.trim(ctx.next_mut().expect("filter context missing next"), count, offset, flags)
    }
    fn zero(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        next.zero(ctx.next_mut().expect("filter context missing next"), count, offset, flags)
    }
    fn extents(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags, out: &mut ExtentSet) -> Result<(), Errno> {
        next.extents(ctx.next_mut().expect("filter context missing next"), count, offset, flags, out)
    }
    fn cache(&self, next: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        next.cache(ctx.next_mut().expect("filter context missing next"), count, offset, flags)
    }
}

/// A named node in the pipeline: either a plugin (leaf, `index == 0`)
/// or a filter (holds an owned successor).
pub enum Backend {
    Plugin(Box<dyn Plugin>),
    Filter { filter: Box<dyn Filter>, index: u32, next: Box<Backend> },
}

impl Backend {
    pub fn plugin(plugin: impl Plugin + 'static) -> Self {
        Backend::Plugin(Box::new(plugin))
    }

    pub fn filter(filter: impl Filter + 'static, index: u32, next: Backend) -> Self {
        Backend::Filter { filter: Box::new(filter), index, next: Box::new(next) }
    }

    /// Same as [`Backend::plugin`], for a trait object already boxed by
    /// the backend registry.
    pub fn plugin_boxed(plugin: Box<dyn Plugin>) -> Self {
        Backend::Plugin(plugin)
    }

    /// Same as [`Backend::filter`], for a trait object already boxed by
    /// the backend registry.
    pub fn filter_boxed(filter: Box<dyn Filter>, index: u32, next: Backend) -> Self {
        Backend::Filter { filter, index, next: Box::new(next) }
    }

    pub fn name(&self) -> &str {
        match self {
            Backend::Plugin(p) => p.name(),
            Backend::Filter { filter, .. } => filter.name(),
        }
    }

    /// 0 for the innermost plugin, increasing outward.
    pub fn index(&self) -> u32 {
        match self {
            Backend::Plugin(_) => 0,
            Backend::Filter { index, .. } => *index,
        }
    }

    pub fn is_plugin(&self) -> bool {
        matches!(self, Backend::Plugin(_))
    }

    /// The reconciled thread model for this backend and everything it
    /// wraps (spec §5: "the server takes the minimum over the
    /// pipeline").
    pub fn thread_model(&self) -> ThreadModel {
        match self {
            Backend::Plugin(p) => p.thread_model(),
            Backend::Filter { filter, next, .. } => filter.thread_model(next.thread_model()),
        }
    }

    /// spec §9's open question: forced to `false` if any layer keeps
    /// per-connection state unsafe to share across connections.
    pub fn forces_single_conn(&self) -> bool {
        match self {
            Backend::Plugin(_) => false,
            Backend::Filter { filter, next, .. } => {
                filter.keeps_per_connection_state()
                    || filter.thread_model(next.thread_model()) == ThreadModel::SerializeConnections
                    || next.forces_single_conn()
            }
        }
    }

    pub fn load(&self) -> Result<(), BlockwrightError> {
        match self {
            Backend::Plugin(p) => p.load(),
            Backend::Filter { filter, next, .. } => {
                next.load()?;
                filter.load()
            }
        }
    }

    pub fn unload(&self) {
        match self {
            Backend::Plugin(p) => p.unload(),
            Backend::Filter { filter, next, .. } => {
                filter.unload();
                next.unload();
            }
        }
    }

    pub fn config(&self, key: &str, value: &str) -> Result<(), BlockwrightError> {
        match self {
            Backend::Plugin(p) => p.config(key, value),
            Backend::Filter { filter, next, .. } => filter.config(key, value, next),
        }
    }

    pub fn open(&self, readonly: bool, exportname: &str, using_tls: bool, peer: Option<std::net::IpAddr>) -> Result<Context, Errno> {
        match self {
            Backend::Plugin(p) => Ok(Context::new(p.open(readonly, exportname, using_tls, peer)?, None)),
            Backend::Filter { filter, next, .. } => filter.open(next, readonly, exportname, using_tls, peer),
        }
    }

    /// Walks inward-to-outward: innermost `prepare` runs first, then
    /// each layer outward, marking the context `CONNECTED` on success.
    pub fn prepare(&self, ctx: &mut Context, readonly: bool) -> Result<(), Errno> {
        match self {
            Backend::Plugin(p) => p.prepare(ctx.handle_mut(), readonly)?,
            Backend::Filter { filter, next, .. } => {
                if let Some(next_ctx) = ctx.next_mut() {
                    next.prepare(next_ctx, readonly)?;
                }
                filter.prepare(ctx, readonly)?;
            }
        }
        ctx.mark_connected();
        Ok(())
    }

    /// Walks outward-to-inward (symmetric to `prepare` reversed). A
    /// failure at any layer marks the context `FAILED`.
    pub fn finalize(&self, ctx: &mut Context) -> Result<(), Errno> {
        let result = match self {
            Backend::Plugin(p) => p.finalize(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => {
                filter.finalize(ctx).and_then(|()| {
                    if let Some(next_ctx) = ctx.next_mut() {
                        next.finalize(next_ctx)
                    } else {
                        Ok(())
                    }
                })
            }
        };
        if result.is_err() {
            ctx.mark_failed();
        }
        result
    }

    /// Walks outward-to-inward. Infallible (best-effort).
    pub fn close(&self, mut ctx: Context) {
        match self {
            Backend::Plugin(p) => p.close(ctx.take_handle()),
            Backend::Filter { filter, next, .. } => {
                filter.close(&mut ctx);
                if let Some(next_ctx) = ctx.take_next() {
                    next.close(*next_ctx);
                }
            }
        }
    }

    pub fn get_size(&self, ctx: &mut Context) -> Result<i64, Errno> {
        match self {
            Backend::Plugin(p) => p.get_size(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.get_size(next, ctx),
        }
    }
    pub fn block_size(&self, ctx: &mut Context) -> Result<BlockSize, Errno> {
        match self {
            Backend::Plugin(p) => p.block_size(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.block_size(next, ctx),
        }
    }

    pub fn can_write(&self, ctx: &mut Context) -> Result<bool, Errno> {
        match self {
            Backend::Plugin(p) => p.can_write(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.can_write(next, ctx),
        }
    }
    pub fn can_flush(&self, ctx: &mut Context) -> Result<bool, Errno> {
        match self {
            Backend::Plugin(p) => p.can_flush(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.can_flush(next, ctx),
        }
    }
    pub fn is_rotational(&self, ctx: &mut Context) -> Result<bool, Errno> {
        match self {
            Backend::Plugin(p) => p.is_rotational(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.is_rotational(next, ctx),
        }
    }
    pub fn can_trim(&self, ctx: &mut Context) -> Result<bool, Errno> {
        match self {
            Backend::Plugin(p) => p.can_trim(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.can_trim(next, ctx),
        }
    }
    pub fn can_extents(&self, ctx: &mut Context) -> Result<bool, Errno> {
        match self {
            Backend::Plugin(p) => p.can_extents(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.can_extents(next, ctx),
        }
    }
    pub fn can_multi_conn(&self, ctx: &mut Context) -> Result<bool, Errno> {
        match self {
            Backend::Plugin(p) => p.can_multi_conn(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.can_multi_conn(next, ctx),
        }
    }
    pub fn can_zero(&self, ctx: &mut Context) -> Result<ZeroLevel, Errno> {
        match self {
            Backend::Plugin(p) => p.can_zero(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.can_zero(next, ctx),
        }
    }
    pub fn can_fast_zero(&self, ctx: &mut Context) -> Result<bool, Errno> {
        match self {
            Backend::Plugin(p) => p.can_fast_zero(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.can_fast_zero(next, ctx),
        }
    }
    pub fn can_fua(&self, ctx: &mut Context) -> Result<FuaLevel, Errno> {
        match self {
            Backend::Plugin(p) => p.can_fua(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.can_fua(next, ctx),
        }
    }
    pub fn can_cache(&self, ctx: &mut Context) -> Result<CacheLevel, Errno> {
        match self {
            Backend::Plugin(p) => p.can_cache(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.can_cache(next, ctx),
        }
    }

    pub fn export_description(&self, ctx: &mut Context) -> Option<String> {
        match self {
            Backend::Plugin(p) => p.export_description(ctx.handle_mut()),
            Backend::Filter { filter, next, .. } => filter.export_description(next, ctx),
        }
    }
    pub fn list_exports(&self, readonly: bool, using_tls: bool, out: &mut ExportsSet) -> Result<(), Errno> {
        match self {
            Backend::Plugin(p) => p.list_exports(readonly, using_tls, out),
            Backend::Filter { filter, next, .. } => filter.list_exports(next, readonly, using_tls, out),
        }
    }
    pub fn default_export(&self, readonly: bool, using_tls: bool) -> Option<String> {
        match self {
            Backend::Plugin(p) => p.default_export(readonly, using_tls),
            Backend::Filter { filter, next, .. } => filter.default_export(next, readonly, using_tls),
        }
    }

    pub fn pread(&self, ctx: &mut Context, buf: &mut [u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        match self {
            Backend::Plugin(p) => p.pread(ctx.handle_mut(), buf, offset, flags),
            Backend::Filter { filter, next, .. } => filter.pread(next, ctx, buf, offset, flags),
        }
    }
    pub fn pwrite(&self, ctx: &mut Context, buf: &[u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
        match self {
            Backend::Plugin(p) => p.pwrite(ctx.handle_mut(), buf, offset, flags),
            Backend::Filter { filter, next, .. } => filter.pwrite(next, ctx, buf, offset, flags),
        }
    }
    pub fn flush(&self, ctx: &mut Context, flags: OpFlags) -> Result<(), Errno> {
        match self {
            Backend::Plugin(p) => p.flush(ctx.handle_mut(), flags),
            Backend::Filter { filter, next, .. } => filter.flush(next, ctx, flags),
        }
    }
    pub fn trim(&self, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        match self {
            Backend::Plugin(p) => p.trim(ctx.handle_mut(), count, offset, flags),
            Backend::Filter { filter, next, .. } => filter.trim(next, ctx, count, offset, flags),
        }
    }
    pub fn zero(&self, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        match self {
            Backend::Plugin(p) => p.zero(ctx.handle_mut(), count, offset, flags),
            Backend::Filter { filter, next, .. } => filter.zero(next, ctx, count, offset, flags),
        }
    }
    pub fn extents(&self, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags, out: &mut ExtentSet) -> Result<(), Errno> {
        match self {
            Backend::Plugin(p) => p.extents(ctx.handle_mut(), count, offset, flags, out),
            Backend::Filter { filter, next, .. } => filter.extents(next, ctx, count, offset, flags, out),
        }
    }
    pub fn cache(&self, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
        match self {
            Backend::Plugin(p) => p.cache(ctx.handle_mut(), count, offset, flags),
            Backend::Filter { filter, next, .. } => filter.cache(next, ctx, count, offset, flags),
        }
    }
}
