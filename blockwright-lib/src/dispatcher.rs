//! The pipeline dispatcher: capability caching/gating, range
//! validation, and the zero/cache emulation fall-backs. This is the
//! direct Rust counterpart of nbdkit's `server/backend.c` — the layer
//! that sits above the filter/plugin chain and decides, once and for
//! all per context, what the chain is allowed to be asked to do.

use crate::backend::types::{OpFlags, TriState};
use crate::backend::Backend;
use crate::context::Context;
use crate::error::Errno;
use crate::export::ExportsSet;
use crate::extent::{ExtentSet, ExtentType};

/// Chunk size used when emulating `zero` via `pwrite` or `cache` via
/// `pread`. Any value >= 4 KiB satisfies the spec; 64 KiB matches
/// nbdkit's `MAX_REQUEST_SIZE` default closely enough to reuse the same
/// reasoning about wire-friendly request sizes.
const MAX_REQUEST_SIZE: usize = 64 * 1024;

static ZERO_BUF: [u8; MAX_REQUEST_SIZE] = [0u8; MAX_REQUEST_SIZE];

fn not_connected<T>() -> Result<T, Errno> {
    Err(Errno::Inval)
}

pub fn open(backend: &Backend, readonly: bool, exportname: &str, using_tls: bool, peer: Option<std::net::IpAddr>) -> Result<Context, Errno> {
    backend.open(readonly, exportname, using_tls, peer)
}

pub fn prepare(backend: &Backend, ctx: &mut Context, readonly: bool) -> Result<(), Errno> {
    backend.prepare(ctx, readonly)
}

pub fn finalize(backend: &Backend, ctx: &mut Context) -> Result<(), Errno> {
    backend.finalize(ctx)
}

pub fn close(backend: &Backend, ctx: Context) {
    backend.close(ctx)
}

pub fn exportsize(backend: &Backend, ctx: &mut Context) -> Result<i64, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.exportsize {
        return Ok(v);
    }
    let v = backend.get_size(ctx)?;
    ctx.caps.exportsize = Some(v);
    Ok(v)
}

pub fn block_size(backend: &Backend, ctx: &mut Context) -> Result<crate::backend::types::BlockSize, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.block_size {
        return Ok(v);
    }
    let v = backend.block_size(ctx)?;
    ctx.caps.block_size = Some(v);
    Ok(v)
}

pub fn can_write(backend: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.can_write {
        return Ok(v);
    }
    let v = backend.can_write(ctx)?;
    ctx.caps.can_write = Some(v);
    Ok(v)
}

pub fn can_flush(backend: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.can_flush {
        return Ok(v);
    }
    let v = backend.can_flush(ctx)?;
    ctx.caps.can_flush = Some(v);
    Ok(v)
}

pub fn is_rotational(backend: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.is_rotational {
        return Ok(v);
    }
    let v = backend.is_rotational(ctx)?;
    ctx.caps.is_rotational = Some(v);
    Ok(v)
}

pub fn can_multi_conn(backend: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.can_multi_conn {
        return Ok(v);
    }
    // Open question (spec §9): multi-conn is forced off whenever any
    // layer keeps per-connection state or demands SERIALIZE_CONNECTIONS.
    let v = if backend.forces_single_conn() { false } else { backend.can_multi_conn(ctx)? };
    ctx.caps.can_multi_conn = Some(v);
    Ok(v)
}

/// `can_trim`: short-circuits to `false` without calling the backend
/// when `can_write` is `false` (spec §4.4, invariant 4).
pub fn can_trim(backend: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.can_trim {
        return Ok(v);
    }
    let v = if !can_write(backend, ctx)? { false } else { backend.can_trim(ctx)? };
    ctx.caps.can_trim = Some(v);
    Ok(v)
}

pub fn can_extents(backend: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.can_extents {
        return Ok(v);
    }
    let v = backend.can_extents(ctx)?;
    ctx.caps.can_extents = Some(v);
    Ok(v)
}

/// `can_zero`: short-circuits to `TriState::None` when `can_write` is
/// `false`.
pub fn can_zero(backend: &Backend, ctx: &mut Context) -> Result<TriState, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.can_zero {
        return Ok(v);
    }
    let v = if !can_write(backend, ctx)? { TriState::None } else { backend.can_zero(ctx)? };
    ctx.caps.can_zero = Some(v);
    Ok(v)
}

/// `can_fast_zero`: short-circuits to `false` when `can_zero` is below
/// `Emulate`.
pub fn can_fast_zero(backend: &Backend, ctx: &mut Context) -> Result<bool, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.can_fast_zero {
        return Ok(v);
    }
    let v = if can_zero(backend, ctx)? < TriState::Emulate { false } else { backend.can_fast_zero(ctx)? };
    ctx.caps.can_fast_zero = Some(v);
    Ok(v)
}

/// `can_fua`: short-circuits to `TriState::None` when `can_write` is
/// `false`.
pub fn can_fua(backend: &Backend, ctx: &mut Context) -> Result<TriState, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.can_fua {
        return Ok(v);
    }
    let v = if !can_write(backend, ctx)? { TriState::None } else { backend.can_fua(ctx)? };
    ctx.caps.can_fua = Some(v);
    Ok(v)
}

pub fn can_cache(backend: &Backend, ctx: &mut Context) -> Result<TriState, Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if let Some(v) = ctx.caps.can_cache {
        return Ok(v);
    }
    let v = backend.can_cache(ctx)?;
    ctx.caps.can_cache = Some(v);
    Ok(v)
}

fn validate_range(backend: &Backend, ctx: &mut Context, count: u64, offset: u64) -> Result<(), Errno> {
    if count == 0 {
        return Err(Errno::Inval);
    }
    let size = exportsize(backend, ctx)?;
    if size < 0 {
        return Err(Errno::Io);
    }
    let end = offset.checked_add(count).ok_or(Errno::Overflow)?;
    if end > size as u64 {
        return Err(Errno::Inval);
    }
    Ok(())
}

pub fn pread(backend: &Backend, ctx: &mut Context, buf: &mut [u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if !flags.is_empty() {
        return Err(Errno::Inval);
    }
    validate_range(backend, ctx, buf.len() as u64, offset)?;
    backend.pread(ctx, buf, offset, flags)
}

pub fn pwrite(backend: &Backend, ctx: &mut Context, buf: &[u8], offset: u64, flags: OpFlags) -> Result<(), Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if !OpFlags::FUA.contains(flags) {
        return Err(Errno::Inval);
    }
    validate_range(backend, ctx, buf.len() as u64, offset)?;
    if !can_write(backend, ctx)? {
        return Err(Errno::Perm);
    }
    if flags.contains(OpFlags::FUA) && can_fua(backend, ctx)? == TriState::None {
        return Err(Errno::Inval);
    }
    backend.pwrite(ctx, buf, offset, flags)
}

pub fn flush(backend: &Backend, ctx: &mut Context, flags: OpFlags) -> Result<(), Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if !flags.is_empty() {
        return Err(Errno::Inval);
    }
    if !can_flush(backend, ctx)? {
        return Err(Errno::Inval);
    }
    backend.flush(ctx, flags)
}

pub fn trim(backend: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    if !OpFlags::FUA.contains(flags) {
        return Err(Errno::Inval);
    }
    validate_range(backend, ctx, count, offset)?;
    if !can_write(backend, ctx)? {
        return Err(Errno::Perm);
    }
    if !can_trim(backend, ctx)? {
        return Err(Errno::Inval);
    }
    if flags.contains(OpFlags::FUA) && can_fua(backend, ctx)? == TriState::None {
        return Err(Errno::Inval);
    }
    backend.trim(ctx, count, offset, flags)
}

/// `zero`, with the EMULATE fall-back split into `MAX_REQUEST_SIZE`
/// chunks of `pwrite` against the shared read-only zero buffer (spec
/// §4.4, scenario S2).
pub fn zero(backend: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    let allowed = OpFlags::FUA | OpFlags::MAY_TRIM | OpFlags::FAST_ZERO;
    if !allowed.contains(flags) {
        return Err(Errno::Inval);
    }
    validate_range(backend, ctx, count, offset)?;

    if !can_write(backend, ctx)? {
        return Err(Errno::Perm);
    }
    let level = can_zero(backend, ctx)?;
    if level == TriState::None {
        return Err(Errno::Inval);
    }
    if flags.contains(OpFlags::FAST_ZERO) && !can_fast_zero(backend, ctx)? {
        // A fast-zero request must fail immediately, before any write,
        // rather than silently falling back to the slow emulated path.
        return Err(Errno::NotSup);
    }
    if flags.contains(OpFlags::FUA) && can_fua(backend, ctx)? == TriState::None {
        return Err(Errno::Inval);
    }

    match level {
        TriState::Native => backend.zero(ctx, count, offset, flags),
        TriState::Emulate => emulate_zero(backend, ctx, count, offset, flags),
        TriState::None => unreachable!("checked above"),
    }
}

fn emulate_zero(backend: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
    let fua_level = can_fua(backend, ctx)?;
    let want_fua = flags.contains(OpFlags::FUA);

    let mut remaining = count;
    let mut off = offset;
    while remaining > 0 {
        let chunk = remaining.min(MAX_REQUEST_SIZE as u64);
        let is_last = chunk == remaining;
        let mut chunk_flags = OpFlags::empty();
        if want_fua {
            match fua_level {
                TriState::Native => chunk_flags |= OpFlags::FUA,
                TriState::Emulate if is_last => chunk_flags |= OpFlags::FUA,
                _ => {}
            }
        }
        let buf = &ZERO_BUF[..chunk as usize];
        if let Err(e) = backend.pwrite(ctx, buf, off, chunk_flags) {
            // Never surface ENOTSUP/EOPNOTSUPP from an already-committed
            // fall-back: that would mislead the client into thinking
            // zero isn't supported at all.
            return Err(if e == Errno::NotSup { Errno::Io } else { e });
        }
        remaining -= chunk;
        off += chunk;
    }
    Ok(())
}

/// `extents`: synthesizes one allocated-data extent covering the whole
/// request when the backend lacks `can_extents`.
pub fn extents(backend: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags, out: &mut ExtentSet) -> Result<(), Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    validate_range(backend, ctx, count, offset)?;
    if !can_extents(backend, ctx)? {
        out.add(offset, count, ExtentType::empty()).map_err(|_| Errno::Io)?;
        return Ok(());
    }
    backend.extents(ctx, count, offset, flags, out)
}

/// `cache`: delegates directly when native, otherwise reads and
/// discards in `MAX_REQUEST_SIZE` chunks.
pub fn cache(backend: &Backend, ctx: &mut Context, count: u64, offset: u64, flags: OpFlags) -> Result<(), Errno> {
    if !ctx.is_connected() {
        return not_connected();
    }
    validate_range(backend, ctx, count, offset)?;
    match can_cache(backend, ctx)? {
        TriState::None => Err(Errno::Inval),
        TriState::Native => backend.cache(ctx, count, offset, flags),
        TriState::Emulate => emulate_cache(backend, ctx, count, offset),
    }
}

fn emulate_cache(backend: &Backend, ctx: &mut Context, count: u64, offset: u64) -> Result<(), Errno> {
    let mut remaining = count;
    let mut off = offset;
    while remaining > 0 {
        let chunk = remaining.min(MAX_REQUEST_SIZE as u64) as usize;
        let mut discard = vec![0u8; chunk];
        backend.pread(ctx, &mut discard, off, OpFlags::empty())?;
        remaining -= chunk as u64;
        off += chunk as u64;
    }
    Ok(())
}

/// Builds the exports set presented to a connecting client, resolving
/// the default-export sentinel via `default_export` (spec §4.2,
/// scenario S5). Best-effort per the open question in DESIGN.md: if no
/// default name is available the sentinel is left unresolved rather
/// than failing the request.
pub fn list_exports(backend: &Backend, readonly: bool, using_tls: bool) -> Result<ExportsSet, Errno> {
    let mut set = ExportsSet::new();
    backend.list_exports(readonly, using_tls, &mut set)?;
    if let Some(name) = backend.default_export(readonly, using_tls) {
        set.resolve_default(&name);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::Handle;
    use crate::backend::{Backend, Plugin};
    use crate::extent::ExtentType;

    /// A small in-memory plugin used only to exercise dispatcher
    /// behavior; the real supplemented plugins live in
    /// `crate::plugins`.
    struct TestPlugin {
        size: i64,
        writable: bool,
        zero_level: TriState,
        fast_zero: bool,
        fua_level: TriState,
        extents: bool,
    }

    struct TestHandle {
        data: Vec<u8>,
    }

    impl Plugin for TestPlugin {
        fn name(&self) -> &str {
            "test"
        }
        fn open(&self, _readonly: bool, _exportname: &str, _using_tls: bool, _peer: Option<std::net::IpAddr>) -> Result<Handle, Errno> {
            Ok(Box::new(TestHandle { data: vec![0u8; self.size as usize] }))
        }
        fn get_size(&self, _handle: &mut Handle) -> Result<i64, Errno> {
            Ok(self.size)
        }
        fn can_write(&self, _handle: &mut Handle) -> Result<bool, Errno> {
            Ok(self.writable)
        }
        fn can_zero(&self, _handle: &mut Handle) -> Result<TriState, Errno> {
            Ok(self.zero_level)
        }
        fn can_fast_zero(&self, _handle: &mut Handle) -> Result<bool, Errno> {
            Ok(self.fast_zero)
        }
        fn can_fua(&self, _handle: &mut Handle) -> Result<TriState, Errno> {
            Ok(self.fua_level)
        }
        fn can_extents(&self, _handle: &mut Handle) -> Result<bool, Errno> {
            Ok(self.extents)
        }
        fn pread(&self, handle: &mut Handle, buf: &mut [u8], offset: u64, _flags: OpFlags) -> Result<(), Errno> {
            let h = handle.downcast_mut::<TestHandle>().unwrap();
            buf.copy_from_slice(&h.data[offset as usize..offset as usize + buf.len()]);
            Ok(())
        }
        fn pwrite(&self, handle: &mut Handle, buf: &[u8], offset: u64, _flags: OpFlags) -> Result<(), Errno> {
            let h = handle.downcast_mut::<TestHandle>().unwrap();
            h.data[offset as usize..offset as usize + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    fn connected(backend: &Backend, size: i64) -> Context {
        let _ = size;
        let mut ctx = backend.open(false, "", false, None).unwrap();
        backend.prepare(&mut ctx, false).unwrap();
        ctx
    }

    #[test]
    fn s4_capability_gating_short_circuits() {
        let backend = Backend::plugin(TestPlugin {
            size: 4096,
            writable: false,
            zero_level: TriState::Native,
            fast_zero: true,
            fua_level: TriState::Native,
            extents: true,
        });
        let mut ctx = connected(&backend, 4096);

        assert_eq!(can_trim(&backend, &mut ctx).unwrap(), false);
        assert_eq!(can_zero(&backend, &mut ctx).unwrap(), TriState::None);
        assert_eq!(can_fua(&backend, &mut ctx).unwrap(), TriState::None);

        let mut buf = [0xABu8; 16];
        assert_eq!(pwrite(&backend, &mut ctx, &mut buf, 0, OpFlags::empty()).unwrap_err(), Errno::Perm);
    }

    #[test]
    fn s2_emulated_zero_fast_zero_fails_before_write() {
        let backend = Backend::plugin(TestPlugin {
            size: 1024 * 1024,
            writable: true,
            zero_level: TriState::Emulate,
            fast_zero: false,
            fua_level: TriState::None,
            extents: false,
        });
        let mut ctx = connected(&backend, 1024 * 1024);

        let err = zero(&backend, &mut ctx, 1024 * 1024, 0, OpFlags::FAST_ZERO).unwrap_err();
        assert_eq!(err, Errno::NotSup);

        zero(&backend, &mut ctx, 1024 * 1024, 0, OpFlags::empty()).unwrap();
        let mut buf = vec![0xFFu8; 1024 * 1024];
        pread(&backend, &mut ctx, &mut buf, 0, OpFlags::empty()).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn range_validation_rejects_without_calling_backend() {
        let backend = Backend::plugin(TestPlugin {
            size: 100,
            writable: true,
            zero_level: TriState::None,
            fast_zero: false,
            fua_level: TriState::None,
            extents: false,
        });
        let mut ctx = connected(&backend, 100);
        let mut buf = [0u8; 10];
        assert_eq!(pread(&backend, &mut ctx, &mut buf, 95, OpFlags::empty()).unwrap_err(), Errno::Inval);
    }

    #[test]
    fn zero_length_request_is_rejected() {
        let backend = Backend::plugin(TestPlugin {
            size: 100,
            writable: true,
            zero_level: TriState::None,
            fast_zero: false,
            fua_level: TriState::None,
            extents: false,
        });
        let mut ctx = connected(&backend, 100);
        let mut buf: [u8; 0] = [];
        assert_eq!(pread(&backend, &mut ctx, &mut buf, 0, OpFlags::empty()).unwrap_err(), Errno::Inval);
    }

    #[test]
    fn request_ending_exactly_at_exportsize_is_accepted() {
        let backend = Backend::plugin(TestPlugin {
            size: 100,
            writable: true,
            zero_level: TriState::None,
            fast_zero: false,
            fua_level: TriState::None,
            extents: false,
        });
        let mut ctx = connected(&backend, 100);
        let mut buf = [0u8; 10];
        assert!(pread(&backend, &mut ctx, &mut buf, 90, OpFlags::empty()).is_ok());
    }

    #[test]
    fn extents_without_can_extents_synthesizes_one_record() {
        let backend = Backend::plugin(TestPlugin {
            size: 65536,
            writable: true,
            zero_level: TriState::None,
            fast_zero: false,
            fua_level: TriState::None,
            extents: false,
        });
        let mut ctx = connected(&backend, 65536);
        let mut out = ExtentSet::new(0, 65536).unwrap();
        extents(&backend, &mut ctx, 65536, 0, OpFlags::empty(), &mut out).unwrap();
        assert_eq!(out.count(), 1);
        assert_eq!(out.get(0).unwrap().offset, 0);
        assert_eq!(out.get(0).unwrap().length, 65536);
    }

    #[test]
    fn capability_cache_is_monotonic() {
        let backend = Backend::plugin(TestPlugin {
            size: 100,
            writable: true,
            zero_level: TriState::Native,
            fast_zero: true,
            fua_level: TriState::Native,
            extents: true,
        });
        let mut ctx = connected(&backend, 100);
        let first = can_write(&backend, &mut ctx).unwrap();
        let second = can_write(&backend, &mut ctx).unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.caps.can_write, Some(true));
    }
}
