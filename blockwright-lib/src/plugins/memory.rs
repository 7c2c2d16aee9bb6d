//! An in-memory disk plugin. Each connection gets its own private,
//! zero-initialized buffer of `size` bytes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::backend::types::{BlockSize, CacheLevel, FuaLevel, Handle, OpFlags, TriState, ZeroLevel};
use crate::backend::{Plugin, ThreadModel};
use crate::error::Errno;
use crate::BlockwrightError;

struct MemoryHandle {
    data: Mutex<Vec<u8>>,
}

pub struct MemoryPlugin {
    size: AtomicU64,
}

impl MemoryPlugin {
    pub fn new() -> Self {
        Self { size: AtomicU64::new(64 * 1024 * 1024) }
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }
}

impl Default for MemoryPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for MemoryPlugin {
    fn name(&self) -> &str {
        "memory"
    }

    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }

    fn magic_config_key(&self) -> Option<&str> {
        Some("size")
    }

    fn config(&self, key: &str, value: &str) -> Result<(), BlockwrightError> {
        match key {
            "size" => {
                let bytes = parse_size(value).ok_or_else(|| BlockwrightError::Config(format!("memory: invalid size {value:?}")))?;
                self.size.store(bytes, Ordering::Relaxed);
                Ok(())
            }
            other => Err(BlockwrightError::Config(format!("memory: unrecognized parameter {other:?}"))),
        }
    }

    fn open(&self, _readonly: bool, _exportname: &str, _using_tls: bool, _peer: Option<std::net::IpAddr>) -> Result<Handle, Errno> {
        let size = self.size();
        Ok(Box::new(MemoryHandle { data: Mutex::new(vec![0u8; size as usize]) }))
    }

    fn get_size(&self, _handle: &mut Handle) -> Result<i64, Errno> {
        Ok(self.size() as i64)
    }

    fn block_size(&self, _handle: &mut Handle) -> Result<BlockSize, Errno> {
        Ok(BlockSize { minimum: 1, preferred: 4096, maximum: 32 * 1024 * 1024 })
    }

    fn can_write(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(true)
    }
    fn can_flush(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(true)
    }
    fn can_trim(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(true)
    }
    fn can_zero(&self, _handle: &mut Handle) -> Result<ZeroLevel, Errno> {
        Ok(TriState::Emulate)
    }
    fn can_fua(&self, _handle: &mut Handle) -> Result<FuaLevel, Errno> {
        Ok(TriState::Native)
    }
    fn can_cache(&self, _handle: &mut Handle) -> Result<CacheLevel, Errno> {
        Ok(TriState::Native)
    }
    fn can_multi_conn(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        // Each connection owns a private buffer; sharing writes across
        // connections would silently diverge, so this is not safe to
        // advertise as multi-conn.
        Ok(false)
    }
    fn can_extents(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(false)
    }

    fn pread(&self, handle: &mut Handle, buf: &mut [u8], offset: u64, _flags: OpFlags) -> Result<(), Errno> {
        let h = handle.downcast_ref::<MemoryHandle>().expect("memory handle type");
        let data = h.data.lock().unwrap();
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn pwrite(&self, handle: &mut Handle, buf: &[u8], offset: u64, _flags: OpFlags) -> Result<(), Errno> {
        let h = handle.downcast_ref::<MemoryHandle>().expect("memory handle type");
        let mut data = h.data.lock().unwrap();
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self, _handle: &mut Handle, _flags: OpFlags) -> Result<(), Errno> {
        Ok(())
    }

    fn trim(&self, handle: &mut Handle, count: u64, offset: u64, _flags: OpFlags) -> Result<(), Errno> {
        let h = handle.downcast_ref::<MemoryHandle>().expect("memory handle type");
        let mut data = h.data.lock().unwrap();
        let start = offset as usize;
        data[start..start + count as usize].fill(0);
        Ok(())
    }

    fn cache(&self, _handle: &mut Handle, _count: u64, _offset: u64, _flags: OpFlags) -> Result<(), Errno> {
        Ok(())
    }
}

fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, mult): (&str, u64) = if let Some(p) = s.strip_suffix(['K', 'k']) {
        (p, 1024)
    } else if let Some(p) = s.strip_suffix(['M', 'm']) {
        (p, 1024 * 1024)
    } else if let Some(p) = s.strip_suffix(['G', 'g']) {
        (p, 1024 * 1024 * 1024)
    } else {
        (s, 1)
    };
    digits.trim().parse::<u64>().ok().map(|n| n * mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("4K"), Some(4096));
        assert_eq!(parse_size("1M"), Some(1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("bogus"), None);
    }

    #[test]
    fn write_then_read_round_trips() {
        let plugin = MemoryPlugin::new();
        plugin.config("size", "8192").unwrap();
        let mut handle = plugin.open(false, "", false, None).unwrap();
        plugin.pwrite(&mut handle, &[0xABu8; 512], 0, OpFlags::empty()).unwrap();
        let mut buf = [0u8; 512];
        plugin.pread(&mut handle, &mut buf, 0, OpFlags::empty()).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn trim_zeroes_the_range() {
        let plugin = MemoryPlugin::new();
        plugin.config("size", "4096").unwrap();
        let mut handle = plugin.open(false, "", false, None).unwrap();
        plugin.pwrite(&mut handle, &[0xFFu8; 4096], 0, OpFlags::empty()).unwrap();
        plugin.trim(&mut handle, 4096, 0, OpFlags::empty()).unwrap();
        let mut buf = [0u8; 4096];
        plugin.pread(&mut handle, &mut buf, 0, OpFlags::empty()).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
