//! A read-only, always-allocated-data source of pseudo-random bytes. No
//! write/trim/zero support, an unbounded (here: very large) export
//! size, and generation seeded by a config parameter.
//!
//! Each byte is derived deterministically from `(seed, offset)` via
//! `ahash`, rather than from a PRNG reseeded per call, so tests can
//! assert on read content without tracking call order.

use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;

use crate::backend::types::{BlockSize, Handle, OpFlags};
use crate::backend::{Plugin, ThreadModel};
use crate::error::Errno;
use crate::BlockwrightError;

const DEFAULT_SIZE: u64 = 1u64 << 40;

pub struct RandomPlugin {
    seed: AtomicU64,
    size: AtomicU64,
}

impl RandomPlugin {
    pub fn new() -> Self {
        Self { seed: AtomicU64::new(0), size: AtomicU64::new(DEFAULT_SIZE) }
    }
}

impl Default for RandomPlugin {
    fn default() -> Self {
        Self::new()
    }
}

struct RandomHandle {
    hasher: RandomState,
}

impl Plugin for RandomPlugin {
    fn name(&self) -> &str {
        "random"
    }

    fn thread_model(&self) -> ThreadModel {
        ThreadModel::Parallel
    }

    fn magic_config_key(&self) -> Option<&str> {
        Some("seed")
    }

    fn config(&self, key: &str, value: &str) -> Result<(), BlockwrightError> {
        match key {
            "seed" => {
                let seed: u64 = value.parse().map_err(|_| BlockwrightError::Config(format!("random: invalid seed {value:?}")))?;
                self.seed.store(seed, Ordering::Relaxed);
                Ok(())
            }
            "size" => {
                let size: u64 = value.parse().map_err(|_| BlockwrightError::Config(format!("random: invalid size {value:?}")))?;
                self.size.store(size, Ordering::Relaxed);
                Ok(())
            }
            other => Err(BlockwrightError::Config(format!("random: unrecognized parameter {other:?}"))),
        }
    }

    fn open(&self, readonly: bool, _exportname: &str, _using_tls: bool, _peer: Option<std::net::IpAddr>) -> Result<Handle, Errno> {
        if !readonly {
            // nbdkit's random plugin silently ignores write intent too;
            // can_write still reports false so the dispatcher never
            // routes a write here regardless.
        }
        let seed = self.seed.load(Ordering::Relaxed);
        Ok(Box::new(RandomHandle { hasher: RandomState::with_seeds(seed, seed ^ 0x9E37_79B9_7F4A_7C15, seed.rotate_left(17), seed.rotate_right(23)) }))
    }

    fn get_size(&self, _handle: &mut Handle) -> Result<i64, Errno> {
        Ok(self.size.load(Ordering::Relaxed) as i64)
    }

    fn block_size(&self, _handle: &mut Handle) -> Result<BlockSize, Errno> {
        Ok(BlockSize { minimum: 1, preferred: 4096, maximum: 32 * 1024 * 1024 })
    }

    fn can_write(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(false)
    }
    fn can_extents(&self, _handle: &mut Handle) -> Result<bool, Errno> {
        Ok(false)
    }

    fn pread(&self, handle: &mut Handle, buf: &mut [u8], offset: u64, _flags: OpFlags) -> Result<(), Errno> {
        let h = handle.downcast_ref::<RandomHandle>().expect("random handle type");
        for (i, byte) in buf.iter_mut().enumerate() {
            use std::hash::{BuildHasher, Hasher};
            let mut hasher = h.hasher.build_hasher();
            hasher.write_u64(offset + i as u64);
            *byte = hasher.finish() as u8;
        }
        Ok(())
    }
}
