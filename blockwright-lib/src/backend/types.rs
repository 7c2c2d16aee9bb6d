use bitflags::bitflags;

bitflags! {
    /// Flags accompanying a data operation. Which subset is legal for a
    /// given operation is enforced by the dispatcher, not by this type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpFlags: u32 {
        /// Force Unit Access: the op must not return success until the
        /// affected data is durable.
        const FUA = 0b0001;
        /// The backend is permitted to trim rather than write zeroes.
        const MAY_TRIM = 0b0010;
        /// Fail rather than fall back to an emulated implementation.
        const FAST_ZERO = 0b0100;
        /// Request at most one extent in the reply.
        const REQ_ONE = 0b1000;
    }
}

/// Tri-state capability level: a backend may lack a capability
/// entirely, support it only via emulation, or support it natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TriState {
    #[default]
    None,
    Emulate,
    Native,
}

pub type ZeroLevel = TriState;
pub type FuaLevel = TriState;
pub type CacheLevel = TriState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize {
    pub minimum: u32,
    pub preferred: u32,
    pub maximum: u32,
}

impl Default for BlockSize {
    fn default() -> Self {
        Self { minimum: 1, preferred: 4096, maximum: 32 * 1024 * 1024 }
    }
}

/// Opaque per-layer handle produced by `open`, analogous to nbdkit's
/// `void *handle`.
pub type Handle = Box<dyn std::any::Any + Send>;
