use crate::backend::types::{BlockSize, CacheLevel, FuaLevel, Handle, ZeroLevel};

/// Per-connection, per-layer state machine position (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Open,
    Connected,
    Failed,
}

/// Lazily-filled, frozen-once-observed capability answers for one
/// context. Each field starts `None` ("unknown"); the dispatcher fills
/// it on first query and never recomputes it afterwards (invariant 2).
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub can_write: Option<bool>,
    pub can_flush: Option<bool>,
    pub is_rotational: Option<bool>,
    pub can_trim: Option<bool>,
    pub can_extents: Option<bool>,
    pub can_multi_conn: Option<bool>,
    pub can_zero: Option<ZeroLevel>,
    pub can_fast_zero: Option<bool>,
    pub can_fua: Option<FuaLevel>,
    pub can_cache: Option<CacheLevel>,
    pub exportsize: Option<i64>,
    pub block_size: Option<BlockSize>,
}

/// A per-connection, per-backend instance: the opaque handle produced
/// by `open`, a link to the next (inner) context, and this layer's
/// cached capability answers.
pub struct Context {
    pub(crate) handle: Handle,
    pub(crate) next: Option<Box<Context>>,
    pub state: ContextState,
    pub caps: Capabilities,
}

impl Context {
    pub fn new(handle: Handle, next: Option<Box<Context>>) -> Self {
        Self { handle, next, state: ContextState::Open, caps: Capabilities::default() }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut Handle {
        &mut self.handle
    }

    pub fn next(&self) -> Option<&Context> {
        self.next.as_deref()
    }

    pub fn next_mut(&mut self) -> Option<&mut Context> {
        self.next.as_deref_mut()
    }

    pub fn take_next(&mut self) -> Option<Box<Context>> {
        self.next.take()
    }

    pub fn take_handle(self) -> Handle {
        self.handle
    }

    pub fn mark_connected(&mut self) {
        if self.state == ContextState::Open {
            self.state = ContextState::Connected;
        }
    }

    pub fn mark_failed(&mut self) {
        self.state = ContextState::Failed;
    }

    pub fn is_connected(&self) -> bool {
        self.state == ContextState::Connected
    }

    pub fn is_failed(&self) -> bool {
        self.state == ContextState::Failed
    }
}
