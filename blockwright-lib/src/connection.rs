//! Per-connection state: the topmost context, negotiated flags, and the
//! per-connection caches kept off any global lock (the exports set, the
//! interned string pool, the default-export cache). The accept-side
//! bookkeeping (`ConnectionManager`/`ConnectionGuard`) is an atomic
//! counter with a drop-to-release guard, notified by a plain condvar
//! since there is no async runtime here to host a `watch` channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ahash::RandomState;
use thiserror::Error;
use tracing::warn;

use crate::context::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Negotiating,
    Running,
    Shutdown,
    Dead,
}

impl ConnectionStatus {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionStatus::Negotiating => 0,
            ConnectionStatus::Running => 1,
            ConnectionStatus::Shutdown => 2,
            ConnectionStatus::Dead => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionStatus::Negotiating,
            1 => ConnectionStatus::Running,
            2 => ConnectionStatus::Shutdown,
            _ => ConnectionStatus::Dead,
        }
    }
}

/// Per-connection state owned by the wire front-end's worker thread.
pub struct Connection {
    pub ctx: Option<Context>,
    pub using_tls: bool,
    pub readonly_requested: bool,
    /// Keyed by backend index, per spec §3/§5.
    default_export_cache: HashMap<u32, String, RandomState>,
    interned: HashMap<String, Arc<str>, RandomState>,
    status: AtomicU8,
    /// Held only while a reply is being serialized onto the socket.
    pub write_lock: Mutex<()>,
}

impl Connection {
    pub fn new(using_tls: bool, readonly_requested: bool) -> Self {
        Self {
            ctx: None,
            using_tls,
            readonly_requested,
            default_export_cache: HashMap::default(),
            interned: HashMap::default(),
            status: AtomicU8::new(ConnectionStatus::Negotiating.to_u8()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Sets the connection status atomically; called from the
    /// dispatcher on disconnect (graceful `SHUTDOWN`, or `DEAD` on a
    /// protocol error or forced close).
    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status.to_u8(), Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status(), ConnectionStatus::Negotiating | ConnectionStatus::Running)
    }

    pub fn cached_default_export(&self, backend_index: u32) -> Option<&str> {
        self.default_export_cache.get(&backend_index).map(String::as_str)
    }

    pub fn cache_default_export(&mut self, backend_index: u32, name: String) {
        self.default_export_cache.insert(backend_index, name);
    }

    /// Returns a shared handle to `s`, allocating one only the first
    /// time this exact string is seen on this connection.
    pub fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(existing) = self.interned.get(s) {
            return existing.clone();
        }
        let arc: Arc<str> = Arc::from(s);
        self.interned.insert(s.to_string(), arc.clone());
        arc
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("server is shutting down")]
    Shutdown,
    #[error("connection limit exceeded (current: {current}, limit: {limit})")]
    LimitExceeded { current: usize, limit: usize },
}

struct CloseNotify {
    lock: Mutex<()>,
    cond: Condvar,
}

/// Accounts for the server-wide connection count and notifies waiters
/// once the last connection drops, for graceful drain on shutdown.
pub struct ConnectionManager {
    active: Arc<AtomicUsize>,
    max_connections: usize,
    shutdown: Arc<crate::shutdown::Shutdown>,
    notify: Arc<CloseNotify>,
}

impl ConnectionManager {
    pub fn new(max_connections: usize, shutdown: Arc<crate::shutdown::Shutdown>) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_connections,
            shutdown,
            notify: Arc::new(CloseNotify { lock: Mutex::new(()), cond: Condvar::new() }),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn try_accept(&self, peer: SocketAddr) -> Result<ConnectionGuard, ConnectionError> {
        if self.shutdown.is_quitting() {
            return Err(ConnectionError::Shutdown);
        }

        let current = self.active.load(Ordering::Relaxed);
        if self.max_connections != 0 && current >= self.max_connections {
            warn!(current, limit = self.max_connections, %peer, "connection limit exceeded, rejecting");
            return Err(ConnectionError::LimitExceeded { current, limit: self.max_connections });
        }

        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(ConnectionGuard { counter: self.active.clone(), notify: self.notify.clone() })
    }

    /// Blocks until the active-connection count reaches zero or
    /// `timeout` elapses, for a bounded graceful-drain wait.
    pub fn wait_for_drain(&self, timeout: std::time::Duration) {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.notify.lock.lock().unwrap();
        while self.active.load(Ordering::Relaxed) > 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return;
            }
            let (g, _timeout) = self.notify.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }
}

/// Decrements the active-connection counter on drop and wakes any
/// thread parked in [`ConnectionManager::wait_for_drain`] when the last
/// connection closes.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
    notify: Arc<CloseNotify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.counter.fetch_sub(1, Ordering::Relaxed);
        if remaining == 1 {
            let _guard = self.notify.lock.lock().unwrap();
            self.notify.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        let conn = Connection::new(false, false);
        assert_eq!(conn.status(), ConnectionStatus::Negotiating);
        conn.set_status(ConnectionStatus::Running);
        assert_eq!(conn.status(), ConnectionStatus::Running);
        assert!(conn.is_live());
        conn.set_status(ConnectionStatus::Dead);
        assert!(!conn.is_live());
    }

    #[test]
    fn default_export_cache_is_keyed_by_backend_index() {
        let mut conn = Connection::new(false, false);
        assert_eq!(conn.cached_default_export(0), None);
        conn.cache_default_export(0, "primary".to_string());
        assert_eq!(conn.cached_default_export(0), Some("primary"));
        assert_eq!(conn.cached_default_export(1), None);
    }

    #[test]
    fn intern_returns_the_same_allocation_for_repeats() {
        let mut conn = Connection::new(false, false);
        let a = conn.intern("primary");
        let b = conn.intern("primary");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn manager_rejects_over_the_limit() {
        let shutdown = crate::shutdown::Shutdown::new();
        let mgr = ConnectionManager::new(1, shutdown);
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let _g = mgr.try_accept(peer).unwrap();
        assert!(matches!(mgr.try_accept(peer), Err(ConnectionError::LimitExceeded { .. })));
    }

    #[test]
    fn manager_rejects_during_shutdown() {
        let shutdown = crate::shutdown::Shutdown::new();
        let mgr = ConnectionManager::new(0, shutdown.clone());
        shutdown.signal();
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert!(matches!(mgr.try_accept(peer), Err(ConnectionError::Shutdown)));
    }

    #[test]
    fn guard_drop_decrements_and_wakes_drain() {
        let shutdown = crate::shutdown::Shutdown::new();
        let mgr = ConnectionManager::new(0, shutdown);
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let guard = mgr.try_accept(peer).unwrap();
        assert_eq!(mgr.active_connections(), 1);
        drop(guard);
        assert_eq!(mgr.active_connections(), 0);
        mgr.wait_for_drain(std::time::Duration::from_millis(50));
    }
}
