//! Process-wide shutdown signal and the interruptible `sleep` helper
//! plugins use for timed waits (spec §5, scenario S6).
//!
//! The original combines a requested timeout with a single
//! signal-masked `poll(2)` over a quit eventfd and the client socket.
//! There is no portable analogue of a blocking multi-fd wait in std
//! without reaching for a raw `libc::poll` dependency the rest of the
//! stack doesn't otherwise need, so this rewrite approximates it with a
//! condvar bounded by a short polling interval: wake latency is bounded
//! by that interval rather than driven by an actual edge-triggered
//! wakeup. See DESIGN.md.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Granularity of the shutdown-aware sleep loop. Bounds the wake-up
/// latency demanded by scenario S6 (<= 100ms).
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A connection's socket handle, force-closable from the shutdown path
/// to unblock a thread parked in a blocking read on it.
pub trait Closable: Send {
    fn close(&self);
}

impl Closable for std::net::TcpStream {
    fn close(&self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(unix)]
impl Closable for std::os::unix::net::UnixStream {
    fn close(&self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

pub struct Shutdown {
    quit: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    sockets: Mutex<HashMap<u64, Box<dyn Closable>>>,
    next_id: AtomicU64,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self {
            quit: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            sockets: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Registers a connection's socket so [`Shutdown::signal`] can
    /// force-close it, returning the token to pass to
    /// [`Shutdown::deregister`] once the connection is done with it.
    pub fn register(&self, socket: Box<dyn Closable>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sockets.lock().unwrap().insert(id, socket);
        id
    }

    pub fn deregister(&self, id: u64) {
        self.sockets.lock().unwrap().remove(&id);
    }

    /// Sets the global quit flag, force-closes every registered socket
    /// (unblocking any thread parked in a blocking read on one), and
    /// wakes every thread parked in [`Shutdown::sleep`].
    pub fn signal(&self) {
        self.quit.store(true, Ordering::SeqCst);
        for (_, socket) in self.sockets.lock().unwrap().drain() {
            socket.close();
        }
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    /// Sleeps for up to `duration`, waking early once the quit flag is
    /// set. A connection-local `hangup` callback is polled on the same
    /// cadence, standing in for the original's POLLHUP/POLLRDHUP check
    /// on the client socket.
    pub fn sleep(&self, duration: Duration, hangup: impl Fn() -> bool) -> Result<(), crate::error::Errno> {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_quitting() || hangup() {
                return Err(crate::error::Errno::Shutdown);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let remaining = deadline - now;
            let wait = remaining.min(POLL_INTERVAL);
            let guard = self.lock.lock().unwrap();
            let (_guard, _timeout_result) = self.cond.wait_timeout(guard, wait).unwrap();
        }
    }
}

/// Deregisters a connection's socket on drop, so the wire front-end
/// doesn't have to remember to do so on every exit path out of
/// `handle_connection`.
pub struct SocketRegistration {
    shutdown: Arc<Shutdown>,
    id: u64,
}

impl SocketRegistration {
    pub fn new(shutdown: Arc<Shutdown>, socket: Box<dyn Closable>) -> Self {
        let id = shutdown.register(socket);
        Self { shutdown, id }
    }
}

impl Drop for SocketRegistration {
    fn drop(&mut self) {
        self.shutdown.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sleep_returns_ok_after_full_duration_with_no_shutdown() {
        let shutdown = Shutdown::new();
        let result = shutdown.sleep(Duration::from_millis(30), || false);
        assert!(result.is_ok());
    }

    #[test]
    fn s6_signal_wakes_a_sleeping_thread_promptly() {
        let shutdown = Shutdown::new();
        let shutdown2 = shutdown.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || shutdown2.sleep(Duration::from_secs(60), || false));

        thread::sleep(Duration::from_millis(10));
        shutdown.signal();
        let result = handle.join().unwrap();

        assert_eq!(result.unwrap_err(), crate::error::Errno::Shutdown);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn hangup_callback_also_wakes_the_sleep() {
        let shutdown = Shutdown::new();
        let result = shutdown.sleep(Duration::from_secs(60), || true);
        assert_eq!(result.unwrap_err(), crate::error::Errno::Shutdown);
    }

    #[test]
    fn signal_force_closes_a_registered_socket_and_unblocks_a_blocking_read() {
        use std::io::Read;
        use std::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_side = thread::spawn(move || listener.accept().unwrap().0);
        let _client = TcpStream::connect(addr).unwrap();
        let mut server_stream = server_side.join().unwrap();

        let shutdown = Shutdown::new();
        let registration = SocketRegistration::new(shutdown.clone(), Box::new(server_stream.try_clone().unwrap()));

        let start = Instant::now();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16];
            server_stream.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(10));
        shutdown.signal();
        let result = reader.join().unwrap();

        // A force-closed read returns either an error or a 0-byte EOF,
        // never hangs; either way `read` must return promptly.
        let _ = result;
        assert!(start.elapsed() < Duration::from_millis(500));
        drop(registration);
    }
}
