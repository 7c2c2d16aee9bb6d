//! Blocking, thread-per-connection accept loop exercising the
//! dispatcher: a `TcpListener::incoming()` loop that spawns one OS
//! thread per accepted connection, dispatching the full op set exposed
//! by [`super::proto`].

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread;

use byteorder::{ReadBytesExt, BE};

use crate::backend::types::TriState;
use crate::backend::Backend;
use crate::config::RuntimeOptions;
use crate::connection::{Connection, ConnectionManager};
use crate::context::Context;
use crate::error::Errno;
use crate::extent::ExtentSet;
use crate::shutdown::{Shutdown, SocketRegistration};
use crate::telemetry::tracing::{CONTROLPATH, DATAPATH};
use crate::thread_model::ThreadModel;
use crate::wire::proto::{self, Hello, Opcode, ReplyHeader, RequestHeader};
use crate::BlockwrightError;

const MAX_EXPORT_NAME_LEN: u32 = 4096;
const MAX_EXTENT_COUNT: u64 = 64 * 1024 * 1024;

/// Joins stdin/stdout into a single `Read + Write` stream so `-s`/
/// `--stdio` can reuse [`handle_connection`] unchanged.
struct StdioStream {
    stdin: io::Stdin,
    stdout: io::Stdout,
}

impl Read for StdioStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdin.read(buf)
    }
}

impl Write for StdioStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdout.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdout.flush()
    }
}

fn read_export_name<R: Read>(r: &mut R) -> io::Result<String> {
    let len = r.read_u32::<BE>()?;
    if len > MAX_EXPORT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "export name too long"));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn errno_to_io(e: Errno) -> io::Error {
    io::Error::other(e)
}

fn handle_op<S: Read + Write>(backend: &Backend, ctx: &mut Context, stream: &mut S, header: RequestHeader, global_lock: Option<&Mutex<()>>) -> io::Result<bool> {
    tracing::debug!(target: DATAPATH, opcode = ?header.opcode, offset = header.offset, length = header.length, "dispatching op");

    // `ThreadModel::SerializeAllRequests` pipelines declare that no two
    // requests may be in flight process-wide; everything below runs
    // under this guard when that model is in effect.
    let _global_guard = global_lock.map(|lock| lock.lock().unwrap_or_else(|e| e.into_inner()));

    let result: Result<(ReplyHeader, Vec<u8>), Errno> = (|| match header.opcode {
        Opcode::Disconnect => Ok((ReplyHeader { handle: header.handle, errno: None, payload_len: 0 }, Vec::new())),
        Opcode::Read => {
            let mut buf = vec![0u8; header.length as usize];
            crate::dispatcher::pread(backend, ctx, &mut buf, header.offset, header.flags)?;
            let payload_len = buf.len() as u32;
            Ok((ReplyHeader { handle: header.handle, errno: None, payload_len }, buf))
        }
        Opcode::Write => {
            let mut buf = vec![0u8; header.length as usize];
            stream.read_exact(&mut buf)?;
            crate::dispatcher::pwrite(backend, ctx, &buf, header.offset, header.flags)?;
            Ok((ReplyHeader { handle: header.handle, errno: None, payload_len: 0 }, Vec::new()))
        }
        Opcode::Flush => {
            crate::dispatcher::flush(backend, ctx, header.flags)?;
            Ok((ReplyHeader { handle: header.handle, errno: None, payload_len: 0 }, Vec::new()))
        }
        Opcode::Trim => {
            crate::dispatcher::trim(backend, ctx, header.length as u64, header.offset, header.flags)?;
            Ok((ReplyHeader { handle: header.handle, errno: None, payload_len: 0 }, Vec::new()))
        }
        Opcode::Zero => {
            crate::dispatcher::zero(backend, ctx, header.length as u64, header.offset, header.flags)?;
            Ok((ReplyHeader { handle: header.handle, errno: None, payload_len: 0 }, Vec::new()))
        }
        Opcode::Cache => {
            crate::dispatcher::cache(backend, ctx, header.length as u64, header.offset, header.flags)?;
            Ok((ReplyHeader { handle: header.handle, errno: None, payload_len: 0 }, Vec::new()))
        }
        Opcode::Extents => {
            let count = (header.length as u64).min(MAX_EXTENT_COUNT);
            let end = header.offset.saturating_add(count);
            let mut set = ExtentSet::new(header.offset, end).map_err(|_| Errno::Inval)?;
            crate::dispatcher::extents(backend, ctx, count, header.offset, header.flags, &mut set)?;
            let records: Vec<_> = set.iter().copied().collect();
            let mut payload = Vec::new();
            proto::encode_extents(&mut payload, &records).map_err(|_| Errno::Io)?;
            let payload_len = payload.len() as u32;
            Ok((ReplyHeader { handle: header.handle, errno: None, payload_len }, payload))
        }
    })();

    match result {
        Ok((reply, payload)) => {
            reply.write_to(&mut *stream)?;
            stream.write_all(&payload)?;
            stream.flush()?;
            Ok(header.opcode == Opcode::Disconnect)
        }
        Err(errno) => {
            tracing::warn!(target: DATAPATH, ?errno, opcode = ?header.opcode, "op failed");
            let reply = ReplyHeader { handle: header.handle, errno: Some(errno), payload_len: 0 };
            reply.write_to(&mut *stream)?;
            stream.flush()?;
            Ok(false)
        }
    }
}

/// Runs one connection to completion: open, negotiate, serve requests
/// until `Disconnect` or a framing error, then finalize and close.
pub fn handle_connection<S: Read + Write>(backend: &Backend, mut stream: S, peer: Option<IpAddr>, readonly_requested: bool, using_tls: bool, global_lock: Option<&Mutex<()>>) -> io::Result<()> {
    let requested_export = read_export_name(&mut stream)?;
    let exportname = if requested_export.is_empty() { backend.default_export(readonly_requested, using_tls).unwrap_or_default() } else { requested_export };

    let mut connection = Connection::new(using_tls, readonly_requested);
    let mut ctx = crate::dispatcher::open(backend, readonly_requested, &exportname, using_tls, peer).map_err(errno_to_io)?;
    tracing::info!(target: CONTROLPATH, %exportname, using_tls, "connection opened");

    crate::dispatcher::prepare(backend, &mut ctx, readonly_requested).map_err(errno_to_io)?;
    connection.ctx = Some(ctx);
    let ctx = connection.ctx.as_mut().expect("just assigned");

    let size = crate::dispatcher::exportsize(backend, ctx).map_err(errno_to_io)?;
    let readonly = readonly_requested || !crate::dispatcher::can_write(backend, ctx).unwrap_or(false);
    let can_trim = crate::dispatcher::can_trim(backend, ctx).unwrap_or(false);
    let can_zero = crate::dispatcher::can_zero(backend, ctx).unwrap_or(TriState::None) != TriState::None;
    let can_fua = crate::dispatcher::can_fua(backend, ctx).unwrap_or(TriState::None) != TriState::None;
    let can_extents = crate::dispatcher::can_extents(backend, ctx).unwrap_or(false);

    Hello { size: size.max(0) as u64, readonly, can_trim, can_zero, can_fua, can_extents }.write_to(&mut stream)?;

    let result = loop {
        let header = match RequestHeader::read_from(&mut stream) {
            Ok(h) => h,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e),
        };
        match handle_op(backend, ctx, &mut stream, header, global_lock) {
            Ok(true) => break Ok(()),
            Ok(false) => continue,
            Err(e) => break Err(e),
        }
    };

    if crate::dispatcher::finalize(backend, ctx).is_err() {
        tracing::warn!(target: CONTROLPATH, "finalize failed, closing anyway");
    }
    let ctx = connection.ctx.take().expect("ctx was assigned above");
    crate::dispatcher::close(backend, ctx);
    tracing::info!(target: CONTROLPATH, "connection closed");

    result
}

fn serve_tcp(backend: Arc<Backend>, listener: TcpListener, manager: Arc<ConnectionManager>, shutdown: Arc<Shutdown>, readonly: bool, tls_config: Option<Arc<rustls::ServerConfig>>, global_lock: Option<Arc<Mutex<()>>>) {
    for stream in listener.incoming() {
        if shutdown.is_quitting() {
            break;
        }
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: CONTROLPATH, %e, "accept failed");
                continue;
            }
        };
        let peer = stream.peer_addr().ok().map(|a: SocketAddr| a.ip());
        let _ = stream.set_nodelay(true);

        let guard = match manager.try_accept(stream.peer_addr().unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(target: CONTROLPATH, %e, "rejecting connection");
                continue;
            }
        };

        // Registered so a blocking read on this connection's thread gets
        // force-closed by `Shutdown::signal()` instead of outliving it.
        let registration = match stream.try_clone() {
            Ok(c) => Some(SocketRegistration::new(shutdown.clone(), Box::new(c))),
            Err(e) => {
                tracing::warn!(target: CONTROLPATH, %e, "failed to clone accepted stream for shutdown registration");
                None
            }
        };

        let backend = backend.clone();
        let tls_config = tls_config.clone();
        let global_lock = global_lock.clone();
        thread::spawn(move || {
            let _guard = guard;
            let _registration = registration;
            let lock = global_lock.as_deref();
            let result = match tls_config {
                Some(config) => match crate::tls::accept(config, stream) {
                    Ok(tls_stream) => handle_connection(&backend, tls_stream, peer, readonly, true, lock),
                    Err(e) => Err(io::Error::other(e)),
                },
                None => handle_connection(&backend, stream, peer, readonly, false, lock),
            };
            if let Err(e) = result {
                tracing::warn!(target: CONTROLPATH, %e, "connection ended with an error");
            }
        });
    }
}

#[cfg(unix)]
fn serve_unix(backend: Arc<Backend>, path: &std::path::Path, manager: Arc<ConnectionManager>, shutdown: Arc<Shutdown>, readonly: bool, global_lock: Option<Arc<Mutex<()>>>) -> io::Result<()> {
    use std::os::unix::net::UnixListener;

    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    tracing::info!(target: CONTROLPATH, path = %path.display(), "listening on unix socket");

    for stream in listener.incoming() {
        if shutdown.is_quitting() {
            break;
        }
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: CONTROLPATH, %e, "accept failed");
                continue;
            }
        };

        let guard = match manager.try_accept(SocketAddr::from(([0, 0, 0, 0], 0))) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(target: CONTROLPATH, %e, "rejecting connection");
                continue;
            }
        };

        let registration = match stream.try_clone() {
            Ok(c) => Some(SocketRegistration::new(shutdown.clone(), Box::new(c))),
            Err(e) => {
                tracing::warn!(target: CONTROLPATH, %e, "failed to clone accepted stream for shutdown registration");
                None
            }
        };

        let backend = backend.clone();
        let global_lock = global_lock.clone();
        thread::spawn(move || {
            let _guard = guard;
            let _registration = registration;
            if let Err(e) = handle_connection(&backend, stream, None, readonly, false, global_lock.as_deref()) {
                tracing::warn!(target: CONTROLPATH, %e, "connection ended with an error");
            }
        });
    }
    Ok(())
}

/// Binds the listener described by `options` (TCP, optionally
/// TLS-wrapped, or a Unix domain socket) and serves connections until
/// `shutdown` is signalled.
pub fn serve(backend: Arc<Backend>, options: &RuntimeOptions, shutdown: Arc<Shutdown>) -> Result<(), BlockwrightError> {
    let model = backend.thread_model();
    // `forces_single_conn()` only feeds the advisory `can_multi_conn`
    // capability answer (see `dispatcher::can_multi_conn`); it must not
    // also cap real connection admission here, or a filter that sets
    // `keeps_per_connection_state()` for accurate capability reporting
    // would silently limit the whole server to one connection.
    let max_connections = if model == ThreadModel::SerializeConnections { 1 } else { 0 };
    let global_lock = (model == ThreadModel::SerializeAllRequests).then(|| Arc::new(Mutex::new(())));
    tracing::debug!(target: CONTROLPATH, ?model, max_connections, "reconciled thread model");

    if options.stdio {
        if options.unix_socket.is_some() || options.tls.is_some() {
            return Err(BlockwrightError::Config("-s/--stdio cannot be combined with --unix or --tls".to_string()));
        }
        tracing::info!(target: CONTROLPATH, "serving a single connection over stdio");
        let stream = StdioStream { stdin: io::stdin(), stdout: io::stdout() };
        return handle_connection(&backend, stream, None, options.readonly, false, global_lock.as_deref()).map_err(BlockwrightError::from);
    }

    let manager = Arc::new(ConnectionManager::new(max_connections, shutdown.clone()));

    if let Some(socket_path) = &options.unix_socket {
        #[cfg(unix)]
        {
            serve_unix(backend, socket_path, manager, shutdown, options.readonly, global_lock)?;
            return Ok(());
        }
        #[cfg(not(unix))]
        {
            let _ = socket_path;
            return Err(BlockwrightError::Config("unix sockets are only supported on unix platforms".to_string()));
        }
    }

    let tls_config = match &options.tls {
        Some(tls_options) => Some(crate::tls::build_server_config(tls_options)?),
        None => None,
    };

    let port = options.port.unwrap_or(10809);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).map_err(BlockwrightError::from)?;
    tracing::info!(target: CONTROLPATH, %addr, tls = tls_config.is_some(), "listening");

    serve_tcp(backend, listener, manager, shutdown, options.readonly, tls_config, global_lock);
    Ok(())
}
