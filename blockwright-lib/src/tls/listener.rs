//! Wraps an accepted `TcpStream` in a blocking TLS session using
//! `rustls::StreamOwned`, whose `Read`/`Write` impls drive the
//! handshake to completion on first use, so no separate accept step is
//! needed.

use std::net::TcpStream;
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection, StreamOwned};

use crate::BlockwrightError;

pub type TlsStream = StreamOwned<ServerConnection, TcpStream>;

/// Starts a TLS session over an already-accepted TCP stream. The
/// handshake itself happens lazily, on the stream's first read/write.
pub fn accept(config: Arc<ServerConfig>, stream: TcpStream) -> Result<TlsStream, BlockwrightError> {
    let conn = ServerConnection::new(config).map_err(|e| BlockwrightError::Tls(format!("failed to start TLS session: {e}")))?;
    Ok(StreamOwned::new(conn, stream))
}
