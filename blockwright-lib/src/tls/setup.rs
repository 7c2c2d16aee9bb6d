//! Certificate/key loading and `rustls::ServerConfig` construction,
//! using `rustls-pemfile` for PEM parsing (see DESIGN.md).

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use crate::config::TlsOptions;
use crate::BlockwrightError;

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, BlockwrightError> {
    let file = File::open(path).map_err(|e| BlockwrightError::Tls(format!("failed to open certificate {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BlockwrightError::Tls(format!("failed to parse certificate {}: {e}", path.display())))
}

fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, BlockwrightError> {
    let file = File::open(path).map_err(|e| BlockwrightError::Tls(format!("failed to open key {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| BlockwrightError::Tls(format!("failed to parse key {}: {e}", path.display())))?
        .ok_or_else(|| BlockwrightError::Tls(format!("no private key found in {}", path.display())))
}

/// Builds the shared server TLS configuration once at startup; cloning
/// the returned `Arc` is cheap per accepted connection.
pub fn build_server_config(options: &TlsOptions) -> Result<Arc<ServerConfig>, BlockwrightError> {
    let certs = load_certs(&options.cert_path)?;
    let key = load_key(&options.key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| BlockwrightError::Tls(format!("failed to build TLS config: {e}")))?;

    Ok(Arc::new(config))
}
