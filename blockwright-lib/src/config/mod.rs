//! Command-line parsing, pipeline construction against the backend
//! registry, and eager validation (spec §6 "CLI surface").

pub mod cli;
pub mod pipeline;
pub mod validator;

use std::path::PathBuf;

use clap::Parser;

use crate::backend::Backend;
use crate::BlockwrightError;

/// Where and how to listen, independent of the backend pipeline itself.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub readonly: bool,
    pub stdio: bool,
    pub verbose: bool,
    pub port: Option<u16>,
    pub unix_socket: Option<PathBuf>,
    pub tls: Option<TlsOptions>,
}

#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

fn runtime_options(cli: &cli::Cli) -> Result<RuntimeOptions, BlockwrightError> {
    let tls = if cli.tls {
        let cert_path = cli.tls_cert.clone().ok_or_else(|| BlockwrightError::Config("--tls requires --tls-cert".to_string()))?;
        let key_path = cli.tls_key.clone().ok_or_else(|| BlockwrightError::Config("--tls requires --tls-key".to_string()))?;
        if !cert_path.exists() {
            return Err(BlockwrightError::Config(format!("certificate file not found: {}", cert_path.display())));
        }
        if !key_path.exists() {
            return Err(BlockwrightError::Config(format!("key file not found: {}", key_path.display())));
        }
        Some(TlsOptions { cert_path, key_path })
    } else {
        None
    };

    if cli.detach {
        tracing::warn!("--detach was passed but this build only runs in the foreground");
    }

    Ok(RuntimeOptions { readonly: cli.readonly, stdio: cli.stdio, verbose: cli.verbose, port: cli.port, unix_socket: cli.unix_socket.clone(), tls })
}

/// Parses `args` (normally `std::env::args()`), validates it, and
/// resolves it into a constructed `Backend` pipeline plus the runtime
/// listening options.
pub fn load(args: impl IntoIterator<Item = String>) -> Result<(Backend, RuntimeOptions), BlockwrightError> {
    let cli = cli::Cli::try_parse_from(args).map_err(|e| BlockwrightError::Config(e.to_string()))?;
    let raw = cli::parse_pipeline(&cli.pipeline)?;
    validator::validate(&raw)?;
    let backend = pipeline::build_pipeline(&raw)?;
    let options = runtime_options(&cli)?;
    Ok((backend, options))
}
