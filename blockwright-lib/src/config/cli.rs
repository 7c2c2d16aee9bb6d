//! Command-line surface. The pipeline itself is composed by argument
//! (plugin name, repeated `--filter`, trailing `key=value` parameters)
//! rather than by config file, so the derive struct only owns the
//! fixed flags and hands the rest to [`parse_pipeline`] as a raw token
//! stream.

use std::path::PathBuf;

use clap::Parser;

use crate::BlockwrightError;

#[derive(Parser, Debug)]
#[command(author, version, about = "User-space block-device server")]
pub struct Cli {
    /// Export the device read-only regardless of what the plugin supports.
    #[arg(short = 'r', long)]
    pub readonly: bool,

    /// Speak the wire protocol over stdin/stdout instead of a socket.
    #[arg(short = 's', long)]
    pub stdio: bool,

    /// Increase log verbosity (controlpath/datapath debug events).
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// TCP port to listen on.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Unix domain socket path to listen on, instead of TCP.
    #[arg(short = 'U', long = "unix")]
    pub unix_socket: Option<PathBuf>,

    /// Require TLS for incoming connections.
    #[arg(long)]
    pub tls: bool,

    /// PEM certificate chain, required when `--tls` is set.
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key, required when `--tls` is set.
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Stay attached to the controlling terminal instead of detaching.
    /// Detaching is not implemented in this rewrite; passing `--detach`
    /// is accepted for CLI-compatibility but only logs a warning.
    #[arg(long)]
    pub detach: bool,

    /// `plugin-name [key=value ...] [--filter name [key=value ...]]...`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub pipeline: Vec<String>,
}

/// One backend's name plus its ordered `key=value` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendArgs {
    pub name: String,
    pub params: Vec<(String, String)>,
}

/// The plugin plus an ordered list of filters (innermost first: the
/// first `--filter` given wraps directly around the plugin, and each
/// subsequent one wraps around the previous).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPipeline {
    pub plugin: BackendArgs,
    pub filters: Vec<BackendArgs>,
}

fn split_param(token: &str) -> Result<(String, String), BlockwrightError> {
    match token.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(BlockwrightError::Config(format!("expected key=value, got {token:?}"))),
    }
}

/// Parses the trailing token stream into a plugin selector followed by
/// zero or more `--filter NAME` groups, each owning its own `key=value`
/// parameters up to the next `--filter` or the end of input.
pub fn parse_pipeline(tokens: &[String]) -> Result<RawPipeline, BlockwrightError> {
    let mut iter = tokens.iter();
    let plugin_name = iter.next().ok_or_else(|| BlockwrightError::Config("missing plugin name".to_string()))?.clone();

    let mut plugin_params = Vec::new();
    let mut filters: Vec<BackendArgs> = Vec::new();

    while let Some(token) = iter.next() {
        if token == "--filter" {
            let name = iter.next().ok_or_else(|| BlockwrightError::Config("--filter requires a name".to_string()))?.clone();
            filters.push(BackendArgs { name, params: Vec::new() });
            continue;
        }
        let pair = split_param(token)?;
        match filters.last_mut() {
            Some(current) => current.params.push(pair),
            None => plugin_params.push(pair),
        }
    }

    Ok(RawPipeline { plugin: BackendArgs { name: plugin_name, params: plugin_params }, filters })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_only_with_params() {
        let tokens: Vec<String> = ["memory", "size=65536"].into_iter().map(String::from).collect();
        let parsed = parse_pipeline(&tokens).unwrap();
        assert_eq!(parsed.plugin.name, "memory");
        assert_eq!(parsed.plugin.params, vec![("size".to_string(), "65536".to_string())]);
        assert!(parsed.filters.is_empty());
    }

    #[test]
    fn plugin_with_chained_filters() {
        let tokens: Vec<String> =
            ["memory", "size=65536", "--filter", "offset", "offset=4096", "--filter", "limit", "limit=2"].into_iter().map(String::from).collect();
        let parsed = parse_pipeline(&tokens).unwrap();
        assert_eq!(parsed.filters.len(), 2);
        assert_eq!(parsed.filters[0].name, "offset");
        assert_eq!(parsed.filters[0].params, vec![("offset".to_string(), "4096".to_string())]);
        assert_eq!(parsed.filters[1].name, "limit");
    }

    #[test]
    fn missing_plugin_name_is_an_error() {
        assert!(parse_pipeline(&[]).is_err());
    }

    #[test]
    fn malformed_param_is_an_error() {
        let tokens: Vec<String> = ["memory", "not-a-pair"].into_iter().map(String::from).collect();
        assert!(parse_pipeline(&tokens).is_err());
    }
}
