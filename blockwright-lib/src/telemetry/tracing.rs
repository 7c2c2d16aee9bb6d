//! `tracing-subscriber` initialization. Two debug domains separate
//! capability/lifecycle logging from data-path logging: capability and
//! lifecycle calls log under the `blockwright::controlpath` target,
//! data-path calls (pread/pwrite/trim/zero/extents/cache) under
//! `blockwright::datapath`.

use tracing_subscriber::EnvFilter;

pub const CONTROLPATH: &str = "blockwright::controlpath";
pub const DATAPATH: &str = "blockwright::datapath";

/// Installs the global subscriber. `verbose` raises the default level
/// one notch when `RUST_LOG` isn't set; `RUST_LOG` always wins.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();
}
