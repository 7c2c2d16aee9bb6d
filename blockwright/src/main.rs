#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::sync::Arc;

use blockwright_lib::shutdown::Shutdown;
use blockwright_lib::telemetry::tracing::init_tracing;
use blockwright_lib::wire::server;
use blockwright_lib::{config, BlockwrightError};
use tracing::{error, info};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let (backend, options) = match config::load(args) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("blockwright: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(options.verbose);
    info!(readonly = options.readonly, "pipeline constructed");

    let shutdown = Shutdown::new();
    let backend = Arc::new(backend);

    match server::serve(backend, &options, shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ BlockwrightError::Io(_)) => {
            error!(%err, "server exited with an I/O error");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(%err, "server failed to start");
            ExitCode::FAILURE
        }
    }
}
