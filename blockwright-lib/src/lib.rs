#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod export;
pub mod extent;
pub mod filters;
pub mod plugins;
pub mod shutdown;
pub mod telemetry;
pub mod thread_model;
pub mod tls;
pub mod wire;

pub use backend::{Backend, Filter, Plugin};
pub use context::Context;
pub use error::{BlockwrightError, Errno, Result};
pub use export::ExportsSet;
pub use extent::{Extent, ExtentSet, ExtentType};
