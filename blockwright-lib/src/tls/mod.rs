//! Blocking TLS listener: cipher-suite/version selection and
//! certificate loading built on a blocking `rustls::StreamOwned` over a
//! synchronous `TcpStream`, matching this crate's thread-per-connection
//! wire front-end.

pub mod listener;
pub mod setup;

pub use listener::accept;
pub use setup::build_server_config;
