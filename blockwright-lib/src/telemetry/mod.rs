//! Structured logging setup (spec §2 item 7, "telemetry/logging sink").

pub mod tracing;
