//! Warren controller process.
//!
//! Wires the controllers from `warren-core` to an object store and serves the
//! resources over HTTP. The binary in `main.rs` is a thin wrapper around the
//! pieces exported here.

pub mod config;
pub mod http;
pub mod telemetry;

pub use config::{ConfigError, WarrenConfig};
pub use http::{build_router, serve, AppState};
pub use telemetry::TelemetryGuard;
