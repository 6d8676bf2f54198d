//! Helper types shared by the server and the engine.
//!
//! - [`literal_or_env`] - Config values resolved from the environment
//! - [`sig_down`] - Graceful shutdown signal handling
//! - [`telemetry`] - Tracing subscriber and OpenTelemetry setup

pub mod literal_or_env;
pub mod sig_down;
pub mod telemetry;

pub use literal_or_env::*;
pub use sig_down::*;
pub use telemetry::*;
