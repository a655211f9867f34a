//! Operations and observability.
//!
//! - `telemetry` - tracing subscriber setup and runtime log levels
//! - `audit` - security audit trail

pub mod audit;
pub mod telemetry;

pub use audit::*;
pub use telemetry::*;
