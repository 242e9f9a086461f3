//! Operations and observability.
//!
//! - `observability` - Delivery counters
//! - `telemetry` - Logging setup and the status endpoint

pub mod observability;
pub mod telemetry;

pub use observability::*;
pub use telemetry::*;
