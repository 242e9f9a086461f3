//! Core runtime infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `runtime` - Wiring of delivery, reconciliation and shutdown

pub mod config;
pub mod runtime;

pub use config::*;
pub use runtime::*;
