#![deny(clippy::all, clippy::pedantic)]
// Module naming: delivery::DeliveryMetrics and friends read better qualified
#![allow(clippy::module_name_repetitions)]
// Documentation style
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::format_push_string)]
// Import style
#![allow(clippy::wildcard_imports)]
// Numeric casts: counters and durations
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_lossless)]
// Control flow style
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
// Option/Result patterns
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]
// Lock guards are scoped by hand in the queue
#![allow(clippy::significant_drop_tightening)]
// Async functions that may not await yet
#![allow(clippy::unused_async)]

//! meterlink - telemetry delivery core for a metering kiosk.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::runtime` - Wiring and shutdown
//!
//! ## Delivery
//! - `delivery::event` - Outbound event model and wire format
//! - `delivery::certs` - Certificate resolution per device
//! - `delivery::tls` - rustls client configuration
//! - `delivery::queue` - Outbound queue with optional spool file
//! - `delivery::backoff` - Reconnect delay policy
//! - `delivery::acks` - Per-call publish confirmation waiters
//! - `delivery::connection` - Broker connection worker
//! - `delivery::publisher` - Fire-and-forget and publish-and-confirm APIs
//!
//! ## Household
//! - `household::model` - Members, guests and the snapshot
//! - `household::store` - JSON persistence
//! - `household::boot` - Power-cycle detection
//! - `household::reconcile` - Boot-time reset and re-announcement
//! - `household::service` - Operations for the request layer
//!
//! ## Operations
//! - `ops::observability` - Delivery counters
//! - `ops::telemetry` - Logging and the status endpoint

// Core infrastructure
pub mod core;

// Delivery
pub mod delivery;

// Household state
pub mod household;

// Operations
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, runtime};
pub use ops::{observability, telemetry};
