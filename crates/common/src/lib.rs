//! Common utilities for gn3s-rs
//!
//! This crate provides functionality shared by the driver and the capture
//! binary: the configuration/logging error type, tracing setup and the
//! streaming metrics counters.

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use metrics::{MetricsSnapshot, StreamMetrics, format_bytes_per_sec};
