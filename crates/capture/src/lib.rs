//! Capture tool for the GN3S front end
//!
//! Configuration loading and the sample writer used by `gn3s-capture`.

pub mod config;
pub mod output;

pub use config::CaptureConfig;
pub use output::{SampleWriter, open_output};
