//! Driver error types

use protocol::{ProtocolError, UsbId};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the GN3S driver
#[derive(Debug, Error)]
pub enum DriverError {
    /// Error reported by libusb
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No device with the requested identifiers is attached
    #[error("Device {id} not found")]
    DeviceNotFound { id: UsbId },

    /// A step of opening/configuring the device failed
    #[error("Failed to {step}: {source}")]
    Configure {
        step: &'static str,
        source: rusb::Error,
    },

    /// A bulk transfer could not be submitted
    #[error("Failed to submit transfer {slot}: {source}")]
    Submit { slot: usize, source: rusb::Error },

    /// One or more cancellation requests were rejected
    #[error("Failed to cancel {failed} of {total} transfers")]
    Cancel { failed: usize, total: usize },

    /// A control transfer moved fewer bytes than its data phase requires
    #[error("Control transfer returned {actual} bytes, expected {expected}")]
    ShortControl { expected: usize, actual: usize },

    /// The start-streaming command never succeeded
    #[error("Streaming did not start after {attempts} attempts in {elapsed:?}: {last_error}")]
    StreamStartTimeout {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },

    /// Firmware image could not be loaded
    #[error("Firmware error: {0}")]
    Firmware(String),

    /// Stream geometry or timing is unusable
    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(String),

    /// Operation on a source that has been closed
    #[error("Source is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, DriverError>;
