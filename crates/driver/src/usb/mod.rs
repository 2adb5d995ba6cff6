//! USB subsystem
//!
//! Device discovery and session setup, endpoint-0 vendor commands, the
//! bulk-IN transfer pool and the event thread that drives its callbacks.

pub mod control;
pub mod device;
pub mod pipeline;
pub mod worker;

pub use control::{ControlTransport, check_rx_overrun, get_status, set_streaming};
pub use device::{
    DeviceSelection, DeviceSession, DeviceSummary, InterfaceControl, find_device, list_devices,
};
pub use pipeline::{PoolConfig, TransferPool, TransferStatus};
pub use worker::EventWorker;
