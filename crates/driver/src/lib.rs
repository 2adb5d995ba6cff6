//! GN3S USB driver
//!
//! Streams raw samples from a GN3S GPS front end over libusb and turns them
//! into complex samples.
//!
//! # Architecture
//!
//! ```text
//!  Source<Gn3s>            caller thread: start command, overrun check,
//!     |                    read, zero-pad, frame alignment
//!  SampleReader  <--  RingBuffer  <--  TransferPool (T bulk-IN transfers)
//!                                           ^
//!                                      EventWorker ("gn3s-usb-events")
//! ```
//!
//! Each bulk transfer owns one slot of the ring. Completions publish their
//! byte count through an atomic write cursor and resubmit themselves, so the
//! reader never takes a lock.
//!
//! # Example
//!
//! ```no_run
//! use driver::{OpenOptions, SamplePacket, Source};
//!
//! let mut source = Source::open(&OpenOptions::default())?;
//! let mut packet = SamplePacket::new(2048);
//! source.read(&mut packet)?;
//! println!("first sample: {:?}", packet.samples[0]);
//! # Ok::<(), driver::DriverError>(())
//! ```

pub mod error;
pub mod firmware;
pub mod gn3s;
pub mod ring;
pub mod source;
pub mod usb;

pub use error::{DriverError, Result};
pub use firmware::{
    DEFAULT_FIRMWARE_PATH, FlashReport, flash_file, flash_image, flash_unprogrammed, load_image,
};
pub use gn3s::{Gn3s, MAX_TRANSFERS, MIN_TRANSFERS, OpenOptions, StreamConfig};
pub use ring::{RingBuffer, SampleReader};
pub use source::{ReadOutcome, RetryPolicy, SamplePacket, SampleStream, Source, SourceState};
pub use usb::{DeviceSelection, DeviceSummary, list_devices};
