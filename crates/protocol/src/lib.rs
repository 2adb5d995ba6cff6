//! Device protocol for the GN3S front end
//!
//! This crate holds everything about the GN3S that does not need a USB
//! handle: identifiers and vendor request codes, the Intel-HEX firmware
//! record format, and the frame aligner that turns the raw byte stream into
//! complex samples.
//!
//! # Example
//!
//! ```
//! use protocol::{Cpx, FrameAligner};
//!
//! // Two aligned I/Q pairs: bit 1 marks I, bit 0 carries the sample
//! let raw = [0x02, 0x01, 0x03, 0x00];
//! let mut samples = [Cpx::ZERO; 2];
//!
//! let skew = FrameAligner::default().align(&raw, &mut samples).unwrap();
//! assert!(!skew.shifted);
//! assert_eq!(samples[0], Cpx::new(1, -1));
//! assert_eq!(samples[1], Cpx::new(-1, 1));
//! ```
//!
//! # Firmware records
//!
//! ```
//! use protocol::{parse_record, RecordType};
//!
//! let record = parse_record(":0300300002337A1E").unwrap();
//! assert_eq!(record.kind, RecordType::Data);
//! assert_eq!(record.address, 0x0030);
//! ```

pub mod align;
pub mod error;
pub mod ihex;
pub mod types;

pub use align::{AlignmentMode, FrameAligner, FrameSkew, SAMPLE_LUT, decode_component};
pub use error::{ProtocolError, Result};
pub use ihex::{Record, RecordType, parse_record, record_checksum};
pub use types::{
    BULK_PACKET_SIZE, CONTROL_TIMEOUT_MS, CPUCS_ADDRESS, Cpx, DEFAULT_BLOCK_SIZE,
    DEFAULT_TRANSFER_TIMEOUT_MS, DEFAULT_TRANSFERS, FX2_UNPROGRAMMED_ID, GN3S_ID, GS_RX_OVERRUN,
    RAM_UPLOAD_CHUNK, RX_ALT_SETTING, RX_CONFIGURATION, RX_ENDPOINT, RX_INTERFACE, UsbId,
    VRQ_FIRMWARE_LOAD, VRQ_GET_STATUS, VRQ_XFER, VRT_VENDOR_IN, VRT_VENDOR_OUT,
};
