//! GN3S device constants and sample types
//!
//! This module defines the USB identifiers, vendor request codes and
//! streaming geometry of the GN3S front end, together with the complex
//! sample type produced by the frame aligner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// USB vendor/product identifier pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbId {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
}

impl UsbId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl FromStr for UsbId {
    type Err = String;

    /// Parse `VID:PID` with optional `0x` prefixes (e.g. `16c0:072f`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| format!("expected VID:PID, got '{}'", s))?;

        fn parse_hex(part: &str) -> Result<u16, String> {
            let digits = part
                .strip_prefix("0x")
                .or_else(|| part.strip_prefix("0X"))
                .unwrap_or(part);
            if digits.is_empty() || digits.len() > 4 {
                return Err(format!("'{}' must be 1-4 hex digits", part));
            }
            u16::from_str_radix(digits, 16).map_err(|_| format!("'{}' is not a hex number", part))
        }

        Ok(Self::new(parse_hex(vid)?, parse_hex(pid)?))
    }
}

/// Operational identifiers, reported once the GN3S firmware is running
pub const GN3S_ID: UsbId = UsbId::new(0x16C0, 0x072F);

/// Identifiers of an unprogrammed FX2 (bootloader only)
pub const FX2_UNPROGRAMMED_ID: UsbId = UsbId::new(0x1781, 0x0B39);

/// Vendor request type, device-to-host
pub const VRT_VENDOR_IN: u8 = 0xC0;
/// Vendor request type, host-to-device
pub const VRT_VENDOR_OUT: u8 = 0x40;

/// Query a 1-byte status flag (`index` selects the flag)
pub const VRQ_GET_STATUS: u8 = 0x80;
/// Start (`value = 1`) or stop (`value = 0`) sample streaming
pub const VRQ_XFER: u8 = 0x01;
/// FX2 bootloader "firmware load" request, writes internal RAM
pub const VRQ_FIRMWARE_LOAD: u8 = 0xA0;

/// Status code: receive FIFO overrun since last query
pub const GS_RX_OVERRUN: u16 = 1;

/// FX2 CPU control/status register; writing 1 holds the 8051 in reset
pub const CPUCS_ADDRESS: u16 = 0xE600;

/// Largest payload uploaded per firmware-load control transfer
pub const RAM_UPLOAD_CHUNK: usize = 16;

/// Bulk IN endpoint carrying raw samples
pub const RX_ENDPOINT: u8 = 0x86;
/// Interface owning the sample endpoint
pub const RX_INTERFACE: u8 = 2;
/// Alternate setting selected on the sample interface
pub const RX_ALT_SETTING: u8 = 0;
/// Configuration value set before claiming the interface
pub const RX_CONFIGURATION: u8 = 1;

/// Default number of concurrently outstanding bulk transfers
pub const DEFAULT_TRANSFERS: usize = 16;
/// Default length of each bulk transfer (one ring buffer slot)
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;
/// High-speed bulk max packet size; block sizes must be a multiple of it
pub const BULK_PACKET_SIZE: usize = 512;

/// Timeout applied to every control transfer (milliseconds)
pub const CONTROL_TIMEOUT_MS: u64 = 1000;
/// Default bulk transfer timeout (milliseconds)
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 1000;

/// One complex baseband sample
///
/// The GN3S delivers one bit per component; after alignment each component
/// is +1 or -1, or 0 where a position had to be blanked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(C)]
pub struct Cpx {
    /// In-phase component
    pub i: i16,
    /// Quadrature component
    pub q: i16,
}

impl Cpx {
    pub const ZERO: Cpx = Cpx { i: 0, q: 0 };

    pub const fn new(i: i16, q: i16) -> Self {
        Self { i, q }
    }
}
