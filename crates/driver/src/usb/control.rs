//! GN3S vendor control requests
//!
//! All commands go to endpoint 0 as vendor requests. The direction is taken
//! from bit 7 of the request code: set means device-to-host. Every control
//! transfer carries the same fixed timeout and a failure is reported, never
//! retried here.

use crate::error::{DriverError, Result};
use protocol::{
    CONTROL_TIMEOUT_MS, CPUCS_ADDRESS, GS_RX_OVERRUN, RAM_UPLOAD_CHUNK, VRQ_FIRMWARE_LOAD,
    VRQ_GET_STATUS, VRQ_XFER, VRT_VENDOR_IN, VRT_VENDOR_OUT,
};
use rusb::{DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for every control transfer
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(CONTROL_TIMEOUT_MS);

/// Endpoint-0 transport used by the command helpers
///
/// Implemented for `rusb::DeviceHandle`; tests provide recording fakes.
pub trait ControlTransport {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
}

impl<T: UsbContext> ControlTransport for DeviceHandle<T> {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::read_control(self, request_type, request, value, index, buf, timeout)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        DeviceHandle::write_control(self, request_type, request, value, index, buf, timeout)
    }
}

impl<C: ControlTransport + ?Sized> ControlTransport for std::sync::Arc<C> {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        (**self).read_control(request_type, request, value, index, buf, timeout)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        (**self).write_control(request_type, request, value, index, buf, timeout)
    }
}

/// Request type for a vendor request code
pub fn request_type_for(request: u8) -> u8 {
    if request & 0x80 != 0 {
        VRT_VENDOR_IN
    } else {
        VRT_VENDOR_OUT
    }
}

/// Issue a vendor request
///
/// For IN requests `buf` receives the data phase; for OUT requests it is
/// sent. Returns the number of bytes transferred.
pub fn vendor_request<C: ControlTransport + ?Sized>(
    ctrl: &C,
    request: u8,
    value: u16,
    index: u16,
    buf: &mut [u8],
) -> Result<usize> {
    let request_type = request_type_for(request);

    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, data_len={}",
        request_type,
        request,
        value,
        index,
        buf.len()
    );

    let result = if request_type == VRT_VENDOR_IN {
        ctrl.read_control(request_type, request, value, index, buf, CONTROL_TIMEOUT)
    } else {
        ctrl.write_control(request_type, request, value, index, buf, CONTROL_TIMEOUT)
    };

    result.map_err(|e| {
        // The firmware stalls endpoint 0 for requests it does not accept yet
        if e == rusb::Error::Pipe {
            debug!("Control request {:#x} stalled", request);
        } else {
            warn!("Control request {:#x} failed: {}", request, e);
        }
        DriverError::Usb(e)
    })
}

/// Query a 1-byte status flag; a non-zero byte means the condition is present
pub fn get_status<C: ControlTransport + ?Sized>(ctrl: &C, which: u16) -> Result<bool> {
    let mut status = [0u8; 1];
    let n = vendor_request(ctrl, VRQ_GET_STATUS, 0, which, &mut status)?;
    if n != status.len() {
        return Err(DriverError::ShortControl {
            expected: status.len(),
            actual: n,
        });
    }
    Ok(status[0] != 0)
}

/// Whether the device dropped samples since the last query
pub fn check_rx_overrun<C: ControlTransport + ?Sized>(ctrl: &C) -> Result<bool> {
    get_status(ctrl, GS_RX_OVERRUN)
}

/// Start or stop the sample stream
pub fn set_streaming<C: ControlTransport + ?Sized>(ctrl: &C, start: bool) -> Result<()> {
    vendor_request(ctrl, VRQ_XFER, u16::from(start), 0, &mut [])?;
    Ok(())
}

/// Write `data` to FX2 RAM at `address` in chunks of at most 16 bytes
///
/// Stops at the first failed chunk. Returns the number of bytes written.
pub fn write_ram<C: ControlTransport + ?Sized>(
    ctrl: &C,
    address: u16,
    data: &[u8],
) -> Result<usize> {
    let mut written = 0;
    for (i, chunk) in data.chunks(RAM_UPLOAD_CHUNK).enumerate() {
        let chunk_address = address.wrapping_add((i * RAM_UPLOAD_CHUNK) as u16);
        let n = ctrl
            .write_control(
                VRT_VENDOR_OUT,
                VRQ_FIRMWARE_LOAD,
                chunk_address,
                0,
                chunk,
                CONTROL_TIMEOUT,
            )
            .map_err(|e| {
                warn!("RAM upload at {:#06x} failed: {}", chunk_address, e);
                DriverError::Usb(e)
            })?;
        written += n;
    }
    Ok(written)
}

/// Hold (`true`) or release (`false`) the FX2's 8051 core in reset
pub fn set_cpu_reset<C: ControlTransport + ?Sized>(ctrl: &C, hold: bool) -> Result<()> {
    write_ram(ctrl, CPUCS_ADDRESS, &[u8::from(hold)])?;
    Ok(())
}
