//! FX2 firmware loader
//!
//! An unprogrammed GN3S enumerates with the bare FX2 identifiers. Loading
//! firmware means holding the 8051 in reset through CPUCS, writing every
//! Intel-HEX data record into RAM with vendor request 0xA0, and releasing
//! reset. The device then re-enumerates with the GN3S identifiers.

use crate::error::{DriverError, Result};
use crate::usb::control::{ControlTransport, set_cpu_reset, write_ram};
use crate::usb::device::{DeviceSelection, find_device};
use protocol::{FX2_UNPROGRAMMED_ID, RecordType, parse_record};
use rusb::UsbContext;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

/// Default firmware image name
pub const DEFAULT_FIRMWARE_PATH: &str = "gn3s_firmware.ihx";

/// Outcome of a firmware upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashReport {
    /// Data records written to RAM
    pub records_uploaded: usize,
    /// Lines skipped for a missing start code or a bad record
    pub records_skipped: usize,
    /// Data records whose upload was rejected by the device
    pub records_failed: usize,
    /// Bytes written to RAM
    pub bytes_written: usize,
    /// Extended address records seen and ignored
    pub extended_address_records: usize,
    /// Whether an end-of-file record was reached
    pub reached_eof: bool,
}

/// Upload every data record read from `image`
///
/// Lines without a start code and records failing their checksum are logged
/// and skipped. Loading stops at the end-of-file record. The CPU is not
/// touched; see [`flash_image`].
pub fn load_image<C, R>(ctrl: &C, image: R) -> Result<FlashReport>
where
    C: ControlTransport + ?Sized,
    R: BufRead,
{
    let mut report = FlashReport::default();

    for (number, line) in image.lines().enumerate() {
        let line = line?;
        let line = line.trim_end();
        let number = number + 1;

        if !line.starts_with(':') {
            warn!("Line {}: invalid record {:?}", number, line);
            report.records_skipped += 1;
            continue;
        }

        let record = match parse_record(line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Line {}: {}", number, e);
                report.records_skipped += 1;
                continue;
            }
        };

        match record.kind {
            RecordType::Data => match write_ram(ctrl, record.address, &record.data) {
                Ok(n) => {
                    debug!(
                        "Programmed {} bytes at {:#06x}",
                        record.data.len(),
                        record.address
                    );
                    report.records_uploaded += 1;
                    report.bytes_written += n;
                }
                Err(e) => {
                    warn!(
                        "Line {}: upload at {:#06x} failed: {}",
                        number, record.address, e
                    );
                    report.records_failed += 1;
                }
            },
            RecordType::EndOfFile => {
                debug!("End of file at line {}", number);
                report.reached_eof = true;
                break;
            }
            RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress => {
                // FX2 RAM is 16-bit addressed
                warn!("Line {}: extended address record not supported", number);
                report.extended_address_records += 1;
            }
            RecordType::StartSegmentAddress | RecordType::StartLinearAddress => {}
        }
    }

    Ok(report)
}

/// Hold the CPU in reset, upload `image`, then release it
///
/// Reset is released even when the upload fails part way.
pub fn flash_image<C, R>(ctrl: &C, image: R) -> Result<FlashReport>
where
    C: ControlTransport + ?Sized,
    R: BufRead,
{
    set_cpu_reset(ctrl, true)?;
    let result = load_image(ctrl, image);
    let released = set_cpu_reset(ctrl, false);

    let report = result?;
    released?;
    Ok(report)
}

/// Flash the Intel-HEX file at `path`
pub fn flash_file<C>(ctrl: &C, path: &Path) -> Result<FlashReport>
where
    C: ControlTransport + ?Sized,
{
    let file = File::open(path).map_err(|e| {
        DriverError::Firmware(format!("cannot open {}: {}", path.display(), e))
    })?;
    info!("Loading firmware from {}", path.display());

    let report = flash_image(ctrl, BufReader::new(file))?;
    info!(
        "Firmware loaded: {} records, {} bytes ({} skipped, {} failed)",
        report.records_uploaded,
        report.bytes_written,
        report.records_skipped,
        report.records_failed
    );
    Ok(report)
}

/// Find an unprogrammed FX2 and flash `path` into it
pub fn flash_unprogrammed<T: UsbContext>(
    context: &T,
    path: &Path,
    selection: DeviceSelection,
) -> Result<FlashReport> {
    let device = find_device(context, FX2_UNPROGRAMMED_ID, selection)?.ok_or(
        DriverError::DeviceNotFound {
            id: FX2_UNPROGRAMMED_ID,
        },
    )?;

    info!(
        "Flashing unprogrammed device at {:03}:{:03}",
        device.bus_number(),
        device.address()
    );

    let handle = device.open().map_err(|source| DriverError::Configure {
        step: "open unprogrammed device",
        source,
    })?;
    flash_file(&handle, path)
}
