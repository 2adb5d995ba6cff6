//! Firmware loader tests against a recording control transport

use driver::usb::ControlTransport;
use driver::{DriverError, flash_file, flash_image, load_image};
use protocol::{CPUCS_ADDRESS, Record, RecordType, VRQ_FIRMWARE_LOAD, VRT_VENDOR_OUT};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct RamWrite {
    address: u16,
    data: Vec<u8>,
}

/// Records every RAM write; optionally fails the first write at an address
#[derive(Default)]
struct RecordingTransport {
    writes: Mutex<Vec<RamWrite>>,
    fail_at: Option<u16>,
}

impl RecordingTransport {
    fn writes(&self) -> Vec<RamWrite> {
        self.writes.lock().unwrap().clone()
    }

    /// Writes excluding the CPUCS bracket
    fn ram_writes(&self) -> Vec<RamWrite> {
        self.writes()
            .into_iter()
            .filter(|w| w.address != CPUCS_ADDRESS)
            .collect()
    }
}

impl ControlTransport for RecordingTransport {
    fn read_control(
        &self,
        _request_type: u8,
        _request: u8,
        _value: u16,
        _index: u16,
        _buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        Err(rusb::Error::NotSupported)
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
        assert_eq!(request_type, VRT_VENDOR_OUT);
        assert_eq!(request, VRQ_FIRMWARE_LOAD);
        assert_eq!(index, 0);
        assert_eq!(timeout, Duration::from_millis(1000));
        assert!(buf.len() <= 16, "chunk of {} bytes", buf.len());

        if self.fail_at == Some(value) {
            return Err(rusb::Error::Io);
        }
        self.writes.lock().unwrap().push(RamWrite {
            address: value,
            data: buf.to_vec(),
        });
        Ok(buf.len())
    }
}

fn data_line(address: u16, data: Vec<u8>) -> String {
    Record::new(RecordType::Data, address, data).to_line()
}

const EOF_LINE: &str = ":00000001FF";

#[test]
fn test_cpucs_brackets_upload() {
    let ctrl = RecordingTransport::default();
    let image = format!("{}\n{}\n", data_line(0x0000, vec![0x02, 0x00, 0x80]), EOF_LINE);

    let report = flash_image(&ctrl, image.as_bytes()).unwrap();
    assert_eq!(report.records_uploaded, 1);

    let writes = ctrl.writes();
    assert_eq!(writes.len(), 3);
    assert_eq!(
        writes.first(),
        Some(&RamWrite {
            address: CPUCS_ADDRESS,
            data: vec![0x01]
        })
    );
    assert_eq!(writes[1].address, 0x0000);
    assert_eq!(
        writes.last(),
        Some(&RamWrite {
            address: CPUCS_ADDRESS,
            data: vec![0x00]
        })
    );
}

#[test]
fn test_bad_checksum_is_never_uploaded() {
    let ctrl = RecordingTransport::default();
    let good = data_line(0x0100, vec![0x11, 0x22, 0x33]);
    let mut bad = data_line(0x0200, vec![0x44, 0x55]);
    // Corrupt the checksum byte
    bad.replace_range(bad.len() - 2.., "00");

    let image = format!("{}\n{}\n{}\n", bad, good, EOF_LINE);
    let report = load_image(&ctrl, image.as_bytes()).unwrap();

    assert_eq!(report.records_skipped, 1);
    assert_eq!(report.records_uploaded, 1);
    assert!(ctrl.writes().iter().all(|w| w.address != 0x0200));
}

#[test]
fn test_long_record_is_chunked() {
    let ctrl = RecordingTransport::default();
    let payload: Vec<u8> = (0..40).collect();
    let image = format!("{}\n{}\n", data_line(0x1000, payload.clone()), EOF_LINE);

    let report = load_image(&ctrl, image.as_bytes()).unwrap();
    assert_eq!(report.bytes_written, 40);

    let writes = ctrl.ram_writes();
    let addresses: Vec<u16> = writes.iter().map(|w| w.address).collect();
    assert_eq!(addresses, vec![0x1000, 0x1010, 0x1020]);

    let rejoined: Vec<u8> = writes.into_iter().flat_map(|w| w.data).collect();
    assert_eq!(rejoined, payload);
}

#[test]
fn test_records_after_eof_are_ignored() {
    let ctrl = RecordingTransport::default();
    let image = format!(
        "{}\n{}\n{}\n",
        data_line(0x0000, vec![0xAA]),
        EOF_LINE,
        data_line(0x0010, vec![0xBB])
    );

    let report = load_image(&ctrl, image.as_bytes()).unwrap();
    assert!(report.reached_eof);
    assert_eq!(ctrl.ram_writes().len(), 1);
}

#[test]
fn test_reset_released_after_failed_record() {
    let ctrl = RecordingTransport {
        fail_at: Some(0x0040),
        ..Default::default()
    };
    let image = format!(
        "{}\n{}\n{}\n",
        data_line(0x0040, vec![1, 2, 3]),
        data_line(0x0050, vec![4, 5, 6]),
        EOF_LINE
    );

    let report = flash_image(&ctrl, image.as_bytes()).unwrap();
    assert_eq!(report.records_failed, 1);
    assert_eq!(report.records_uploaded, 1);
    assert_eq!(
        ctrl.writes().last().map(|w| (w.address, w.data.clone())),
        Some((CPUCS_ADDRESS, vec![0x00]))
    );
}

#[test]
fn test_flash_file_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{}", data_line(0x0000, vec![0x02, 0x00, 0x06])).unwrap();
    writeln!(file, "{}", data_line(0x0006, vec![0x75, 0x81, 0x5F])).unwrap();
    writeln!(file, "{}", EOF_LINE).unwrap();
    file.flush().unwrap();

    let ctrl = RecordingTransport::default();
    let report = flash_file(&ctrl, file.path()).unwrap();

    assert_eq!(report.records_uploaded, 2);
    assert_eq!(report.bytes_written, 6);
    assert!(report.reached_eof);
    assert_eq!(ctrl.writes().len(), 4);
}

#[test]
fn test_flash_file_missing() {
    let ctrl = RecordingTransport::default();
    let dir = tempfile::tempdir().unwrap();
    let err = flash_file(&ctrl, &dir.path().join("missing.ihx")).unwrap_err();
    assert!(matches!(err, DriverError::Firmware(_)));
}
