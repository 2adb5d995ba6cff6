//! Intel-HEX record decoding
//!
//! Firmware images for the FX2 are distributed as Intel-HEX text, one record
//! per line:
//!
//! ```text
//! :LLAAAATT[DD...]CC
//!  |  |   | |     +-- checksum: two's complement of the byte-sum of all fields
//!  |  |   | +-------- LL data bytes
//!  |  |   +---------- record type
//!  |  +-------------- 16-bit load address (big-endian)
//!  +----------------- data length
//! ```
//!
//! A record is valid when the byte-sum of every field including the checksum
//! is zero modulo 256.

use crate::error::{ProtocolError, Result};

/// Characters in a record with no data: ':' LL AAAA TT CC
const MIN_RECORD_LEN: usize = 11;

/// Intel-HEX record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Payload bytes to load at the record address
    Data,
    /// Last record of the image
    EndOfFile,
    /// Segment base (address bits 4..19) for following records
    ExtendedSegmentAddress,
    /// 80x86 CS:IP start address
    StartSegmentAddress,
    /// Upper 16 bits of a 32-bit address for following records
    ExtendedLinearAddress,
    /// 32-bit start address
    StartLinearAddress,
}

impl TryFrom<u8> for RecordType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Data),
            0x01 => Ok(Self::EndOfFile),
            0x02 => Ok(Self::ExtendedSegmentAddress),
            0x03 => Ok(Self::StartSegmentAddress),
            0x04 => Ok(Self::ExtendedLinearAddress),
            0x05 => Ok(Self::StartLinearAddress),
            other => Err(ProtocolError::UnknownRecordType(other)),
        }
    }
}

/// One decoded Intel-HEX line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordType,
    pub address: u16,
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl Record {
    /// Encode the record back into its textual form
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(MIN_RECORD_LEN + self.data.len() * 2);
        line.push(':');
        line.push_str(&format!(
            "{:02X}{:04X}{:02X}",
            self.data.len(),
            self.address,
            self.kind as u8
        ));
        for byte in &self.data {
            line.push_str(&format!("{:02X}", byte));
        }
        line.push_str(&format!("{:02X}", self.checksum));
        line
    }

    /// Build a record with a correct checksum
    pub fn new(kind: RecordType, address: u16, data: Vec<u8>) -> Self {
        let checksum = record_checksum(kind, address, &data);
        Self {
            kind,
            address,
            data,
            checksum,
        }
    }
}

/// Compute the checksum byte that makes the record's byte-sum zero
pub fn record_checksum(kind: RecordType, address: u16, data: &[u8]) -> u8 {
    byte_sum(kind as u8, address, data).wrapping_neg()
}

/// Sum of the length, address, type and data bytes, modulo 256
fn byte_sum(raw_type: u8, address: u16, data: &[u8]) -> u8 {
    let [addr_hi, addr_lo] = address.to_be_bytes();
    data.iter().fold(
        (data.len() as u8)
            .wrapping_add(addr_hi)
            .wrapping_add(addr_lo)
            .wrapping_add(raw_type),
        |acc, b| acc.wrapping_add(*b),
    )
}

/// Parse and validate a single Intel-HEX line
///
/// Trailing whitespace (including `\r\n`) is ignored. Characters after the
/// checksum are ignored as well.
pub fn parse_record(line: &str) -> Result<Record> {
    let bytes = line.trim_end().as_bytes();

    if bytes.first() != Some(&b':') {
        return Err(ProtocolError::MissingStartCode);
    }

    if bytes.len() < MIN_RECORD_LEN {
        return Err(ProtocolError::Truncated {
            expected: MIN_RECORD_LEN,
            actual: bytes.len(),
        });
    }

    let length = hex_byte(bytes, 1)? as usize;
    let expected_len = MIN_RECORD_LEN + length * 2;
    if bytes.len() < expected_len {
        return Err(ProtocolError::Truncated {
            expected: expected_len,
            actual: bytes.len(),
        });
    }

    let address = u16::from_be_bytes([hex_byte(bytes, 3)?, hex_byte(bytes, 5)?]);
    let raw_type = hex_byte(bytes, 7)?;

    let data = (0..length)
        .map(|i| hex_byte(bytes, 9 + i * 2))
        .collect::<Result<Vec<u8>>>()?;

    let checksum = hex_byte(bytes, 9 + length * 2)?;

    // Checksum covers the raw type byte, so it is checked before decoding the type
    let sum = byte_sum(raw_type, address, &data);
    if sum.wrapping_add(checksum) != 0 {
        return Err(ProtocolError::ChecksumMismatch {
            expected: sum.wrapping_neg(),
            found: checksum,
        });
    }

    Ok(Record {
        kind: RecordType::try_from(raw_type)?,
        address,
        data,
        checksum,
    })
}

fn hex_byte(bytes: &[u8], column: usize) -> Result<u8> {
    let hi = bytes.get(column).and_then(|b| nibble(*b));
    let lo = bytes.get(column + 1).and_then(|b| nibble(*b));
    match (hi, lo) {
        (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
        _ => Err(ProtocolError::InvalidHex { column }),
    }
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
