//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding device data formats
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Intel-HEX line does not start with ':'
    #[error("Missing record start code ':'")]
    MissingStartCode,

    /// A field is not valid hexadecimal
    #[error("Invalid hex digits at column {column}")]
    InvalidHex { column: usize },

    /// Line is shorter than its declared length requires
    #[error("Record truncated: expected {expected} characters, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Byte-sum of the record is not zero modulo 256
    #[error("Checksum mismatch: record has {found:#04x}, computed {expected:#04x}")]
    ChecksumMismatch { expected: u8, found: u8 },

    /// Record type outside 0x00..=0x05
    #[error("Unknown record type {0:#04x}")]
    UnknownRecordType(u8),

    /// Chunk handed to the aligner does not match the packet length
    #[error("Buffer size mismatch: needed {needed}, got {available}")]
    BufferSize { needed: usize, available: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::ChecksumMismatch {
            expected: 0x3c,
            found: 0x3d,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Checksum mismatch"));
        assert!(msg.contains("0x3d"));
        assert!(msg.contains("0x3c"));
    }

    #[test]
    fn test_truncated_error() {
        let err = ProtocolError::Truncated {
            expected: 43,
            actual: 12,
        };
        assert!(format!("{}", err).contains("expected 43"));
    }
}
