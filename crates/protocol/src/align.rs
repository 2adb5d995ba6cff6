//! Frame alignment of the raw GN3S byte stream
//!
//! The front end emits one byte per sample component: bit 0 carries the
//! 1-bit sample and bit 1 marks the in-phase component of an I/Q pair.
//! A chunk read from the ring buffer may start on a stray Q byte left over
//! from the previous frame, and may end on the first half of a pair whose
//! second half has not arrived yet.
//!
//! ```text
//! aligned:   [I0 Q0 I1 Q1 ... In Qn]          bit1(first) = 1
//! skewed:    [Qx I0 Q0 I1 Q1 ... In]          bit1(first) = 0 -> drop byte 0
//! ```
//!
//! Alignment is detected from the first byte of the chunk and the last byte
//! decides whether the final position is genuine or must be blanked. Every
//! selected byte maps through [`SAMPLE_LUT`].

use crate::error::{ProtocolError, Result};
use crate::types::Cpx;
use serde::{Deserialize, Serialize};

/// Bit 0 of a raw byte indexes this table: 0 -> +1, 1 -> -1
pub const SAMPLE_LUT: [i16; 2] = [1, -1];

/// Bit marking a byte as the in-phase half of a pair
const FRAME_BIT: u8 = 0x02;

/// How often the start-of-chunk skew is derived
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMode {
    /// Re-derive the skew from every chunk's first byte
    #[default]
    PerRead,
    /// Detect the skew on the first chunk and keep it for the session
    Latched,
}

/// Skew state of one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSkew {
    /// First byte is a stray half-sample; every value comes from the next byte
    pub shifted: bool,
    /// Last byte is a partial sample and its value is blanked
    pub trailing_partial: bool,
}

impl FrameSkew {
    /// Derive the skew flags from the first and last bytes of `raw`
    pub fn detect(raw: &[u8]) -> Self {
        match (raw.first(), raw.last()) {
            (Some(first), Some(last)) => Self {
                shifted: first & FRAME_BIT == 0,
                trailing_partial: last & FRAME_BIT != 0,
            },
            _ => Self::default(),
        }
    }
}

/// Decode a single raw byte into a sample component
#[inline]
pub fn decode_component(byte: u8) -> i16 {
    SAMPLE_LUT[(byte & 0x01) as usize]
}

/// Turns raw 2N-byte chunks into N complex samples
#[derive(Debug, Clone)]
pub struct FrameAligner {
    mode: AlignmentMode,
    latched_shift: Option<bool>,
}

impl FrameAligner {
    pub fn new(mode: AlignmentMode) -> Self {
        Self {
            mode,
            latched_shift: None,
        }
    }

    pub fn mode(&self) -> AlignmentMode {
        self.mode
    }

    /// Whether a latched skew has been taken from real device bytes
    pub fn is_latched(&self) -> bool {
        self.latched_shift.is_some()
    }

    /// Align a chunk made entirely of device bytes into `out`
    ///
    /// `raw` must hold exactly two bytes per output sample. Returns the skew
    /// that was applied.
    pub fn align(&mut self, raw: &[u8], out: &mut [Cpx]) -> Result<FrameSkew> {
        self.align_received(raw, raw.len(), out)
    }

    /// Align a zero-padded chunk whose first `received` bytes came from the
    /// device
    ///
    /// Under [`AlignmentMode::Latched`] the skew is only latched from a
    /// chunk with at least one received byte; padding never decides it.
    pub fn align_received(
        &mut self,
        raw: &[u8],
        received: usize,
        out: &mut [Cpx],
    ) -> Result<FrameSkew> {
        if raw.len() != out.len() * 2 {
            return Err(ProtocolError::BufferSize {
                needed: out.len() * 2,
                available: raw.len(),
            });
        }
        if raw.is_empty() {
            return Ok(FrameSkew::default());
        }

        let mut skew = FrameSkew::detect(raw);
        if self.mode == AlignmentMode::Latched {
            if let Some(shifted) = self.latched_shift {
                skew.shifted = shifted;
            } else if received > 0 {
                self.latched_shift = Some(skew.shifted);
            }
        }

        let last = raw.len() - 1;
        let value = |j: usize| -> i16 {
            let source = if skew.shifted { j + 1 } else { j };
            if source > last || (source == last && skew.trailing_partial) {
                0
            } else {
                decode_component(raw[source])
            }
        };

        for (k, sample) in out.iter_mut().enumerate() {
            *sample = Cpx::new(value(2 * k), value(2 * k + 1));
        }

        Ok(skew)
    }
}

impl Default for FrameAligner {
    fn default() -> Self {
        Self::new(AlignmentMode::default())
    }
}
