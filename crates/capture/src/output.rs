//! Sample output
//!
//! Packets are written as interleaved little-endian `i16` I/Q pairs, the
//! layout most SDR tools read as "complex int16".

use byteorder::{LittleEndian, WriteBytesExt};
use protocol::Cpx;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Open `path` for writing, or stdout when `None`
pub fn open_output(path: Option<&Path>) -> io::Result<Box<dyn Write + Send>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    })
}

/// Writes complex samples to a byte sink
pub struct SampleWriter<W: Write> {
    inner: W,
    samples_written: u64,
}

impl<W: Write> SampleWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            samples_written: 0,
        }
    }

    pub fn write_samples(&mut self, samples: &[Cpx]) -> io::Result<()> {
        for sample in samples {
            self.inner.write_i16::<LittleEndian>(sample.i)?;
            self.inner.write_i16::<LittleEndian>(sample.q)?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
