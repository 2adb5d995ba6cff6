//! Sample source facade
//!
//! [`Source`] turns a raw byte stream into packets of complex samples. It
//! issues the start command on the first read, checks the overrun flag on
//! every read, zero-pads short reads and aligns the frame.
//!
//! The byte stream is abstracted by [`SampleStream`]; the hardware
//! implementation is [`Gn3s`](crate::Gn3s).

use crate::error::{DriverError, Result};
use common::StreamMetrics;
use protocol::{AlignmentMode, Cpx, FrameAligner, FrameSkew};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

/// Raw byte stream from a GN3S-like device
pub trait SampleStream {
    /// Send the start (`true`) or stop (`false`) command
    fn set_streaming(&mut self, start: bool) -> Result<()>;

    /// Query and clear the device's overrun flag
    fn rx_overrun(&mut self) -> Result<bool>;

    /// Copy up to `buf.len()` received bytes; never blocks
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Bytes received but not yet read
    fn available(&self) -> usize;

    fn metrics(&self) -> &Arc<StreamMetrics>;

    /// Stop streaming and release the device
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Backoff for the start-streaming command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_micros(100),
            max_delay: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay to use after `delay`
    pub fn next_delay(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.max_delay)
    }
}

/// Lifecycle of a [`Source`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Device open, start command not yet sent
    Opening,
    Streaming,
    Closing,
    Closed,
}

/// A packet of complex samples
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePacket {
    pub samples: Vec<Cpx>,
    /// Sequence number assigned by the source
    pub index: u64,
}

impl SamplePacket {
    pub fn new(samples_per_packet: usize) -> Self {
        Self {
            samples: vec![Cpx::ZERO; samples_per_packet],
            index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// What happened during one [`Source::read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Raw bytes actually received; the rest of the packet is zero-padded
    pub bytes: usize,
    pub overrun: bool,
    pub skew: FrameSkew,
}

/// Complex sample source on top of a [`SampleStream`]
pub struct Source<S: SampleStream> {
    stream: Option<S>,
    state: SourceState,
    aligner: FrameAligner,
    retry: RetryPolicy,
    raw: Vec<u8>,
    packets: u64,
    metrics: Arc<StreamMetrics>,
}

impl<S: SampleStream> Source<S> {
    pub fn new(stream: S, alignment: AlignmentMode, retry: RetryPolicy) -> Self {
        let metrics = stream.metrics().clone();
        Self {
            stream: Some(stream),
            state: SourceState::Opening,
            aligner: FrameAligner::new(alignment),
            retry,
            raw: Vec::new(),
            packets: 0,
            metrics,
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Packets delivered so far
    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    /// Send the start command, retrying with backoff until the timeout
    fn start_streaming(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(DriverError::Closed)?;
        let started = Instant::now();
        let mut delay = self.retry.initial_delay;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match stream.set_streaming(true) {
                Ok(()) => {
                    info!("Streaming started after {} attempt(s)", attempts);
                    self.state = SourceState::Streaming;
                    self.metrics.mark_started();
                    return Ok(());
                }
                Err(e) => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.retry.timeout {
                        return Err(DriverError::StreamStartTimeout {
                            attempts,
                            elapsed,
                            last_error: e.to_string(),
                        });
                    }
                    debug!("Start command attempt {} failed: {}", attempts, e);
                    std::thread::sleep(delay.min(self.retry.timeout - elapsed));
                    delay = self.retry.next_delay(delay);
                }
            }
        }
    }

    /// Send the start command if it has not been sent yet
    ///
    /// [`read`](Self::read) does this on first use; calling it up front lets
    /// the caller wait for data before the first packet.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            SourceState::Opening => self.start_streaming(),
            SourceState::Streaming => Ok(()),
            SourceState::Closing | SourceState::Closed => Err(DriverError::Closed),
        }
    }

    /// Wait until a full packet of raw bytes is buffered
    ///
    /// Returns `false` on timeout or if the source is closed.
    pub fn wait_ready(&self, samples: usize, timeout: Duration) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        while stream.available() < 2 * samples {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Fill `packet` with the next samples
    ///
    /// The first call starts the stream. Overruns and short reads are logged
    /// and counted but never fail the read.
    pub fn read(&mut self, packet: &mut SamplePacket) -> Result<ReadOutcome> {
        self.start()?;

        let stream = self.stream.as_mut().ok_or(DriverError::Closed)?;

        let overrun = match stream.rx_overrun() {
            Ok(true) => {
                let at = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                warn!(
                    "GN3S overrun at {}.{:06}",
                    at.as_secs(),
                    at.subsec_micros()
                );
                self.metrics.record_overrun();
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Overrun query failed: {}", e);
                false
            }
        };

        let wanted = 2 * packet.samples.len();
        self.raw.resize(wanted, 0);
        let bytes = stream.read(&mut self.raw[..wanted]);
        if bytes < wanted {
            warn!("Short read: {} of {} bytes", bytes, wanted);
            self.metrics.record_short_read();
            self.raw[bytes..].fill(0);
        }
        trace!("Read {} bytes", bytes);

        let skew = self
            .aligner
            .align_received(&self.raw, bytes, &mut packet.samples)?;

        packet.index = self.packets;
        self.packets += 1;
        self.metrics.record_packet();

        Ok(ReadOutcome {
            bytes,
            overrun,
            skew,
        })
    }

    /// Stop streaming and release the stream; idempotent
    pub fn close(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            self.state = SourceState::Closed;
            return Ok(());
        };
        self.state = SourceState::Closing;
        let result = stream.close();
        drop(stream);
        self.state = SourceState::Closed;
        info!("Source closed after {} packets", self.packets);
        result
    }
}

impl<S: SampleStream> Drop for Source<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing source: {}", e);
        }
    }
}

impl<S: SampleStream> std::fmt::Debug for Source<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("state", &self.state)
            .field("packets", &self.packets)
            .field("alignment", &self.aligner.mode())
            .finish()
    }
}
