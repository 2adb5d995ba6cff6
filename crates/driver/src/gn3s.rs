//! GN3S device handle
//!
//! Owns every USB resource of a streaming session: the libusb context, the
//! configured device, the event thread and the transfer pool, plus the
//! reader side of the sample ring.

use crate::error::{DriverError, Result};
use crate::firmware::{DEFAULT_FIRMWARE_PATH, flash_unprogrammed};
use crate::ring::{RingBuffer, SampleReader};
use crate::source::{RetryPolicy, SampleStream, Source};
use crate::usb::control::{check_rx_overrun, set_streaming};
use crate::usb::device::{DeviceSelection, DeviceSession, find_device};
use crate::usb::pipeline::{PoolConfig, TransferPool};
use crate::usb::worker::{DEFAULT_EVENT_POLL, EventWorker};
use common::StreamMetrics;
use protocol::{
    AlignmentMode, BULK_PACKET_SIZE, DEFAULT_BLOCK_SIZE, DEFAULT_TRANSFER_TIMEOUT_MS,
    DEFAULT_TRANSFERS, GN3S_ID, RX_ENDPOINT,
};
use rusb::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Fewest concurrent transfers accepted; one slot cannot show a full completion
pub const MIN_TRANSFERS: usize = 2;

/// Largest number of concurrent transfers accepted
pub const MAX_TRANSFERS: usize = 64;

/// Streaming geometry and timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Concurrent bulk transfers (ring slots)
    pub transfers: usize,
    /// Bytes per transfer (ring slot length)
    pub block_size: usize,
    pub transfer_timeout: Duration,
    pub resubmit_on_error: bool,
    /// Pause between cancelling transfers and releasing them
    pub cancel_grace: Duration,
    pub event_poll: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            transfers: DEFAULT_TRANSFERS,
            block_size: DEFAULT_BLOCK_SIZE,
            transfer_timeout: Duration::from_millis(DEFAULT_TRANSFER_TIMEOUT_MS),
            resubmit_on_error: true,
            cancel_grace: Duration::from_millis(1),
            event_poll: DEFAULT_EVENT_POLL,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_TRANSFERS..=MAX_TRANSFERS).contains(&self.transfers) {
            return Err(DriverError::InvalidConfig(format!(
                "transfers must be between {} and {}, got {}",
                MIN_TRANSFERS, MAX_TRANSFERS, self.transfers
            )));
        }
        if self.block_size == 0
            || self.block_size % BULK_PACKET_SIZE != 0
            || self.block_size > DEFAULT_BLOCK_SIZE
        {
            return Err(DriverError::InvalidConfig(format!(
                "block_size must be a non-zero multiple of {} up to {}, got {}",
                BULK_PACKET_SIZE, DEFAULT_BLOCK_SIZE, self.block_size
            )));
        }
        if self.event_poll.is_zero() {
            return Err(DriverError::InvalidConfig(
                "event_poll must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Ring capacity in bytes
    pub fn capacity(&self) -> usize {
        self.transfers * self.block_size
    }
}

/// Everything needed to open a GN3S
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOptions {
    pub selection: DeviceSelection,
    /// Intel-HEX image used when only an unprogrammed device is present
    pub firmware_path: PathBuf,
    /// Wait for re-enumeration after flashing
    pub flash_settle: Duration,
    pub stream: StreamConfig,
    pub alignment: AlignmentMode,
    pub retry: RetryPolicy,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            selection: DeviceSelection::default(),
            firmware_path: PathBuf::from(DEFAULT_FIRMWARE_PATH),
            flash_settle: Duration::from_secs(2),
            stream: StreamConfig::default(),
            alignment: AlignmentMode::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// An open, streaming GN3S
pub struct Gn3s {
    session: Option<DeviceSession>,
    worker: Option<EventWorker>,
    pool: Option<TransferPool>,
    reader: SampleReader,
    metrics: Arc<StreamMetrics>,
    cancel_grace: Duration,
    _context: Context,
}

impl Gn3s {
    /// Find (flashing if needed), configure and start a GN3S
    ///
    /// Every bulk transfer is in flight when this returns; the start command
    /// is sent separately through [`SampleStream::set_streaming`].
    pub fn open(options: &OpenOptions) -> Result<Self> {
        options.stream.validate()?;

        let context = Context::new()?;

        let device = match find_device(&context, GN3S_ID, options.selection)? {
            Some(device) => {
                info!("Found GN3S device");
                device
            }
            None => {
                info!("No GN3S found, looking for an unprogrammed device");
                flash_unprogrammed(&context, &options.firmware_path, options.selection)?;
                std::thread::sleep(options.flash_settle);
                find_device(&context, GN3S_ID, options.selection)?
                    .ok_or(DriverError::DeviceNotFound { id: GN3S_ID })?
            }
        };

        let session = DeviceSession::configure(&device)?;

        let stream = options.stream;
        let ring = Arc::new(RingBuffer::new(stream.transfers, stream.block_size));
        let metrics = Arc::new(StreamMetrics::new());

        let worker = EventWorker::spawn(context.clone(), stream.event_poll)?;
        let pool = TransferPool::new(
            session.handle().clone(),
            ring.clone(),
            metrics.clone(),
            PoolConfig {
                endpoint: RX_ENDPOINT,
                timeout: stream.transfer_timeout,
                resubmit_on_error: stream.resubmit_on_error,
            },
        )?;

        let mut gn3s = Self {
            session: Some(session),
            worker: Some(worker),
            pool: Some(pool),
            reader: SampleReader::new(ring),
            metrics,
            cancel_grace: stream.cancel_grace,
            _context: context,
        };

        // On failure, Drop cancels whatever was already submitted
        if let Some(pool) = gn3s.pool.as_mut() {
            pool.start()?;
        }

        info!(
            "Transfers started: {} x {} bytes",
            stream.transfers, stream.block_size
        );
        Ok(gn3s)
    }

    pub fn reader(&self) -> &SampleReader {
        &self.reader
    }

    /// Stop the device and tear everything down in order; idempotent
    fn shutdown(&mut self) {
        if let Some(session) = &self.session {
            if let Err(e) = set_streaming(&**session.handle(), false) {
                warn!("Failed to stop streaming: {}", e);
            }
        }

        if let Some(pool) = &self.pool {
            if let Err(e) = pool.cancel() {
                warn!("{}", e);
            }
            std::thread::sleep(self.cancel_grace);
        }

        // Pool before worker: cancelled transfers complete on the event thread
        self.pool = None;

        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }

        if let Some(mut session) = self.session.take() {
            session.close();
            info!("GN3S closed");
        }
    }

    fn session(&self) -> Result<&DeviceSession> {
        self.session.as_ref().ok_or(DriverError::Closed)
    }
}

impl SampleStream for Gn3s {
    fn set_streaming(&mut self, start: bool) -> Result<()> {
        set_streaming(&**self.session()?.handle(), start)
    }

    fn rx_overrun(&mut self) -> Result<bool> {
        check_rx_overrun(&**self.session()?.handle())
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.reader.read(buf)
    }

    fn available(&self) -> usize {
        self.reader.available()
    }

    fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    fn close(&mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for Gn3s {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Gn3s {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gn3s")
            .field("session", &self.session)
            .field("pool", &self.pool)
            .field("reader", &self.reader)
            .finish()
    }
}

impl Source<Gn3s> {
    /// Open a GN3S and wrap it in a sample source
    pub fn open(options: &OpenOptions) -> Result<Self> {
        let gn3s = Gn3s::open(options)?;
        Ok(Source::new(gn3s, options.alignment, options.retry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.transfers, 16);
        assert_eq!(config.block_size, 16384);
        assert_eq!(config.capacity(), 16 * 16384);
        assert!(config.resubmit_on_error);
    }

    #[test]
    fn test_config_validation() {
        let bad = [
            StreamConfig {
                transfers: 0,
                ..Default::default()
            },
            StreamConfig {
                transfers: 1,
                ..Default::default()
            },
            StreamConfig {
                transfers: MAX_TRANSFERS + 1,
                ..Default::default()
            },
            StreamConfig {
                block_size: 0,
                ..Default::default()
            },
            StreamConfig {
                block_size: 1000,
                ..Default::default()
            },
            StreamConfig {
                block_size: 2 * DEFAULT_BLOCK_SIZE,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(DriverError::InvalidConfig(_))),
                "{:?}",
                config
            );
        }

        StreamConfig {
            transfers: MIN_TRANSFERS,
            block_size: 512,
            ..Default::default()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn test_open_options_defaults() {
        let options = OpenOptions::default();
        assert_eq!(options.selection, DeviceSelection::Last);
        assert_eq!(options.firmware_path, PathBuf::from("gn3s_firmware.ihx"));
        assert_eq!(options.flash_settle, Duration::from_secs(2));
        assert_eq!(options.alignment, AlignmentMode::PerRead);
    }
}
