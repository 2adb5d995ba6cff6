//! Streaming metrics for the sample pipeline
//!
//! Counters are plain atomics so that transfer completion callbacks can
//! update them without locking or allocating. Only the start timestamp sits
//! behind a lock, and it is touched from the owning thread alone.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared between the transfer pool, the reader and the source
#[derive(Debug)]
pub struct StreamMetrics {
    /// Bytes published into the ring buffer
    bytes_received: AtomicU64,
    /// Bulk transfers completed successfully
    transfers_completed: AtomicU64,
    /// Bulk transfers completed with an error status
    transfers_failed: AtomicU64,
    /// Failed transfers that were resubmitted
    resubmissions: AtomicU64,
    /// Slots permanently removed from the pool
    slots_retired: AtomicU64,
    /// Overrun flags reported by the device
    overruns: AtomicU64,
    /// Reads that returned fewer bytes than requested
    short_reads: AtomicU64,
    /// Sample packets handed to the caller
    packets_delivered: AtomicU64,
    /// Time streaming started
    started_at: RwLock<Option<Instant>>,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            bytes_received: AtomicU64::new(0),
            transfers_completed: AtomicU64::new(0),
            transfers_failed: AtomicU64::new(0),
            resubmissions: AtomicU64::new(0),
            slots_retired: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            short_reads: AtomicU64::new(0),
            packets_delivered: AtomicU64::new(0),
            started_at: RwLock::new(None),
        }
    }

    /// Mark the start of streaming
    pub fn mark_started(&self) {
        if let Ok(mut started_at) = self.started_at.write() {
            *started_at = Some(Instant::now());
        }
    }

    /// Time since streaming started
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at
            .read()
            .ok()
            .and_then(|started_at| started_at.map(|t| t.elapsed()))
    }

    #[inline]
    pub fn transfer_completed(&self, bytes: u64) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a failed transfer; partial data it carried still counts
    #[inline]
    pub fn transfer_failed(&self, bytes: u64) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_resubmission(&self) {
        self.resubmissions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_slot_retired(&self) {
        self.slots_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet(&self) {
        self.packets_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn slots_retired(&self) -> u64 {
        self.slots_retired.load(Ordering::Relaxed)
    }

    pub fn packets_delivered(&self) -> u64 {
        self.packets_delivered.load(Ordering::Relaxed)
    }

    /// Average receive rate since streaming started, in bytes per second
    pub fn throughput_bps(&self) -> f64 {
        match self.uptime() {
            Some(uptime) if !uptime.is_zero() => {
                self.total_bytes_received() as f64 / uptime.as_secs_f64()
            }
            _ => 0.0,
        }
    }

    /// Capture the current counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            resubmissions: self.resubmissions.load(Ordering::Relaxed),
            slots_retired: self.slots_retired.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            packets_delivered: self.packets_delivered.load(Ordering::Relaxed),
            uptime: self.uptime(),
            throughput_bps: self.throughput_bps(),
        }
    }
}

/// Snapshot of metrics for display
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub bytes_received: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub resubmissions: u64,
    pub slots_retired: u64,
    pub overruns: u64,
    pub short_reads: u64,
    pub packets_delivered: u64,
    pub uptime: Option<Duration>,
    pub throughput_bps: f64,
}

impl MetricsSnapshot {
    /// Format throughput as human-readable string
    pub fn format_throughput(&self) -> String {
        format_bytes_per_sec(self.throughput_bps)
    }
}

/// Format bytes per second as human-readable string
pub fn format_bytes_per_sec(bps: f64) -> String {
    if bps >= 1_000_000_000.0 {
        format!("{:.2} GB/s", bps / 1_000_000_000.0)
    } else if bps >= 1_000_000.0 {
        format!("{:.2} MB/s", bps / 1_000_000.0)
    } else if bps >= 1_000.0 {
        format!("{:.2} KB/s", bps / 1_000.0)
    } else {
        format!("{:.0} B/s", bps)
    }
}
