//! Sample ring buffer shared by the transfer pool and the reader
//!
//! The buffer is partitioned into `slots` equal regions, one per outstanding
//! bulk transfer. Transfers fill their region in place and then publish the
//! number of bytes they carried by advancing the write cursor. The reader
//! owns the read cursor and copies out whatever has been published.
//!
//! ```text
//!  slot 0      slot 1      slot 2            slot T-1
//! [..........][..........][..........] ... [..........]
//!        ^ read cursor              ^ write cursor
//! ```
//!
//! # Invariants
//! - Both cursors are in `0..capacity`.
//! - The write cursor is only moved by the producer and the read cursor only
//!   by the single [`SampleReader`].
//! - Equal cursors mean "empty". A producer lapping the reader is an overrun;
//!   it is reported by the device, never inferred from the cursors.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-capacity byte ring written by bulk transfers
pub struct RingBuffer {
    storage: Box<[UnsafeCell<u8>]>,
    slot_len: usize,
    slots: usize,
    write_cursor: AtomicUsize,
}

// SAFETY: bytes are only written by the producer inside regions the reader
// has already consumed, and only read by the consumer below the published
// write cursor. The cursor is published with Release and observed with
// Acquire, ordering the byte accesses.
unsafe impl Sync for RingBuffer {}
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Create a ring of `slots` regions of `slot_len` bytes each
    ///
    /// # Panics
    /// Panics with fewer than two slots or a zero slot length. A full-slot
    /// completion on a one-slot ring would wrap the write cursor onto the
    /// read cursor and read as empty.
    pub fn new(slots: usize, slot_len: usize) -> Self {
        assert!(slots >= 2, "RingBuffer needs at least two slots");
        assert!(slot_len > 0, "RingBuffer slot length must be > 0");

        let storage = (0..slots * slot_len)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            storage,
            slot_len,
            slots,
            write_cursor: AtomicUsize::new(0),
        }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn slot_count(&self) -> usize {
        self.slots
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Current write cursor (bytes published, modulo capacity)
    pub fn write_cursor(&self) -> usize {
        self.write_cursor.load(Ordering::Acquire)
    }

    /// Raw pointer to the start of slot `index`, for handing to libusb
    ///
    /// The region `[ptr, ptr + slot_len)` belongs to that slot's transfer.
    pub(crate) fn slot_ptr(&self, index: usize) -> *mut u8 {
        assert!(index < self.slots, "slot {} out of range", index);
        // SAFETY: index * slot_len is within the allocation
        unsafe { UnsafeCell::raw_get(self.storage.as_ptr().add(index * self.slot_len)) }
    }

    /// Publish `len` bytes written at the write cursor
    ///
    /// Called once per completed transfer. `len` is clamped to one slot.
    pub fn publish(&self, len: usize) {
        let len = len.min(self.slot_len);
        if len == 0 {
            return;
        }
        let capacity = self.capacity();
        // Single producer: completions all run on the event thread
        let current = self.write_cursor.load(Ordering::Relaxed);
        self.write_cursor
            .store((current + len) % capacity, Ordering::Release);
    }

    /// Copy `data` in at the write cursor, wrapping, and publish it
    ///
    /// Used by software producers; bulk transfers write their slot directly.
    /// The producer must not run more than one lap ahead of the reader.
    pub fn produce(&self, data: &[u8]) {
        let capacity = self.capacity();
        let mut offset = self.write_cursor.load(Ordering::Relaxed);

        for chunk in data.chunks(capacity) {
            let first = chunk.len().min(capacity - offset);
            // SAFETY: both copies stay inside the storage allocation and the
            // bytes are not yet published to the reader
            unsafe {
                let base = UnsafeCell::raw_get(self.storage.as_ptr());
                std::ptr::copy_nonoverlapping(chunk.as_ptr(), base.add(offset), first);
                std::ptr::copy_nonoverlapping(
                    chunk.as_ptr().add(first),
                    base,
                    chunk.len() - first,
                );
            }
            offset = (offset + chunk.len()) % capacity;
        }

        self.write_cursor.store(offset, Ordering::Release);
    }

    /// Copy `out.len()` bytes starting at `offset`, wrapping at capacity
    fn copy_out(&self, offset: usize, out: &mut [u8]) {
        let capacity = self.capacity();
        let first = out.len().min(capacity - offset);
        // SAFETY: ranges are inside the allocation and below the published
        // write cursor
        unsafe {
            let base = UnsafeCell::raw_get(self.storage.as_ptr()) as *const u8;
            std::ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), out.len() - first);
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("slots", &self.slots)
            .field("slot_len", &self.slot_len)
            .field("write_cursor", &self.write_cursor())
            .finish()
    }
}

/// Consumer side of a [`RingBuffer`]
///
/// There is exactly one reader per ring; `read` takes `&mut self`, so a
/// second concurrent caller cannot exist.
#[derive(Debug)]
pub struct SampleReader {
    ring: Arc<RingBuffer>,
    read_cursor: usize,
    total_read: u64,
}

impl SampleReader {
    pub fn new(ring: Arc<RingBuffer>) -> Self {
        let read_cursor = ring.write_cursor();
        Self {
            ring,
            read_cursor,
            total_read: 0,
        }
    }

    /// Current read cursor
    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    /// Total bytes handed out since creation
    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    /// Bytes published but not yet read
    pub fn available(&self) -> usize {
        let write = self.ring.write_cursor();
        if write >= self.read_cursor {
            write - self.read_cursor
        } else {
            write + self.ring.capacity() - self.read_cursor
        }
    }

    /// Copy up to `buf.len()` available bytes into `buf`
    ///
    /// Never blocks: returns fewer bytes than requested (possibly zero) when
    /// the producer has not published enough yet.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.available().min(buf.len());
        if n == 0 {
            return 0;
        }
        self.ring.copy_out(self.read_cursor, &mut buf[..n]);
        self.read_cursor = (self.read_cursor + n) % self.ring.capacity();
        self.total_read += n as u64;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let ring = RingBuffer::new(4, 8);
        assert_eq!(ring.capacity(), 32);
        assert_eq!(ring.slot_count(), 4);
        assert_eq!(ring.slot_len(), 8);
        assert_eq!(ring.write_cursor(), 0);
    }

    #[test]
    #[should_panic]
    fn test_zero_slots_panics() {
        let _ = RingBuffer::new(0, 8);
    }

    #[test]
    #[should_panic(expected = "at least two slots")]
    fn test_single_slot_panics() {
        let _ = RingBuffer::new(1, 512);
    }

    #[test]
    fn test_full_slot_completions_stay_visible() {
        let ring = Arc::new(RingBuffer::new(2, 512));
        let mut reader = SampleReader::new(ring.clone());

        ring.publish(512);
        assert_eq!(ring.write_cursor(), 512);
        assert_eq!(reader.available(), 512);

        let mut buf = [0u8; 512];
        assert_eq!(reader.read(&mut buf), 512);
        ring.publish(512);
        assert_eq!(ring.write_cursor(), 0);
        assert_eq!(reader.available(), 512);
    }

    #[test]
    fn test_empty_read() {
        let ring = Arc::new(RingBuffer::new(2, 4));
        let mut reader = SampleReader::new(ring);
        let mut buf = [0u8; 4];
        assert_eq!(reader.available(), 0);
        assert_eq!(reader.read(&mut buf), 0);
    }

    #[test]
    fn test_publish_slot_in_place() {
        let ring = Arc::new(RingBuffer::new(3, 4));
        let mut reader = SampleReader::new(ring.clone());

        // Simulate a transfer filling slot 1 after slot 0
        for (index, fill) in [(0usize, 0xAAu8), (1, 0xBB)] {
            unsafe { std::ptr::write_bytes(ring.slot_ptr(index), fill, 4) };
            ring.publish(4);
        }

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), 8);
        assert_eq!(buf, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB]);
        assert_eq!(ring.write_cursor(), 8);
    }

    #[test]
    fn test_publish_clamps_to_slot() {
        let ring = RingBuffer::new(4, 4);
        ring.publish(100);
        assert_eq!(ring.write_cursor(), 4);
        ring.publish(0);
        assert_eq!(ring.write_cursor(), 4);
    }

    #[test]
    fn test_wraparound_read() {
        let ring = Arc::new(RingBuffer::new(2, 4));
        let mut reader = SampleReader::new(ring.clone());
        let mut buf = [0u8; 8];

        ring.produce(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(reader.read(&mut buf[..6]), 6);

        ring.produce(&[7, 8, 9, 10, 11]);
        assert_eq!(ring.write_cursor(), 3);
        assert_eq!(reader.available(), 5);
        assert_eq!(reader.read(&mut buf), 5);
        assert_eq!(&buf[..5], &[7, 8, 9, 10, 11]);
        assert_eq!(reader.read_cursor(), 3);
        assert_eq!(reader.total_read(), 11);
    }

    #[test]
    fn test_partial_read_leaves_remainder() {
        let ring = Arc::new(RingBuffer::new(2, 8));
        let mut reader = SampleReader::new(ring.clone());
        ring.produce(&[9; 10]);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), 4);
        assert_eq!(reader.available(), 6);
        assert_eq!(reader.read(&mut buf), 4);
        assert_eq!(reader.available(), 2);
        assert_eq!(reader.total_read(), 8);
    }
}
