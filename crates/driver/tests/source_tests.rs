//! Source facade tests against a simulated stream

use common::StreamMetrics;
use driver::{
    DriverError, RetryPolicy, RingBuffer, SamplePacket, SampleReader, SampleStream, Source,
    SourceState,
};
use protocol::{AlignmentMode, Cpx};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const CHUNK: [u8; 8] = [0x02, 0x03, 0x02, 0x03, 0x02, 0x03, 0x02, 0x01];

/// Simulated device: a ring fed by the test, scripted control responses
struct SimulatedStream {
    ring: Arc<RingBuffer>,
    reader: SampleReader,
    metrics: Arc<StreamMetrics>,
    /// Start commands to reject before accepting one
    start_failures: usize,
    start_attempts: Arc<AtomicUsize>,
    overrun: Arc<AtomicBool>,
    overrun_query_fails: bool,
    closed: Arc<AtomicBool>,
}

impl SimulatedStream {
    fn new() -> Self {
        let ring = Arc::new(RingBuffer::new(4, 64));
        Self {
            reader: SampleReader::new(ring.clone()),
            ring,
            metrics: Arc::new(StreamMetrics::new()),
            start_failures: 0,
            start_attempts: Arc::new(AtomicUsize::new(0)),
            overrun: Arc::new(AtomicBool::new(false)),
            overrun_query_fails: false,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl SampleStream for SimulatedStream {
    fn set_streaming(&mut self, start: bool) -> driver::Result<()> {
        if start {
            let attempt = self.start_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.start_failures {
                return Err(DriverError::Usb(rusb::Error::Pipe));
            }
        }
        Ok(())
    }

    fn rx_overrun(&mut self) -> driver::Result<bool> {
        if self.overrun_query_fails {
            return Err(DriverError::Usb(rusb::Error::Timeout));
        }
        Ok(self.overrun.swap(false, Ordering::SeqCst))
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

    fn close(&mut self) -> driver::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_micros(10),
        max_delay: Duration::from_micros(100),
        timeout: Duration::from_millis(50),
    }
}

mod streaming {
    use super::*;

    #[test]
    fn test_end_to_end_reference_chunk() {
        let stream = SimulatedStream::new();
        let ring = stream.ring.clone();
        let mut source = Source::new(stream, AlignmentMode::PerRead, fast_retry());
        let mut packet = SamplePacket::new(4);

        for expected_index in 0..5u64 {
            ring.produce(&CHUNK);
            let outcome = source.read(&mut packet).unwrap();

            assert_eq!(outcome.bytes, 8);
            assert!(!outcome.overrun);
            assert!(!outcome.skew.shifted);
            assert_eq!(packet.samples, vec![Cpx::new(1, -1); 4]);
            assert_eq!(packet.index, expected_index);
        }

        assert_eq!(source.state(), SourceState::Streaming);
        assert_eq!(source.packets(), 5);
        assert_eq!(source.metrics().packets_delivered(), 5);
    }

    #[test]
    fn test_first_read_sends_start_once() {
        let stream = SimulatedStream::new();
        let attempts = stream.start_attempts.clone();
        let ring = stream.ring.clone();
        let mut source = Source::new(stream, AlignmentMode::PerRead, fast_retry());
        let mut packet = SamplePacket::new(4);

        assert_eq!(source.state(), SourceState::Opening);
        for _ in 0..3 {
            ring.produce(&CHUNK);
            source.read(&mut packet).unwrap();
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(source.metrics().uptime().is_some());
    }

    #[test]
    fn test_overrun_does_not_block() {
        let stream = SimulatedStream::new();
        let overrun = stream.overrun.clone();
        let ring = stream.ring.clone();
        let mut source = Source::new(stream, AlignmentMode::PerRead, fast_retry());
        let mut packet = SamplePacket::new(4);

        overrun.store(true, Ordering::SeqCst);
        ring.produce(&CHUNK);
        let outcome = source.read(&mut packet).unwrap();

        assert!(outcome.overrun);
        assert_eq!(packet.samples, vec![Cpx::new(1, -1); 4]);
        assert_eq!(source.metrics().snapshot().overruns, 1);

        // Flag was cleared by the query
        ring.produce(&CHUNK);
        assert!(!source.read(&mut packet).unwrap().overrun);
    }

    #[test]
    fn test_failed_overrun_query_is_not_fatal() {
        let mut stream = SimulatedStream::new();
        stream.overrun_query_fails = true;
        let ring = stream.ring.clone();
        let mut source = Source::new(stream, AlignmentMode::PerRead, fast_retry());
        let mut packet = SamplePacket::new(4);

        ring.produce(&CHUNK);
        let outcome = source.read(&mut packet).unwrap();
        assert!(!outcome.overrun);
        assert_eq!(source.metrics().snapshot().overruns, 0);
    }

    #[test]
    fn test_short_read_is_zero_padded() {
        let stream = SimulatedStream::new();
        let ring = stream.ring.clone();
        let mut source = Source::new(stream, AlignmentMode::PerRead, fast_retry());
        let mut packet = SamplePacket::new(4);

        ring.produce(&CHUNK[..5]);
        let outcome = source.read(&mut packet).unwrap();

        assert_eq!(outcome.bytes, 5);
        // Bytes 5..8 are zero: they decode as +1
        assert_eq!(
            packet.samples,
            vec![Cpx::new(1, -1), Cpx::new(1, -1), Cpx::new(1, 1), Cpx::new(1, 1)]
        );
        assert_eq!(source.metrics().snapshot().short_reads, 1);
    }

    #[test]
    fn test_empty_read_still_returns() {
        let stream = SimulatedStream::new();
        let mut source = Source::new(stream, AlignmentMode::PerRead, fast_retry());
        let mut packet = SamplePacket::new(4);

        let outcome = source.read(&mut packet).unwrap();
        assert_eq!(outcome.bytes, 0);
        // An all-zero chunk is skewed: the last value has no source byte
        assert!(outcome.skew.shifted);
        assert_eq!(packet.index, 0);
    }

    #[test]
    fn test_wait_ready() {
        let stream = SimulatedStream::new();
        let ring = stream.ring.clone();
        let source = Source::new(stream, AlignmentMode::PerRead, fast_retry());

        assert!(!source.wait_ready(4, Duration::from_millis(5)));
        ring.produce(&CHUNK);
        assert!(source.wait_ready(4, Duration::from_millis(5)));
    }
}

mod start_retry {
    use super::*;

    #[test]
    fn test_start_succeeds_after_retries() {
        let mut stream = SimulatedStream::new();
        stream.start_failures = 3;
        let attempts = stream.start_attempts.clone();
        let ring = stream.ring.clone();
        let mut source = Source::new(stream, AlignmentMode::PerRead, fast_retry());
        let mut packet = SamplePacket::new(4);

        ring.produce(&CHUNK);
        source.read(&mut packet).unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(source.state(), SourceState::Streaming);
    }

    #[test]
    fn test_start_times_out() {
        let mut stream = SimulatedStream::new();
        stream.start_failures = usize::MAX;
        let mut source = Source::new(stream, AlignmentMode::PerRead, fast_retry());
        let mut packet = SamplePacket::new(4);

        match source.read(&mut packet) {
            Err(DriverError::StreamStartTimeout {
                attempts, elapsed, ..
            }) => {
                assert!(attempts > 1);
                assert!(elapsed >= Duration::from_millis(50));
            }
            other => panic!("expected start timeout, got {:?}", other),
        }
        assert_eq!(source.state(), SourceState::Opening);
        assert_eq!(source.packets(), 0);
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_read_after_close_fails() {
        let stream = SimulatedStream::new();
        let closed = stream.closed.clone();
        let mut source = Source::new(stream, AlignmentMode::PerRead, fast_retry());

        source.close().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(source.state(), SourceState::Closed);

        let mut packet = SamplePacket::new(4);
        assert!(matches!(source.read(&mut packet), Err(DriverError::Closed)));

        // Idempotent
        source.close().unwrap();
    }

    #[test]
    fn test_drop_closes_stream() {
        let stream = SimulatedStream::new();
        let closed = stream.closed.clone();
        {
            let _source = Source::new(stream, AlignmentMode::Latched, fast_retry());
        }
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_latched_alignment_through_source() {
        let stream = SimulatedStream::new();
        let ring = stream.ring.clone();
        let mut source = Source::new(stream, AlignmentMode::Latched, fast_retry());
        let mut packet = SamplePacket::new(4);

        ring.produce(&CHUNK);
        assert!(!source.read(&mut packet).unwrap().skew.shifted);

        // A later chunk that looks skewed is decoded with the latched phase
        ring.produce(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01]);
        let outcome = source.read(&mut packet).unwrap();
        assert!(!outcome.skew.shifted);
        assert_eq!(packet.samples, vec![Cpx::new(1, -1); 4]);
    }

    #[test]
    fn test_latched_alignment_waits_for_device_bytes() {
        let stream = SimulatedStream::new();
        let ring = stream.ring.clone();
        let mut source = Source::new(stream, AlignmentMode::Latched, fast_retry());
        let mut packet = SamplePacket::new(4);

        // Streaming just started and nothing has arrived yet
        let outcome = source.read(&mut packet).unwrap();
        assert_eq!(outcome.bytes, 0);

        ring.produce(&CHUNK);
        let outcome = source.read(&mut packet).unwrap();
        assert_eq!(outcome.bytes, 8);
        assert!(!outcome.skew.shifted);
        assert_eq!(packet.samples, vec![Cpx::new(1, -1); 4]);

        ring.produce(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01]);
        let outcome = source.read(&mut packet).unwrap();
        assert!(!outcome.skew.shifted);
        assert_eq!(packet.samples, vec![Cpx::new(1, -1); 4]);
    }
}
