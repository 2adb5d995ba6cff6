//! USB event thread
//!
//! Dedicated thread that pumps `libusb_handle_events` so that transfer
//! completion callbacks run while the caller reads samples.

use crate::error::{DriverError, Result};
use rusb::UsbContext;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default time one `handle_events` call may block
pub const DEFAULT_EVENT_POLL: Duration = Duration::from_millis(100);

/// Name given to the event thread
pub const EVENT_THREAD_NAME: &str = "gn3s-usb-events";

/// Handle to the running event thread
pub struct EventWorker {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventWorker {
    /// Spawn the event loop on `context`
    ///
    /// `poll` bounds how long shutdown can take to be noticed.
    pub fn spawn<T: UsbContext + 'static>(context: T, poll: Duration) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = std::thread::Builder::new()
            .name(EVENT_THREAD_NAME.to_string())
            .spawn(move || run(context, flag, poll))
            .map_err(DriverError::Io)?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and join the thread
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("USB event thread panicked");
        }
    }
}

impl Drop for EventWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EventWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWorker")
            .field("running", &self.is_running())
            .finish()
    }
}

fn run<T: UsbContext>(context: T, running: Arc<AtomicBool>, poll: Duration) {
    info!("USB event thread started");

    while running.load(Ordering::Acquire) {
        match context.handle_events(Some(poll)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                // Transient; keep pumping so pending transfers can finish
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(poll);
            }
        }
    }

    info!("USB event thread stopped");
}
