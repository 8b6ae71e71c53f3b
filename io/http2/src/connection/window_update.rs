//! Receive-side window accounting.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Tracks bytes the application has consumed on one window (a stream, or
/// the whole connection) and decides when to hand credit back to the peer.
///
/// Credit is returned in batches once the unacknowledged total reaches half
/// the window, so small reads do not each cost a WINDOW_UPDATE frame.
#[derive(Debug)]
pub struct WindowUpdateSender {
    threshold: u32,
    pending: AtomicU32,
    closed: AtomicBool,
}

impl WindowUpdateSender {
    pub fn new(window: u32) -> Self {
        Self {
            threshold: (window / 2).max(1),
            pending: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Record `n` consumed bytes. Returns the increment to send when the
    /// threshold is crossed; the pending total restarts from zero.
    pub fn consumed(&self, n: u32) -> Option<u32> {
        if n == 0 || self.closed.load(Ordering::Acquire) {
            return None;
        }
        let threshold = self.threshold;
        let mut increment = None;
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                let total = pending.saturating_add(n);
                if total >= threshold {
                    increment = Some(total);
                    Some(0)
                } else {
                    increment = None;
                    Some(total)
                }
            });
        increment
    }

    /// Suppress further updates (stream closed or connection shut down).
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
