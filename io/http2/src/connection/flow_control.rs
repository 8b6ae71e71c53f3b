//! Send-side HTTP/2 flow control.
//!
//! One connection window plus one window per client stream. Senders block in
//! [`FlowController::try_acquire`] until both windows have credit; WINDOW_UPDATE
//! and SETTINGS handling on the reader side release them.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

/// Why an acquire could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("stream closed")]
    StreamClosed,
    #[error("connection closed")]
    ConnectionClosed,
}

#[derive(Debug)]
struct FlowState {
    connection: i32,
    streams: HashMap<u32, i32>,
    closed: bool,
}

/// Credit accounting for outbound DATA.
///
/// Windows are signed: a SETTINGS frame lowering the initial window size can
/// push an active stream below zero, and it stays blocked until enough
/// WINDOW_UPDATE credit arrives.
#[derive(Debug)]
pub struct FlowController {
    state: Mutex<FlowState>,
    available: Condvar,
}

impl FlowController {
    pub fn new(connection_window: u32) -> Self {
        Self {
            state: Mutex::new(FlowState {
                connection: clamp_window(connection_window),
                streams: HashMap::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Start tracking a stream. Must happen before any DATA is sent on it.
    pub fn register_stream(&self, stream_id: u32, initial_window: u32) {
        self.state
            .lock()
            .streams
            .insert(stream_id, clamp_window(initial_window));
    }

    /// Stop tracking a stream. A thread blocked on it wakes with
    /// [`FlowError::StreamClosed`]. Removing twice is a no-op.
    pub fn remove_stream(&self, stream_id: u32) {
        let removed = self.state.lock().streams.remove(&stream_id).is_some();
        if removed {
            self.available.notify_all();
        }
    }

    /// Block until some credit is available for `stream_id`, then take up to
    /// `amount` bytes of it from both windows. Returns the grant.
    pub fn try_acquire(&self, amount: u32, stream_id: u32) -> Result<u32, FlowError> {
        if amount == 0 {
            return Ok(0);
        }
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(FlowError::ConnectionClosed);
            }
            let stream = match state.streams.get(&stream_id) {
                Some(window) => *window,
                None => return Err(FlowError::StreamClosed),
            };
            let grant = (amount as i64)
                .min(stream as i64)
                .min(state.connection as i64);
            if grant > 0 {
                let grant = grant as i32;
                state.connection -= grant;
                if let Some(window) = state.streams.get_mut(&stream_id) {
                    *window -= grant;
                }
                return Ok(grant as u32);
            }
            self.available.wait(&mut state);
        }
    }

    /// Apply a connection-level WINDOW_UPDATE. Returns `false` if the window
    /// would exceed 2^31-1.
    pub fn increase_connection_window(&self, increment: u32) -> bool {
        let mut state = self.state.lock();
        match checked_increase(state.connection, increment) {
            Some(window) => {
                state.connection = window;
                drop(state);
                self.available.notify_all();
                true
            }
            None => false,
        }
    }

    /// Apply a stream-level WINDOW_UPDATE. Returns `false` if the window
    /// would exceed 2^31-1. Unknown streams are ignored.
    pub fn increase_stream_window(&self, stream_id: u32, increment: u32) -> bool {
        let mut state = self.state.lock();
        let Some(window) = state.streams.get_mut(&stream_id) else {
            return true;
        };
        match checked_increase(*window, increment) {
            Some(updated) => {
                *window = updated;
                drop(state);
                self.available.notify_all();
                true
            }
            None => false,
        }
    }

    /// Shift every stream window by the change in the peer's initial window
    /// size. Returns `false` if any window would overflow.
    pub fn adjust_active_streams(&self, delta: i64) -> bool {
        let mut state = self.state.lock();
        let mut ok = true;
        for window in state.streams.values_mut() {
            let adjusted = *window as i64 + delta;
            if adjusted > i32::MAX as i64 {
                ok = false;
            } else {
                *window = adjusted.max(i32::MIN as i64) as i32;
            }
        }
        drop(state);
        self.available.notify_all();
        ok
    }

    /// Fail every current and future acquire.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn connection_window(&self) -> i32 {
        self.state.lock().connection
    }

    pub fn stream_window(&self, stream_id: u32) -> Option<i32> {
        self.state.lock().streams.get(&stream_id).copied()
    }
}

fn clamp_window(window: u32) -> i32 {
    window.min(i32::MAX as u32) as i32
}

fn checked_increase(window: i32, increment: u32) -> Option<i32> {
    let updated = window as i64 + increment as i64;
    if updated > i32::MAX as i64 {
        None
    } else {
        Some(updated as i32)
    }
}
