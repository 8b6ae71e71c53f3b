//! Events registered with the reactor.

use std::fmt;
use std::io;

use crate::types::{Channel, EventFlags, Interest};

/// Interest in one channel, plus what to do when it becomes ready.
///
/// `handle` runs on the executor, never on the reactor thread. `abort` runs
/// when the event can no longer fire: its handler panicked, the reactor shut
/// down, or registration failed. `abort` must release whatever the handler
/// would have released (usually by closing the channel).
pub trait AsyncEvent: Send + Sync {
    /// The channel this event waits on.
    fn channel(&self) -> Channel;

    /// Readiness the event waits for.
    fn interest(&self) -> Interest;

    /// One-shot by default.
    fn flags(&self) -> EventFlags {
        EventFlags::ONE_SHOT
    }

    /// Called once the channel is ready.
    fn handle(&self);

    /// Called when the event will never fire.
    fn abort(&self, error: io::Error);
}

type ReadyFn = Box<dyn Fn() + Send + Sync>;
type AbortFn = Box<dyn Fn(io::Error) + Send + Sync>;

/// An [`AsyncEvent`] built from closures.
pub struct CallbackEvent {
    channel: Channel,
    interest: Interest,
    flags: EventFlags,
    on_ready: ReadyFn,
    on_abort: Option<AbortFn>,
}

impl CallbackEvent {
    pub fn new(
        channel: Channel,
        interest: Interest,
        on_ready: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel,
            interest,
            flags: EventFlags::ONE_SHOT,
            on_ready: Box::new(on_ready),
            on_abort: None,
        }
    }

    /// Replace the event flags.
    pub fn with_flags(mut self, flags: EventFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the abort callback.
    pub fn on_abort(mut self, on_abort: impl Fn(io::Error) + Send + Sync + 'static) -> Self {
        self.on_abort = Some(Box::new(on_abort));
        self
    }
}

impl AsyncEvent for CallbackEvent {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn interest(&self) -> Interest {
        self.interest
    }

    fn flags(&self) -> EventFlags {
        self.flags
    }

    fn handle(&self) {
        (self.on_ready)();
    }

    fn abort(&self, error: io::Error) {
        if let Some(on_abort) = &self.on_abort {
            on_abort(error);
        }
    }
}

impl fmt::Debug for CallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackEvent")
            .field("channel", &self.channel)
            .field("interest", &self.interest)
            .field("flags", &self.flags)
            .finish()
    }
}
