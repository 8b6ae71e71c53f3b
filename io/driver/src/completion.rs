//! One-shot completion cell shared between a producer and a blocked waiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A value delivered once, waited for by whoever holds a clone.
///
/// The first `complete` wins; later calls are ignored and report `false`.
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

enum Slot<T> {
    Pending,
    Ready(T),
    Taken,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    /// A completion that already holds `value`.
    pub fn completed(value: T) -> Self {
        let completion = Self::new();
        completion.complete(value);
        completion
    }

    /// Deliver the value. Returns `false` if a value was already delivered.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.inner.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Ready(value);
        self.inner.ready.notify_all();
        true
    }

    /// True once a value has been delivered (taken or not).
    pub fn is_complete(&self) -> bool {
        !matches!(*self.inner.slot.lock(), Slot::Pending)
    }

    /// Take the value without blocking.
    pub fn try_take(&self) -> Option<T> {
        let mut slot = self.inner.slot.lock();
        take_ready(&mut slot)
    }

    /// Block until the value is delivered and take it.
    ///
    /// Returns `None` if another waiter already took it.
    pub fn wait(&self) -> Option<T> {
        let mut slot = self.inner.slot.lock();
        while matches!(*slot, Slot::Pending) {
            self.inner.ready.wait(&mut slot);
        }
        take_ready(&mut slot)
    }

    /// Block for at most `timeout`. `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        while matches!(*slot, Slot::Pending) {
            if self.inner.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        take_ready(&mut slot)
    }
}

fn take_ready<T>(slot: &mut Slot<T>) -> Option<T> {
    match std::mem::replace(slot, Slot::Taken) {
        Slot::Ready(value) => Some(value),
        Slot::Pending => {
            *slot = Slot::Pending;
            None
        }
        Slot::Taken => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_complete_wins() {
        let c = Completion::new();
        assert!(c.complete(1));
        assert!(!c.complete(2));
        assert_eq!(c.wait(), Some(1));
        assert_eq!(c.try_take(), None);
    }

    #[test]
    fn test_wait_across_threads() {
        let c = Completion::new();
        let producer = c.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete("done");
        });
        assert_eq!(c.wait(), Some("done"));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let c: Completion<()> = Completion::new();
        assert!(c.wait_timeout(Duration::from_millis(10)).is_none());
        assert!(!c.is_complete());
        assert!(c.complete(()));
        assert_eq!(c.wait_timeout(Duration::from_millis(10)), Some(()));
    }

    #[test]
    fn test_completed() {
        let c = Completion::completed(7u8);
        assert!(c.is_complete());
        assert_eq!(c.try_take(), Some(7));
    }
}
