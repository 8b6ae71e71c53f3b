//! Deadline-ordered timer set owned by the reactor.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;

use crate::types::TimerId;

/// A deadline plus the handler to run when it passes.
pub struct TimeoutEvent {
    deadline: Instant,
    handler: Box<dyn FnOnce() + Send>,
}

impl TimeoutEvent {
    pub fn new(deadline: Instant, handler: impl FnOnce() + Send + 'static) -> Self {
        Self {
            deadline,
            handler: Box::new(handler),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Run the handler, consuming the event.
    pub fn fire(self) {
        (self.handler)();
    }
}

impl fmt::Debug for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutEvent")
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Timers keyed by `(deadline, id)` so equal deadlines keep insertion order.
#[derive(Default)]
pub(crate) struct TimerSet {
    by_deadline: BTreeMap<(Instant, u64), TimeoutEvent>,
    deadlines: HashMap<u64, Instant>,
    next_id: u64,
}

impl TimerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, event: TimeoutEvent) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.deadlines.insert(id, event.deadline);
        self.by_deadline.insert((event.deadline, id), event);
        TimerId(id)
    }

    /// Remove a timer. Returns `false` if it already fired or was cancelled.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id.0) {
            Some(deadline) => self.by_deadline.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    /// Earliest pending deadline.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// in deadline order.
    pub(crate) fn purge_expired(&mut self, now: Instant) -> Vec<TimeoutEvent> {
        let mut expired = Vec::new();
        while let Some(entry) = self.by_deadline.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), event) = entry.remove_entry();
            self.deadlines.remove(&id);
            expired.push(event);
        }
        expired
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_deadline.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_deadline.clear();
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn recording(log: &Arc<Mutex<Vec<u32>>>, deadline: Instant, tag: u32) -> TimeoutEvent {
        let log = log.clone();
        TimeoutEvent::new(deadline, move || log.lock().unwrap().push(tag))
    }

    #[test]
    fn test_purge_in_deadline_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();
        let mut timers = TimerSet::new();

        timers.insert(recording(&log, now + Duration::from_millis(30), 3));
        timers.insert(recording(&log, now + Duration::from_millis(10), 1));
        timers.insert(recording(&log, now + Duration::from_millis(20), 2));
        timers.insert(recording(&log, now + Duration::from_secs(60), 4));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));

        let expired = timers.purge_expired(now + Duration::from_millis(30));
        assert_eq!(expired.len(), 3);
        for event in expired {
            event.fire();
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();
        let mut timers = TimerSet::new();

        let id = timers.insert(recording(&log, now, 1));
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(timers.purge_expired(now + Duration::from_secs(1)).is_empty());
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn test_equal_deadlines_keep_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();
        let mut timers = TimerSet::new();
        for tag in 0..5 {
            timers.insert(recording(&log, now, tag));
        }
        for event in timers.purge_expired(now) {
            event.fire();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
