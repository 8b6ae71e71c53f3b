//! Single-threaded readiness reactor backed by mio.
//!
//! One dedicated thread owns the `mio::Poll`. Other threads interact with it
//! through a [`ReactorHandle`]: registrations and cancellations are queued and
//! applied on the reactor thread at the top of each loop iteration, which is
//! what makes it safe for a handler to close its own channel or register new
//! interest re-entrantly.
//!
//! Handlers never run on the reactor thread. Ready events are dispatched to
//! the [`Executor`] supplied at start-up.
//!
//! # Loop
//!
//! 1. apply pending registrations
//! 2. compute the earliest timer deadline
//! 3. wait, bounded by that deadline or the configured ceiling
//! 4. if nothing fired, run expired timers and start over
//! 5. otherwise collect the events matching each ready channel, keep the
//!    repeating ones, drop the one-shot ones, re-arm the channel
//! 6. dispatch the matched handlers, then run expired timers
//!
//! # Shutdown
//!
//! [`Reactor`] is the owning handle. Dropping it stops and joins the thread;
//! every event still registered is aborted. Clones of [`ReactorHandle`] do
//! not keep the thread alive.

mod event;
mod timer;

pub use event::{AsyncEvent, CallbackEvent};
pub use timer::TimeoutEvent;

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::executor::Executor;
use crate::types::{Channel, Interest, TimerId, set_nonblocking};
use timer::TimerSet;

/// Wait ceiling used when no timer is pending.
pub const DEFAULT_NODEADLINE: Duration = Duration::from_millis(3000);

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Reactor settings.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound on a single wait when no timer is pending.
    pub nodeadline: Duration,
    /// Capacity of the mio event buffer.
    pub events_capacity: usize,
    /// Name of the reactor thread.
    pub thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            nodeadline: DEFAULT_NODEADLINE,
            events_capacity: 1024,
            thread_name: "h2-reactor".to_string(),
        }
    }
}

enum Command {
    Register(Arc<dyn AsyncEvent>),
    Cancel(Channel),
}

struct Shared {
    registry: Registry,
    waker: Waker,
    commands: Mutex<Vec<Command>>,
    timers: Mutex<TimerSet>,
    executor: Arc<dyn Executor>,
    closed: AtomicBool,
}

impl Shared {
    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake reactor");
        }
    }
}

/// Owning handle for the reactor thread.
pub struct Reactor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Start the reactor thread. Handlers are dispatched to `executor`.
    pub fn start(config: ReactorConfig, executor: Arc<dyn Executor>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            registry,
            waker,
            commands: Mutex::new(Vec::new()),
            timers: Mutex::new(TimerSet::new()),
            executor,
            closed: AtomicBool::new(false),
        });

        let mut event_loop = EventLoop {
            events: Events::with_capacity(config.events_capacity),
            poll,
            shared: shared.clone(),
            channels: Slab::new(),
            by_channel: HashMap::new(),
            nodeadline: config.nodeadline,
        };

        let thread = thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || event_loop.run())?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// A cloneable handle for registering events and timers.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Stop the reactor thread and wait for it to exit.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        {
            let _commands = self.shared.commands.lock();
            self.shared.closed.store(true, Ordering::Release);
        }
        self.shared.wake();
        if thread.thread().id() != thread::current().id() && thread.join().is_err() {
            warn!("reactor thread panicked");
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Thread-safe access to a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Queue an event registration. If the reactor already shut down the
    /// event is aborted immediately.
    pub fn register(&self, event: Arc<dyn AsyncEvent>) {
        {
            let mut commands = self.shared.commands.lock();
            if !self.shared.closed.load(Ordering::Acquire) {
                commands.push(Command::Register(event));
                drop(commands);
                self.shared.wake();
                return;
            }
        }
        event.abort(reactor_closed());
    }

    /// Drop every pending event for `channel` without aborting them.
    pub fn cancel(&self, channel: Channel) {
        let mut commands = self.shared.commands.lock();
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        commands.push(Command::Cancel(channel));
        drop(commands);
        self.shared.wake();
    }

    /// Schedule a timer. The handler runs on the executor.
    pub fn schedule(&self, event: TimeoutEvent) -> TimerId {
        let id = self.shared.timers.lock().insert(event);
        self.shared.wake();
        id
    }

    /// Schedule `handler` to run after `delay`.
    pub fn schedule_after(
        &self,
        delay: Duration,
        handler: impl FnOnce() + Send + 'static,
    ) -> TimerId {
        self.schedule(TimeoutEvent::new(Instant::now() + delay, handler))
    }

    /// Cancel a timer. Returns `false` if it already fired.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.shared.timers.lock().cancel(id)
    }

    /// The executor handlers are dispatched to.
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.shared.executor
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

fn reactor_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "reactor closed")
}

/// Pending events for one channel.
struct Attachment {
    channel: Channel,
    pending: Vec<Arc<dyn AsyncEvent>>,
    registered: bool,
}

impl Attachment {
    fn interest(&self) -> Interest {
        self.pending
            .iter()
            .fold(Interest::empty(), |acc, ev| acc | ev.interest())
    }
}

struct EventLoop {
    poll: Poll,
    events: Events,
    shared: Arc<Shared>,
    channels: Slab<Attachment>,
    by_channel: HashMap<Channel, usize>,
    nodeadline: Duration,
}

impl EventLoop {
    fn run(&mut self) {
        debug!("reactor started");
        let mut ready: Vec<(usize, Interest)> = Vec::new();
        let mut fired: Vec<Arc<dyn AsyncEvent>> = Vec::new();

        while !self.shared.closed.load(Ordering::Acquire) {
            self.apply_commands();

            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "reactor poll failed");
                break;
            }

            ready.clear();
            for event in self.events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                ready.push((event.token().0, Interest::from_event(event)));
            }

            if ready.is_empty() {
                self.fire_timers();
                continue;
            }

            for &(key, interest) in &ready {
                self.collect(key, interest, &mut fired);
            }
            for event in fired.drain(..) {
                self.dispatch(event);
            }
            self.fire_timers();
        }

        self.abort_all();
        debug!("reactor stopped");
    }

    fn apply_commands(&mut self) {
        let commands = std::mem::take(&mut *self.shared.commands.lock());
        for command in commands {
            match command {
                Command::Register(event) => self.register(event),
                Command::Cancel(channel) => self.cancel(channel),
            }
        }
    }

    fn register(&mut self, event: Arc<dyn AsyncEvent>) {
        let channel = event.channel();
        let key = match self.by_channel.get(&channel) {
            Some(&key) => key,
            None => {
                let key = self.channels.insert(Attachment {
                    channel,
                    pending: Vec::new(),
                    registered: false,
                });
                self.by_channel.insert(channel, key);
                key
            }
        };
        self.channels[key].pending.push(event);
        trace!(channel, "event registered");

        if let Err(e) = self.rearm(key) {
            warn!(channel, error = %e, "failed to register channel");
            if let Some(attachment) = self.remove(key) {
                for event in attachment.pending {
                    event.abort(io::Error::new(e.kind(), e.to_string()));
                }
            }
        }
    }

    fn cancel(&mut self, channel: Channel) {
        if let Some(&key) = self.by_channel.get(&channel) {
            trace!(channel, "channel cancelled");
            self.remove(key);
        }
    }

    /// Match ready operations against the channel's pending events.
    fn collect(&mut self, key: usize, ready: Interest, fired: &mut Vec<Arc<dyn AsyncEvent>>) {
        let Some(attachment) = self.channels.get_mut(key) else {
            return;
        };

        attachment.pending.retain(|event| {
            if event.interest().intersects(ready) {
                fired.push(event.clone());
                event.flags().repeating
            } else {
                true
            }
        });

        if let Err(e) = self.rearm(key) {
            debug!(error = %e, "failed to re-arm channel");
            self.remove(key);
        }
    }

    /// Bring the mio registration in line with the pending events, dropping
    /// the attachment when nothing is left.
    fn rearm(&mut self, key: usize) -> io::Result<()> {
        let attachment = &mut self.channels[key];
        let fd: RawFd = attachment.channel;
        match attachment.interest().to_mio() {
            Some(interest) => {
                let mut source = SourceFd(&fd);
                if attachment.registered {
                    self.shared
                        .registry
                        .reregister(&mut source, Token(key), interest)?;
                } else {
                    self.shared
                        .registry
                        .register(&mut source, Token(key), interest)?;
                    attachment.registered = true;
                }
                Ok(())
            }
            None => {
                self.remove(key);
                Ok(())
            }
        }
    }

    fn remove(&mut self, key: usize) -> Option<Attachment> {
        let attachment = self.channels.try_remove(key)?;
        self.by_channel.remove(&attachment.channel);
        if attachment.registered {
            let fd = attachment.channel;
            // The descriptor may already be closed; nothing to undo then.
            let _ = self.shared.registry.deregister(&mut SourceFd(&fd));
        }
        Some(attachment)
    }

    fn dispatch(&self, event: Arc<dyn AsyncEvent>) {
        if event.flags().blocking_after_fire
            && let Err(e) = set_nonblocking(event.channel(), false)
        {
            event.abort(e);
            return;
        }

        let task_event = event.clone();
        let task = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| task_event.handle()));
            if result.is_err() {
                warn!(channel = task_event.channel(), "event handler panicked");
                task_event.abort(io::Error::other("event handler panicked"));
            }
        });

        if let Err(e) = self.shared.executor.execute(task) {
            event.abort(e);
        }
    }

    fn next_timeout(&self) -> Duration {
        match self.shared.timers.lock().next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.nodeadline),
            None => self.nodeadline,
        }
    }

    fn fire_timers(&self) {
        let expired = self.shared.timers.lock().purge_expired(Instant::now());
        for timer in expired {
            if let Err(e) = self.shared.executor.execute(Box::new(move || timer.fire())) {
                debug!(error = %e, "dropping timer, executor closed");
            }
        }
    }

    fn abort_all(&mut self) {
        let commands = std::mem::take(&mut *self.shared.commands.lock());
        for command in commands {
            if let Command::Register(event) = command {
                event.abort(reactor_closed());
            }
        }

        let keys: Vec<usize> = self.channels.iter().map(|(key, _)| key).collect();
        for key in keys {
            if let Some(attachment) = self.remove(key) {
                for event in attachment.pending {
                    event.abort(reactor_closed());
                }
            }
        }

        self.shared.timers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPool;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    fn start() -> (Reactor, Arc<ThreadPool>) {
        let pool = Arc::new(ThreadPool::new("reactor-test", 2).unwrap());
        let reactor = Reactor::start(ReactorConfig::default(), pool.clone()).unwrap();
        (reactor, pool)
    }

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_one_shot_read_fires_once() {
        let (reactor, _pool) = start();
        let (a, mut b) = pair();
        let (tx, rx) = crossbeam_channel::unbounded();

        let event = CallbackEvent::new(a.as_raw_fd(), Interest::READ, move || {
            tx.send(()).unwrap();
        });
        reactor.handle().register(Arc::new(event));

        b.write_all(b"x").unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        b.write_all(b"y").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_write_interest_fires_immediately() {
        let (reactor, _pool) = start();
        let (a, _b) = pair();
        let (tx, rx) = crossbeam_channel::unbounded();

        let event = CallbackEvent::new(a.as_raw_fd(), Interest::WRITE, move || {
            tx.send(()).unwrap();
        });
        reactor.handle().register(Arc::new(event));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_timer_fires() {
        let (reactor, _pool) = start();
        let (tx, rx) = crossbeam_channel::unbounded();
        let started = Instant::now();
        reactor
            .handle()
            .schedule_after(Duration::from_millis(50), move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let (reactor, _pool) = start();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = reactor.handle();
        let id = handle.schedule_after(Duration::from_millis(50), move || tx.send(()).unwrap());
        assert!(handle.cancel_timer(id));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_panicking_handler_aborts_event() {
        let (reactor, _pool) = start();
        let (a, _b) = pair();
        let (tx, rx) = crossbeam_channel::unbounded();

        let event = CallbackEvent::new(a.as_raw_fd(), Interest::WRITE, || panic!("handler"))
            .on_abort(move |e| tx.send(e.to_string()).unwrap());
        reactor.handle().register(Arc::new(event));

        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(msg.contains("panicked"));

        // The reactor keeps serving other channels.
        let (c, _d) = pair();
        let (tx2, rx2) = crossbeam_channel::unbounded();
        let event = CallbackEvent::new(c.as_raw_fd(), Interest::WRITE, move || {
            tx2.send(()).unwrap();
        });
        reactor.handle().register(Arc::new(event));
        rx2.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_shutdown_aborts_pending_events() {
        let (mut reactor, _pool) = start();
        let (a, _b) = pair();
        let aborted = Arc::new(AtomicUsize::new(0));

        let counter = aborted.clone();
        let event = CallbackEvent::new(a.as_raw_fd(), Interest::READ, || {})
            .on_abort(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let handle = reactor.handle();
        handle.register(Arc::new(event));

        // Give the loop a chance to apply the registration.
        thread::sleep(Duration::from_millis(50));
        reactor.shutdown();
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
        assert!(handle.is_closed());

        // Late registrations are aborted inline.
        let counter = aborted.clone();
        let event = CallbackEvent::new(a.as_raw_fd(), Interest::READ, || {})
            .on_abort(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        handle.register(Arc::new(event));
        assert_eq!(aborted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_drops_events_silently() {
        let (reactor, _pool) = start();
        let (a, mut b) = pair();
        let (tx, rx) = crossbeam_channel::unbounded::<&'static str>();

        let ready_tx = tx.clone();
        let event = CallbackEvent::new(a.as_raw_fd(), Interest::READ, move || {
            ready_tx.send("ready").unwrap();
        })
        .on_abort(move |_| tx.send("abort").unwrap());

        let handle = reactor.handle();
        handle.register(Arc::new(event));
        handle.cancel(a.as_raw_fd());
        thread::sleep(Duration::from_millis(50));

        b.write_all(b"x").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_blocking_after_fire() {
        let (reactor, _pool) = start();
        let (a, mut b) = pair();
        let fd = a.as_raw_fd();
        let (tx, rx) = crossbeam_channel::unbounded();

        let event = CallbackEvent::new(fd, Interest::READ, move || {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            tx.send(flags & libc::O_NONBLOCK == 0).unwrap();
            set_nonblocking(fd, true).unwrap();
        })
        .with_flags(crate::types::EventFlags::ONE_SHOT.blocking());
        reactor.handle().register(Arc::new(event));

        b.write_all(b"x").unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        drop(a);
    }
}
