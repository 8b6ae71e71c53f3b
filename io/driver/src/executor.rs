//! Worker threads that run event handlers and blocking work off the reactor
//! thread.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// A unit of work submitted to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks somewhere other than the calling thread's critical path.
pub trait Executor: Send + Sync {
    /// Submit a task. Fails once the executor has shut down.
    fn execute(&self, task: Task) -> io::Result<()>;
}

/// Fixed-size pool of worker threads fed by an unbounded channel.
///
/// A panicking task is logged and swallowed; the worker keeps running.
pub struct ThreadPool {
    tx: Mutex<Option<Sender<Task>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawn `threads` workers named `{name}-{i}`.
    pub fn new(name: &str, threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(rx))?;
            handles.push(handle);
        }

        debug!(threads, name, "thread pool started");

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            threads: Mutex::new(handles),
        })
    }

    /// Stop accepting tasks and join the workers once the queue drains.
    ///
    /// Safe to call from a worker thread; that worker is detached instead of
    /// joined.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) -> io::Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "thread pool shut down",
            ));
        };
        tx.send(task)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "thread pool shut down"))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!("worker task panicked");
        }
    }
}
