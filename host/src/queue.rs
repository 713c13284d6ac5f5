//! The thread-safe callback queue.
//!
//! This is the host primitive the bridge's inbound paths are built on: any
//! thread may enqueue work, and the host thread drains it in FIFO order.
//! A foreign thread that needs the result blocks on a [`Completion`] while
//! pumping — either this queue's condvar (portable) or the platform run loop
//! (supplied by the caller), in short ticks, so other event sources keep
//! making progress.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::thread::{current_thread_token, PUMP_TICK};

type Job = Box<dyn FnOnce() + Send>;

// ── Completion ───────────────────────────────────────────────────────

struct CompletionInner {
    done: Mutex<bool>,
    condvar: Condvar,
}

/// One-shot completion flag shared between a waiting foreign thread and the
/// host thread that executes its job.
#[derive(Clone)]
pub struct Completion(Arc<CompletionInner>);

impl Completion {
    pub fn new() -> Self {
        Completion(Arc::new(CompletionInner {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }))
    }

    pub fn set(&self) {
        let mut done = self.0.done.lock();
        *done = true;
        self.0.condvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.0.done.lock()
    }

    /// Wait up to `timeout`; true if the flag was set.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut done = self.0.done.lock();
        if *done {
            return true;
        }
        self.0.condvar.wait_for(&mut done, timeout);
        *done
    }

    /// Block until set, invoking `pump` once per tick. `pump` is where the
    /// platform run loop is serviced; it should block for at most the tick
    /// it is given.
    pub fn wait_pumping(&self, mut pump: impl FnMut(Duration)) {
        while !self.is_set() {
            pump(PUMP_TICK);
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

// ── Queue ────────────────────────────────────────────────────────────

struct QueueInner {
    jobs: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    home_thread: u64,
}

/// FIFO job queue owned by the host thread.
///
/// Jobs enqueued from one producer thread run on the home thread in
/// submission order; no order is defined across producers.
#[derive(Clone)]
pub struct CallbackQueue(Arc<QueueInner>);

fn queue_registry() -> &'static Mutex<HashMap<u64, CallbackQueue>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, CallbackQueue>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl CallbackQueue {
    /// Create a queue homed on the calling thread.
    pub fn new() -> Self {
        CallbackQueue(Arc::new(QueueInner {
            jobs: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            home_thread: current_thread_token(),
        }))
    }

    /// The calling thread's event-loop queue, created and registered on
    /// first use. A host thread has exactly one.
    pub fn current() -> Self {
        let token = current_thread_token();
        let mut registry = queue_registry().lock();
        registry
            .entry(token)
            .or_insert_with(CallbackQueue::new)
            .clone()
    }

    /// The registered queue of another thread, if that thread has one.
    pub fn for_thread(token: u64) -> Option<Self> {
        queue_registry().lock().get(&token).cloned()
    }

    pub fn home_thread(&self) -> u64 {
        self.0.home_thread
    }

    pub fn is_home_thread(&self) -> bool {
        current_thread_token() == self.0.home_thread
    }

    /// Enqueue a job for the home thread. Never blocks.
    pub fn push(&self, job: impl FnOnce() + Send + 'static) {
        let mut jobs = self.0.jobs.lock();
        jobs.push_back(Box::new(job));
        self.0.condvar.notify_all();
    }

    /// Run every pending job. Must be called on the home thread. Returns the
    /// number of jobs executed.
    pub fn drain(&self) -> usize {
        debug_assert!(self.is_home_thread(), "drain called off the home thread");
        let mut count = 0;
        loop {
            let job = self.0.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Wait up to `timeout` for work, then drain. The host event-loop tick.
    pub fn drain_for(&self, timeout: Duration) -> usize {
        {
            let mut jobs = self.0.jobs.lock();
            if jobs.is_empty() {
                self.0.condvar.wait_for(&mut jobs, timeout);
            }
        }
        self.drain()
    }

    /// Enqueue `job` from a foreign thread and block until the home thread
    /// has run it, pumping with `pump` each tick.
    ///
    /// The job must signal the given completion itself once its results are
    /// written; this keeps "enqueue" and "results ready" decoupled the way
    /// the inbound dispatch paths need (the job writes into the waiting
    /// frame's buffers before signalling). A job that never signals
    /// deadlocks the calling thread — there are no timeouts.
    pub fn call_blocking(
        &self,
        completion: &Completion,
        job: impl FnOnce() + Send + 'static,
        pump: impl FnMut(Duration),
    ) {
        trace!(home = self.0.home_thread, "cross-thread call enqueued");
        self.push(job);
        completion.wait_pumping(pump);
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}
