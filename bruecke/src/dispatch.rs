//! Inbound dispatch: getting foreign-thread callbacks onto the host thread.
//!
//! Both inbound paths (forwarded invocations and block invokes) reduce to
//! the same decision: run the handler in place when the caller is already
//! the host thread and same-context calls are allowed, otherwise enqueue a
//! packet on the thread-safe callback and hold the originating thread in a
//! short-tick pump until the handler signals completion. The pump services
//! the platform run loop on Apple targets so timers and ports keep firing
//! while the thread waits.

use std::time::Duration;

use host::{Completion, HostError, HostFunction, ThreadSafeFunction, Value};
use tracing::error;

#[cfg(target_vendor = "apple")]
use crate::sys;

/// One run-loop tick of waiting. A handler that never returns leaves the
/// originating thread here forever; there are no timeouts.
#[cfg(target_vendor = "apple")]
fn pump_tick(tick: Duration, _completion: &Completion) {
    unsafe {
        sys::CFRunLoopRunInMode(sys::kCFRunLoopDefaultMode, tick.as_secs_f64(), 1);
    }
}

#[cfg(not(target_vendor = "apple"))]
fn pump_tick(tick: Duration, completion: &Completion) {
    completion.wait_for(tick);
}

/// Block until `completion` is set, pumping each tick.
pub fn pump_until_complete(completion: &Completion) {
    completion.wait_pumping(|tick| pump_tick(tick, completion));
}

/// Run `job` on the handler's home thread and return once it has executed.
///
/// - Same thread, same context: run in place.
/// - Same thread, cross context: the job still goes through the queue (some
///   hosts cannot re-enter their context directly), drained inline so
///   pending work keeps its submission order and the thread cannot
///   deadlock on itself.
/// - Foreign thread: enqueue, then pump until the job signals.
pub fn run_on_host(tsfn: &ThreadSafeFunction, cross_context: bool, job: impl FnOnce() + Send + 'static) {
    let queue = tsfn.queue();
    if queue.is_home_thread() {
        if cross_context {
            queue.push(job);
            queue.drain();
        } else {
            job();
        }
        return;
    }

    let completion = Completion::new();
    let signal = completion.clone();
    queue.call_blocking(
        &completion,
        move || {
            job();
            signal.set();
        },
        |tick| pump_tick(tick, &completion),
    );
}

/// Invoke a host callback, logging a failure instead of propagating it.
///
/// Throwing across the foreign boundary is unsafe; on error the caller
/// leaves its return slot zeroed and returns control normally.
pub fn call_logging_errors(
    function: &HostFunction,
    args: &[Value],
    context: &str,
) -> Option<Value> {
    match function.call(args) {
        Ok(value) => Some(value),
        Err(HostError { message }) => {
            error!(context, %message, "host callback failed");
            None
        }
    }
}

/// Raw pointers that must travel into an inbound job. The originating
/// thread blocks until the job completes, so the pointees outlive the send.
pub struct SendPtr<T>(pub *mut T);

unsafe impl<T> Send for SendPtr<T> {}

impl<T> SendPtr<T> {
    #[inline]
    pub fn get(&self) -> *mut T {
        self.0
    }
}

impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        SendPtr(self.0)
    }
}

impl<T> Copy for SendPtr<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use host::CallbackQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn counter_tsfn(counter: Arc<AtomicUsize>) -> ThreadSafeFunction {
        ThreadSafeFunction::new(
            HostFunction::new(0, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Undefined)
            }),
            CallbackQueue::new(),
        )
    }

    #[test]
    fn same_thread_direct_runs_in_place() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tsfn = counter_tsfn(counter.clone());
        let function = tsfn.function().clone();
        run_on_host(&tsfn, false, move || {
            function.call(&[]).expect("callback");
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_thread_cross_context_goes_through_the_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tsfn = counter_tsfn(counter.clone());
        let function = tsfn.function().clone();
        run_on_host(&tsfn, true, move || {
            function.call(&[]).expect("callback");
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn foreign_thread_blocks_until_handler_ran() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tsfn = counter_tsfn(counter.clone());

        let worker = {
            let tsfn = tsfn.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    let function = tsfn.function().clone();
                    run_on_host(&tsfn, true, move || {
                        function.call(&[]).expect("callback");
                    });
                }
                // run_on_host returned, so every handler already executed
                counter.load(Ordering::SeqCst)
            })
        };

        while counter.load(Ordering::SeqCst) < 3 {
            tsfn.queue().drain_for(Duration::from_millis(5));
        }
        assert_eq!(worker.join().expect("worker"), 3);
    }

    #[test]
    fn callback_errors_are_swallowed() {
        let failing = HostFunction::new(0, |_| Err(HostError::new("boom")));
        assert_eq!(call_logging_errors(&failing, &[], "test"), None);

        let ok = HostFunction::new(0, |_| Ok(Value::Number(5.0)));
        assert_eq!(
            call_logging_errors(&ok, &[], "test"),
            Some(Value::Number(5.0))
        );
    }
}
