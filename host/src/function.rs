//! Rooted host callables.

use std::fmt;
use std::sync::Arc;

use crate::queue::CallbackQueue;
use crate::thread::current_thread_token;
use crate::value::Value;

/// An error raised by a host callback.
///
/// Errors from inbound callbacks are never rethrown across the foreign
/// boundary; the dispatch layer logs them and leaves the return slot zeroed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        HostError {
            message: message.into(),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HostError {}

type Callable = dyn Fn(&[Value]) -> Result<Value, HostError> + Send + Sync;

/// A rooted host function.
///
/// The root keeps the callable alive for as long as any registry references
/// it (the "persistent reference" of the host ABI). `arity` mirrors the host
/// function's declared parameter count — block creation falls back to it
/// when no extended signature is available.
///
/// Calls must happen on the function's home thread; foreign threads go
/// through [`ThreadSafeFunction`].
#[derive(Clone)]
pub struct HostFunction {
    inner: Arc<Callable>,
    arity: usize,
    home_thread: u64,
}

impl HostFunction {
    /// Root a callable on the calling thread.
    pub fn new(
        arity: usize,
        f: impl Fn(&[Value]) -> Result<Value, HostError> + Send + Sync + 'static,
    ) -> Self {
        HostFunction {
            inner: Arc::new(f),
            arity,
            home_thread: current_thread_token(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn home_thread(&self) -> u64 {
        self.home_thread
    }

    pub fn is_home_thread(&self) -> bool {
        current_thread_token() == self.home_thread
    }

    /// Invoke directly. The caller is responsible for being on the home
    /// thread (directly, or because it is running inside a queue drain).
    pub fn call(&self, args: &[Value]) -> Result<Value, HostError> {
        (self.inner)(args)
    }

    /// Root identity.
    pub fn same_function(&self, other: &HostFunction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HostFunction(arity={}, home={})",
            self.arity, self.home_thread
        )
    }
}

/// A host function paired with the queue that can reach its home thread —
/// the "thread-safe function" of the host ABI.
#[derive(Clone)]
pub struct ThreadSafeFunction {
    function: HostFunction,
    queue: CallbackQueue,
}

impl ThreadSafeFunction {
    pub fn new(function: HostFunction, queue: CallbackQueue) -> Self {
        ThreadSafeFunction { function, queue }
    }

    /// Pair a function with its home thread's registered event-loop queue.
    /// `None` if that thread never registered one.
    pub fn for_function(function: HostFunction) -> Option<Self> {
        let queue = CallbackQueue::for_thread(function.home_thread())?;
        Some(ThreadSafeFunction { function, queue })
    }

    pub fn function(&self) -> &HostFunction {
        &self.function
    }

    pub fn queue(&self) -> &CallbackQueue {
        &self.queue
    }

    pub fn home_thread(&self) -> u64 {
        self.function.home_thread
    }
}

impl fmt::Debug for ThreadSafeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadSafeFunction(home={})", self.home_thread())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_invokes_rooted_callable() {
        let double = HostFunction::new(1, |args| {
            let n = args[0].as_f64().ok_or_else(|| HostError::new("not a number"))?;
            Ok(Value::Number(n * 2.0))
        });
        assert_eq!(double.arity(), 1);
        assert_eq!(
            double.call(&[Value::Number(21.0)]).expect("call"),
            Value::Number(42.0)
        );
        assert!(double.call(&[Value::Null]).is_err());
    }

    #[test]
    fn clones_share_the_root() {
        let f = HostFunction::new(0, |_| Ok(Value::Undefined));
        let g = f.clone();
        assert!(f.same_function(&g));
        let h = HostFunction::new(0, |_| Ok(Value::Undefined));
        assert!(!f.same_function(&h));
    }
}
