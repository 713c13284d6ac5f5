//! Thread identity.
//!
//! Every thread that touches the bridge gets a process-unique token on first
//! use. The token is how the dispatch layer answers "am I on the host
//! thread?" without holding on to OS thread handles; waking a waiting
//! thread is the [`crate::queue::Completion`] condvar's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Token of the calling thread, assigned on first use.
pub fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// The tick used when a foreign thread waits for the host thread: short
/// enough that run-loop sources keep servicing, long enough not to spin.
pub const PUMP_TICK: Duration = Duration::from_millis(1);
