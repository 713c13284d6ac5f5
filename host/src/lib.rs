//! The host-runtime surface the bridge is written against.
//!
//! The bridge does not link a concrete JS engine. It consumes exactly three
//! things from whichever host embeds it: a boundary value model with a stable
//! ABI for handles, numbers, strings and buffers ([`Value`]), a rooted
//! callable that can be scheduled onto the host thread from anywhere
//! ([`ThreadSafeFunction`] over a [`CallbackQueue`]), and thread identity for
//! the same-thread fast path ([`thread::current_thread_token`]).
//!
//! Everything in this crate is portable; platform run-loop pumping plugs in
//! as a closure where a foreign thread has to wait for the host thread.

pub mod foreign;
pub mod function;
pub mod queue;
pub mod thread;
pub mod value;

pub use foreign::ForeignCell;
pub use function::{HostError, HostFunction, ThreadSafeFunction};
pub use queue::{CallbackQueue, Completion};
pub use value::{ByteBuffer, Value};
