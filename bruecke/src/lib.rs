//! A dynamic bridge between a host runtime and the Objective-C runtime.
//!
//! No precompiled bindings: every call is described by the runtime's type
//! encoding strings, parsed by the `encoding` crate and executed through
//! libffi. Outbound traffic goes through the message pipeline
//! ([`message`]), the C-function caller ([`function`]) and the block
//! factory ([`block`]); inbound traffic comes back through the forwarding
//! shim ([`forwarding`]) and the block trampolines, hopping to the host
//! thread through the queue in [`dispatch`] when it originates elsewhere.
//!
//! The host side is abstracted by the `host` crate: values, rooted
//! callables, thread-safe queues. Platform-specific pieces (the ObjC
//! runtime itself, the block runtime, CoreFoundation's run loop) are gated
//! on Apple targets; parsing, marshalling, libffi plumbing, the registries
//! and the dispatch machinery build and test everywhere.

pub mod block;
pub mod dispatch;
pub mod error;
pub mod ffi;
pub mod function;
pub mod handle;
pub mod marshal;
pub mod registry;
pub mod sys;

#[cfg(target_vendor = "apple")]
pub mod forwarding;
#[cfg(target_vendor = "apple")]
pub mod invocation;
#[cfg(target_vendor = "apple")]
pub mod message;
#[cfg(target_vendor = "apple")]
pub mod protocol;
#[cfg(target_vendor = "apple")]
pub mod subclass;

pub use error::BridgeError;
pub use function::{call_function, call_pointer};

#[cfg(target_vendor = "apple")]
pub use block::create_block_value;
#[cfg(target_vendor = "apple")]
pub use message::{prepare, responds_to_selector, send, send_prepared, PreparedCall};
#[cfg(target_vendor = "apple")]
pub use protocol::create_protocol_impl;
#[cfg(target_vendor = "apple")]
pub use subclass::{call_super, define_class, ClassSpec, MethodSpec};

/// Same-thread callbacks still take the thread-safe path unless the
/// embedder opts out: hosts with context boundaries (embedded webviews,
/// multi-context runtimes) cannot be re-entered directly even on their own
/// thread, and the queued path is always correct.
pub const DEFAULT_CROSS_CONTEXT: bool = true;
