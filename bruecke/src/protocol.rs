//! Host-backed protocol implementations.
//!
//! `create_protocol_impl` synthesizes a fresh NSObject subclass conforming
//! to a named protocol, routes every declared selector through the
//! forwarding shim, and hands back one retained instance. The instance's
//! `dealloc` override removes the registry entry — that is what finally
//! releases the host callback roots.

#![cfg(target_vendor = "apple")]

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use host::{CallbackQueue, HostFunction, ThreadSafeFunction, Value};

use crate::error::BridgeError;
use crate::forwarding;
use crate::handle;
use crate::registry::{self, CallbackEntry, ProtocolImpl};
use crate::sys::{self, nil};

static NEXT_IMPL_ID: AtomicU64 = AtomicU64::new(1);

/// Create an object implementing `protocol_name`, with each selector backed
/// by a host callback. `cross_context` forces the thread-safe path even for
/// same-thread callbacks (the safe default for embedded host contexts).
pub fn create_protocol_impl(
    protocol_name: &str,
    callbacks: Vec<(String, HostFunction)>,
    cross_context: bool,
) -> Result<Value, BridgeError> {
    let cname = CString::new(protocol_name).map_err(|_| BridgeError::UnknownProtocol {
        name: protocol_name.to_string(),
    })?;
    let protocol = unsafe { sys::objc_getProtocol(cname.as_ptr()) };
    if protocol.is_null() {
        return Err(BridgeError::UnknownProtocol {
            name: protocol_name.to_string(),
        });
    }

    let superclass = sys::lookup_class("NSObject").ok_or_else(|| BridgeError::UnknownClass {
        name: "NSObject".to_string(),
    })?;

    let class_name = format!(
        "{}Impl_{}",
        protocol_name,
        NEXT_IMPL_ID.fetch_add(1, Ordering::Relaxed)
    );
    let c_class_name = CString::new(class_name.as_str()).map_err(|_| BridgeError::Fatal {
        message: format!("invalid generated class name '{}'", class_name),
    })?;
    let class = unsafe { sys::objc_allocateClassPair(superclass, c_class_name.as_ptr(), 0) };
    if class.is_null() {
        return Err(BridgeError::Fatal {
            message: format!("could not allocate class pair '{}'", class_name),
        });
    }

    unsafe { sys::class_addProtocol(class, protocol) };
    forwarding::install_shim(class)?;
    unsafe { sys::objc_registerClassPair(class) };

    // one instance per implementation; alloc/init ownership transfers to
    // the returned handle
    let alloc_sel = selector("alloc")?;
    let init_sel = selector("init")?;
    let instance: sys::id = unsafe {
        let uninit: sys::id = sys::msg_send_0(class, alloc_sel);
        sys::msg_send_0(uninit, init_sel)
    };
    if instance.is_null() {
        return Err(BridgeError::Fatal {
            message: format!("could not instantiate '{}'", class_name),
        });
    }

    let queue = CallbackQueue::current();
    let home_thread = queue.home_thread();
    let mut entries = HashMap::with_capacity(callbacks.len());
    for (selector_name, function) in callbacks {
        let encoding = protocol_method_encoding(protocol, &selector_name).ok_or_else(|| {
            BridgeError::UnknownSelector {
                name: selector_name.clone(),
            }
        })?;
        entries.insert(
            selector_name,
            CallbackEntry {
                tsfn: ThreadSafeFunction::new(function, queue.clone()),
                encoding,
            },
        );
    }

    registry::protocols().register(
        instance as usize,
        Arc::new(ProtocolImpl {
            class_name,
            callbacks: entries,
            home_thread,
            cross_context,
        }),
    );

    Ok(handle::adopt_object(instance))
}

/// The protocol's encoding for a selector: required before optional,
/// instance before class.
fn protocol_method_encoding(protocol: *mut std::ffi::c_void, selector_name: &str) -> Option<String> {
    let sel = sys::selector(selector_name)?;
    for (required, instance) in [
        (sys::YES, sys::YES),
        (sys::NO, sys::YES),
        (sys::YES, sys::NO),
        (sys::NO, sys::NO),
    ] {
        let description =
            unsafe { sys::protocol_getMethodDescription(protocol, sel, required, instance) };
        if description.name != nil && !description.types.is_null() {
            let types = unsafe { CStr::from_ptr(description.types) }
                .to_string_lossy()
                .into_owned();
            return Some(types);
        }
    }
    None
}

fn selector(name: &str) -> Result<sys::SEL, BridgeError> {
    sys::selector(name).ok_or_else(|| BridgeError::UnknownSelector {
        name: name.to_string(),
    })
}
