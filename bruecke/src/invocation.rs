//! Thin wrappers over `NSMethodSignature` and `NSInvocation`.
//!
//! Everything here goes through typed `objc_msgSend` casts; the wrappers own
//! one strong reference each and exist so the rest of the crate never
//! touches raw invocation selectors.

#![cfg(target_vendor = "apple")]

use std::ffi::{c_char, c_void, CStr, CString};

use crate::sys::{self, id, SEL};

/// Register a selector from a static C string; cannot fail at runtime.
fn sel(name: &CStr) -> SEL {
    unsafe { sys::sel_registerName(name.as_ptr()) }
}

/// A retained `NSMethodSignature`.
pub struct MethodSignature(id);

impl MethodSignature {
    /// `[receiver methodSignatureForSelector:selector]` — nil when the
    /// receiver (and its forwarding machinery) does not know the selector.
    pub fn for_receiver(receiver: id, selector: SEL) -> Option<MethodSignature> {
        let sig: id = unsafe {
            sys::msg_send_1(receiver, sel(c"methodSignatureForSelector:"), selector)
        };
        Self::retained(sig)
    }

    /// `[class instanceMethodSignatureForSelector:selector]`.
    pub fn for_instance_method(class: sys::Class, selector: SEL) -> Option<MethodSignature> {
        let sig: id = unsafe {
            sys::msg_send_1(
                class,
                sel(c"instanceMethodSignatureForSelector:"),
                selector,
            )
        };
        Self::retained(sig)
    }

    /// `[NSMethodSignature signatureWithObjCTypes:]` from a stored encoding.
    pub fn from_types(types: &str) -> Option<MethodSignature> {
        let class = sys::lookup_class("NSMethodSignature")?;
        let ctypes = CString::new(types).ok()?;
        let sig: id = unsafe {
            sys::msg_send_1(
                class,
                sel(c"signatureWithObjCTypes:"),
                ctypes.as_ptr(),
            )
        };
        Self::retained(sig)
    }

    fn retained(sig: id) -> Option<MethodSignature> {
        if sig.is_null() {
            None
        } else {
            Some(MethodSignature(sys::retain(sig)))
        }
    }

    pub fn as_id(&self) -> id {
        self.0
    }

    /// Total argument count, including self and _cmd.
    pub fn number_of_arguments(&self) -> usize {
        let n: u64 = unsafe { sys::msg_send_0(self.0, sel(c"numberOfArguments")) };
        n as usize
    }

    /// Per-slot encoding. Extended block tails are already stripped here;
    /// callers that need them walk the full method encoding instead.
    pub fn argument_type(&self, index: usize) -> String {
        let types: *const c_char = unsafe {
            sys::msg_send_1(self.0, sel(c"getArgumentTypeAtIndex:"), index as u64)
        };
        cstr_to_string(types)
    }

    pub fn return_type(&self) -> String {
        let types: *const c_char =
            unsafe { sys::msg_send_0(self.0, sel(c"methodReturnType")) };
        cstr_to_string(types)
    }

    pub fn return_length(&self) -> usize {
        let n: u64 = unsafe { sys::msg_send_0(self.0, sel(c"methodReturnLength")) };
        n as usize
    }
}

impl Drop for MethodSignature {
    fn drop(&mut self) {
        sys::release(self.0);
    }
}

fn cstr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// A retained `NSInvocation`.
pub struct Invocation(id);

impl Invocation {
    /// `[NSInvocation invocationWithMethodSignature:]` (autoreleased, so the
    /// wrapper retains).
    pub fn with_signature(signature: &MethodSignature) -> Option<Invocation> {
        let class = sys::lookup_class("NSInvocation")?;
        let inv: id = unsafe {
            sys::msg_send_1(
                class,
                sel(c"invocationWithMethodSignature:"),
                signature.as_id(),
            )
        };
        if inv.is_null() {
            None
        } else {
            Some(Invocation(sys::retain(inv)))
        }
    }

    /// Retain an invocation handed to `forwardInvocation:` so it can cross
    /// to the host thread.
    pub fn retain_raw(inv: id) -> Invocation {
        Invocation(sys::retain(inv))
    }

    pub fn as_id(&self) -> id {
        self.0
    }

    pub fn set_target(&self, target: id) {
        unsafe { sys::msg_send_1::<(), id>(self.0, sel(c"setTarget:"), target) }
    }

    pub fn set_selector(&self, selector: SEL) {
        unsafe { sys::msg_send_1::<(), SEL>(self.0, sel(c"setSelector:"), selector) }
    }

    pub fn selector(&self) -> SEL {
        unsafe { sys::msg_send_0(self.0, sel(c"selector")) }
    }

    pub fn method_signature(&self) -> Option<MethodSignature> {
        let sig: id = unsafe { sys::msg_send_0(self.0, sel(c"methodSignature")) };
        if sig.is_null() {
            None
        } else {
            Some(MethodSignature(sys::retain(sig)))
        }
    }

    /// Install one argument slot from a marshalled buffer.
    pub fn set_argument(&self, index: usize, buffer: *mut c_void) {
        unsafe {
            sys::msg_send_2::<(), *mut c_void, u64>(
                self.0,
                sel(c"setArgument:atIndex:"),
                buffer,
                index as u64,
            )
        }
    }

    /// Copy one argument slot out into `buffer`.
    pub fn get_argument(&self, index: usize, buffer: *mut c_void) {
        unsafe {
            sys::msg_send_2::<(), *mut c_void, u64>(
                self.0,
                sel(c"getArgument:atIndex:"),
                buffer,
                index as u64,
            )
        }
    }

    pub fn invoke(&self) {
        unsafe { sys::msg_send_0::<()>(self.0, sel(c"invoke")) }
    }

    pub fn get_return_value(&self, buffer: *mut c_void) {
        unsafe {
            sys::msg_send_1::<(), *mut c_void>(self.0, sel(c"getReturnValue:"), buffer)
        }
    }

    pub fn set_return_value(&self, buffer: *mut c_void) {
        unsafe {
            sys::msg_send_1::<(), *mut c_void>(self.0, sel(c"setReturnValue:"), buffer)
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        sys::release(self.0);
    }
}

// Crossing to the host thread inside a forwarding packet; the originating
// thread blocks until the packet completes.
unsafe impl Send for Invocation {}
