//! Raw runtime bindings.
//!
//! The dynamic loader half is POSIX and compiles everywhere; the
//! Objective-C runtime, block runtime and CoreFoundation half only exists on
//! Apple targets. Non-Apple builds get the loader plus inert stand-ins for
//! retain/release so the handle layer can be exercised in tests.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, c_void, CString};

pub type id = *mut c_void;
pub type Class = *mut c_void;
pub type SEL = *mut c_void;
pub type Imp = unsafe extern "C" fn();
pub type BOOL = i8;

pub const nil: id = std::ptr::null_mut();
pub const YES: BOOL = 1;
pub const NO: BOOL = 0;

// ── Dynamic loader ───────────────────────────────────────────────────

#[cfg(target_family = "unix")]
#[cfg_attr(not(target_vendor = "apple"), link(name = "dl"))]
extern "C" {
    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
}

/// `RTLD_DEFAULT`: search every image already loaded into the process.
#[cfg(target_vendor = "apple")]
const RTLD_DEFAULT: *mut c_void = -2isize as *mut c_void;
#[cfg(all(target_family = "unix", not(target_vendor = "apple")))]
const RTLD_DEFAULT: *mut c_void = std::ptr::null_mut();

/// Resolve a symbol through the process-wide loader.
#[cfg(target_family = "unix")]
pub fn resolve_symbol(name: &str) -> Option<*mut c_void> {
    let cname = CString::new(name).ok()?;
    let sym = unsafe { dlsym(RTLD_DEFAULT, cname.as_ptr()) };
    if sym.is_null() {
        None
    } else {
        Some(sym)
    }
}

#[cfg(not(target_family = "unix"))]
pub fn resolve_symbol(_name: &str) -> Option<*mut c_void> {
    None
}

// ── Objective-C runtime ──────────────────────────────────────────────

/// `struct objc_method_description { SEL name; char *types; }`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct objc_method_description {
    pub name: SEL,
    pub types: *const c_char,
}

/// Receiver/class pair handed to `objc_msgSendSuper`.
#[repr(C)]
pub struct objc_super {
    pub receiver: id,
    pub super_class: Class,
}

#[cfg(target_vendor = "apple")]
#[link(name = "objc")]
extern "C" {
    pub fn objc_getClass(name: *const c_char) -> Class;
    pub fn objc_getProtocol(name: *const c_char) -> *mut c_void;
    pub fn objc_allocateClassPair(
        superclass: Class,
        name: *const c_char,
        extra_bytes: usize,
    ) -> Class;
    pub fn objc_registerClassPair(cls: Class);
    pub fn object_getClass(obj: id) -> Class;
    pub fn class_getName(cls: Class) -> *const c_char;
    pub fn class_getSuperclass(cls: Class) -> Class;
    pub fn class_addMethod(cls: Class, name: SEL, imp: Imp, types: *const c_char) -> BOOL;
    pub fn class_addProtocol(cls: Class, protocol: *mut c_void) -> BOOL;
    pub fn class_getInstanceMethod(cls: Class, name: SEL) -> *mut c_void;
    pub fn class_getClassMethod(cls: Class, name: SEL) -> *mut c_void;
    pub fn class_respondsToSelector(cls: Class, name: SEL) -> BOOL;
    pub fn method_getTypeEncoding(method: *mut c_void) -> *const c_char;
    pub fn method_getImplementation(method: *mut c_void) -> *mut c_void;
    pub fn protocol_getMethodDescription(
        protocol: *mut c_void,
        sel: SEL,
        is_required: BOOL,
        is_instance: BOOL,
    ) -> objc_method_description;
    pub fn sel_registerName(name: *const c_char) -> SEL;
    pub fn sel_getName(sel: SEL) -> *const c_char;

    /// Variadic in C; always called through a concrete signature (either a
    /// transmuted function pointer or a libffi CIF).
    pub fn objc_msgSend();
    pub fn objc_msgSendSuper();
    #[cfg(target_arch = "x86_64")]
    pub fn objc_msgSend_stret();
    #[cfg(target_arch = "x86_64")]
    pub fn objc_msgSendSuper_stret();

    // Stable ABI since macOS 10.12, not in public headers.
    pub fn objc_retain(value: id) -> id;
    pub fn objc_release(value: id);
}

// ── Block runtime ────────────────────────────────────────────────────

#[cfg(target_vendor = "apple")]
extern "C" {
    /// Class object used as the `isa` of stack block literals.
    pub static _NSConcreteStackBlock: [*const c_void; 32];

    pub fn _Block_copy(block: *const c_void) -> *mut c_void;
}

// ── CoreFoundation run loop ──────────────────────────────────────────

#[cfg(target_vendor = "apple")]
#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    pub static kCFRunLoopDefaultMode: *const c_void;

    pub fn CFRunLoopRunInMode(
        mode: *const c_void,
        seconds: f64,
        return_after_source_handled: u8,
    ) -> i32;
}

// ── Heap probe ───────────────────────────────────────────────────────

#[cfg(target_vendor = "apple")]
extern "C" {
    /// Returns the malloc zone owning `ptr`, or null for non-heap pointers.
    pub fn malloc_zone_from_ptr(ptr: *const c_void) -> *mut c_void;
}

// ── Reference counting ───────────────────────────────────────────────

/// Retain one strong reference. Thread-safe at the runtime level.
#[cfg(target_vendor = "apple")]
pub fn retain(obj: id) -> id {
    if obj.is_null() {
        return nil;
    }
    unsafe { objc_retain(obj) }
}

#[cfg(target_vendor = "apple")]
pub fn release(obj: id) {
    if obj.is_null() {
        return;
    }
    unsafe { objc_release(obj) }
}

// Non-Apple builds keep the handle layer linkable; there is no runtime to
// count references against.
#[cfg(not(target_vendor = "apple"))]
pub fn retain(obj: id) -> id {
    obj
}

#[cfg(not(target_vendor = "apple"))]
pub fn release(_obj: id) {}

// ── Typed message sends ──────────────────────────────────────────────
//
// objc_msgSend must be called through the concrete signature of the method
// being invoked; these transmute helpers cover the fixed shapes the bridge
// itself needs (NSInvocation bookkeeping and friends). Dynamic shapes go
// through libffi.

#[cfg(target_vendor = "apple")]
pub unsafe fn msg_send_0<R>(obj: id, sel: SEL) -> R {
    let f: unsafe extern "C" fn(id, SEL) -> R =
        std::mem::transmute(objc_msgSend as *const c_void);
    f(obj, sel)
}

#[cfg(target_vendor = "apple")]
pub unsafe fn msg_send_1<R, A>(obj: id, sel: SEL, a: A) -> R {
    let f: unsafe extern "C" fn(id, SEL, A) -> R =
        std::mem::transmute(objc_msgSend as *const c_void);
    f(obj, sel, a)
}

#[cfg(target_vendor = "apple")]
pub unsafe fn msg_send_2<R, A, B>(obj: id, sel: SEL, a: A, b: B) -> R {
    let f: unsafe extern "C" fn(id, SEL, A, B) -> R =
        std::mem::transmute(objc_msgSend as *const c_void);
    f(obj, sel, a, b)
}

/// Register (or look up) a selector by name. Registration is idempotent at
/// the runtime level: the same name always maps to the same `SEL`.
#[cfg(target_vendor = "apple")]
pub fn selector(name: &str) -> Option<SEL> {
    let cname = CString::new(name).ok()?;
    let sel = unsafe { sel_registerName(cname.as_ptr()) };
    if sel.is_null() {
        None
    } else {
        Some(sel)
    }
}

#[cfg(target_vendor = "apple")]
pub fn selector_name(sel: SEL) -> String {
    if sel.is_null() {
        return String::new();
    }
    unsafe {
        std::ffi::CStr::from_ptr(sel_getName(sel))
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(target_vendor = "apple")]
pub fn class_name(cls: Class) -> String {
    if cls.is_null() {
        return String::new();
    }
    unsafe {
        std::ffi::CStr::from_ptr(class_getName(cls))
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(target_vendor = "apple")]
pub fn lookup_class(name: &str) -> Option<Class> {
    let cname = CString::new(name).ok()?;
    let cls = unsafe { objc_getClass(cname.as_ptr()) };
    if cls.is_null() {
        None
    } else {
        Some(cls)
    }
}
