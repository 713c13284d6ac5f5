//! The forwarding shim: inbound dispatch for protocol implementations and
//! host-defined subclasses.
//!
//! Classes synthesized by the protocol and subclass engines install four
//! IMPs — `respondsToSelector:`, `methodSignatureForSelector:`,
//! `forwardInvocation:` and `dealloc`. A forwarded call looks the context
//! up under the registry lock, copies everything it needs out, drops the
//! lock, and then either runs the host callback in place (same thread,
//! same context) or ships a retained invocation to the host thread and
//! pumps the run loop until it completes.

#![cfg(target_vendor = "apple")]

use std::cell::RefCell;
use std::ffi::c_void;

use host::{ThreadSafeFunction, Value};
use tracing::warn;

use crate::dispatch::{self, SendPtr};
use crate::handle;
use crate::invocation::{Invocation, MethodSignature};
use crate::marshal::{self, KeepAlive};
use crate::registry;
use crate::sys::{self, id, Imp, SEL};

/// Everything `forwardInvocation:` needs, copied out under the lock.
struct ForwardingContext {
    tsfn: ThreadSafeFunction,
    encoding: String,
    cross_context: bool,
    /// Subclass overrides surface `self` as the first host argument.
    surface_self: bool,
}

fn lookup_context(receiver: id, selector_name: &str) -> Option<ForwardingContext> {
    // protocol instances key on the instance pointer
    if let Some(entry) = registry::protocols().lookup(receiver as usize) {
        let callback = entry.callback(selector_name)?;
        return Some(ForwardingContext {
            tsfn: callback.tsfn.clone(),
            encoding: callback.encoding.clone(),
            cross_context: entry.cross_context,
            surface_self: false,
        });
    }

    // subclasses key on the class (or metaclass, for class methods)
    let class = unsafe { sys::object_getClass(receiver) };
    let entry = registry::subclasses().lookup_in_hierarchy(class as usize, |cls| {
        unsafe { sys::class_getSuperclass(cls as *mut c_void) as usize }
    })?;
    let method = entry.method(selector_name)?;
    Some(ForwardingContext {
        tsfn: method.tsfn.clone(),
        encoding: method.encoding.clone(),
        cross_context: entry.cross_context,
        surface_self: true,
    })
}

// ── Pipeline cache ───────────────────────────────────────────────────
//
// One forwarded call always pairs respondsToSelector: with
// methodSignatureForSelector: on the same thread; memoizing the encoding
// between the two skips the second registry lock.

struct PipelineEntry {
    key: usize,
    selector: usize,
    encoding: String,
}

thread_local! {
    static PIPELINE: RefCell<Option<PipelineEntry>> = const { RefCell::new(None) };
}

fn pipeline_store(key: usize, selector: SEL, encoding: &str) {
    PIPELINE.with(|cache| {
        *cache.borrow_mut() = Some(PipelineEntry {
            key,
            selector: selector as usize,
            encoding: encoding.to_string(),
        });
    });
}

fn pipeline_hit(key: usize, selector: SEL) -> Option<String> {
    PIPELINE.with(|cache| {
        let cache = cache.borrow();
        let entry = cache.as_ref()?;
        (entry.key == key && entry.selector == selector as usize)
            .then(|| entry.encoding.clone())
    })
}

fn lookup_encoding(receiver: id, selector_name: &str) -> Option<String> {
    if let Some(entry) = registry::protocols().lookup(receiver as usize) {
        return entry
            .callback(selector_name)
            .map(|callback| callback.encoding.clone());
    }
    let class = unsafe { sys::object_getClass(receiver) };
    let entry = registry::subclasses().lookup_in_hierarchy(class as usize, |cls| {
        unsafe { sys::class_getSuperclass(cls as *mut c_void) as usize }
    })?;
    entry.method(selector_name).map(|m| m.encoding.clone())
}

// ── Installed IMPs ───────────────────────────────────────────────────

pub unsafe extern "C" fn responds_to_selector_imp(this: id, _cmd: SEL, selector: SEL) -> sys::BOOL {
    let name = sys::selector_name(selector);
    if let Some(encoding) = lookup_encoding(this, &name) {
        pipeline_store(this as usize, selector, &encoding);
        return sys::YES;
    }
    // inherited behavior for everything the host did not implement
    let superclass = sys::class_getSuperclass(sys::object_getClass(this));
    if !superclass.is_null() && sys::class_respondsToSelector(superclass, selector) != sys::NO {
        return sys::YES;
    }
    sys::NO
}

pub unsafe extern "C" fn method_signature_for_selector_imp(
    this: id,
    _cmd: SEL,
    selector: SEL,
) -> id {
    let encoding = pipeline_hit(this as usize, selector).or_else(|| {
        let name = sys::selector_name(selector);
        lookup_encoding(this, &name)
    });

    if let Some(encoding) = encoding {
        if let Some(signature) = MethodSignature::from_types(&encoding) {
            // hand back the underlying autoreleased object: dropping the
            // wrapper balances its retain, the autorelease reference keeps
            // the signature alive for the forward
            let raw = signature.as_id();
            drop(signature);
            return raw;
        }
    }

    // fall back to the superclass for inherited selectors
    let superclass = sys::class_getSuperclass(sys::object_getClass(this));
    if superclass.is_null() {
        return sys::nil;
    }
    if let Some(signature) = MethodSignature::for_instance_method(superclass, selector) {
        let raw = signature.as_id();
        drop(signature);
        return raw;
    }
    sys::nil
}

pub unsafe extern "C" fn forward_invocation_imp(this: id, _cmd: SEL, raw_invocation: id) {
    let selector: SEL = {
        let invocation = Invocation::retain_raw(raw_invocation);
        invocation.selector()
    };
    let selector_name = sys::selector_name(selector);

    let Some(context) = lookup_context(this, &selector_name) else {
        warn!(selector = %selector_name, "forwarded selector with no registered callback");
        return;
    };

    // The packet owns a retained invocation; the originating thread blocks
    // in the pump until the host thread has written the return slot.
    let invocation = Invocation::retain_raw(raw_invocation);
    let receiver = SendPtr(this as *mut c_void);
    let encoding = context.encoding.clone();
    let surface_self = context.surface_self;
    let function = context.tsfn.function().clone();
    let selector_for_log = selector_name.clone();

    dispatch::run_on_host(&context.tsfn, context.cross_context, move || {
        run_forwarded(
            invocation,
            receiver,
            &encoding,
            surface_self,
            &function,
            &selector_for_log,
        );
    });
}

/// Executes on the host thread: read arguments, call, write the return.
fn run_forwarded(
    invocation: Invocation,
    receiver: SendPtr<c_void>,
    method_enc: &str,
    surface_self: bool,
    function: &host::HostFunction,
    selector_name: &str,
) {
    let mut host_args: Vec<Value> = Vec::new();
    if surface_self {
        host_args.push(handle::wrap_raw(receiver.get()));
    }

    // user arguments live in slots 2.. of the invocation
    let mut slot = 2;
    loop {
        let arg_enc = match encoding::method_argument(method_enc, slot) {
            Ok(Some(enc)) => enc.to_string(),
            Ok(None) => break,
            Err(err) => {
                warn!(selector = %selector_name, %err, "unreadable argument encoding");
                return;
            }
        };
        let Ok((size, _)) = encoding::size_and_alignment(&arg_enc) else {
            warn!(selector = %selector_name, encoding = %arg_enc, "unsupported argument");
            return;
        };
        let mut buffer = vec![0u8; size.max(1)];
        invocation.get_argument(slot, buffer.as_mut_ptr() as *mut c_void);
        match marshal::read_value(&buffer, &arg_enc) {
            Ok(value) => host_args.push(value),
            Err(err) => {
                warn!(selector = %selector_name, %err, "argument conversion failed");
                host_args.push(Value::Undefined);
            }
        }
        slot += 1;
    }

    let result = dispatch::call_logging_errors(function, &host_args, selector_name);

    let return_enc = match encoding::method_return(method_enc) {
        Ok(enc) => enc.to_string(),
        Err(_) => "v".to_string(),
    };
    if return_enc.starts_with('v') {
        return;
    }
    // on host error the return slot stays zero/nil
    let Some(value) = result else { return };
    let Ok((size, _)) = encoding::size_and_alignment(&return_enc) else {
        return;
    };
    let mut buffer = vec![0u8; size.max(1)];
    let mut keep = KeepAlive::new();
    match marshal::write_value(&mut buffer, &return_enc, &value, &mut keep, selector_name, 0) {
        Ok(()) => invocation.set_return_value(buffer.as_mut_ptr() as *mut c_void),
        Err(err) => warn!(selector = %selector_name, %err, "return conversion failed"),
    }
    // NSInvocation copies the return bytes; keep-alive may drop now except
    // for pointer returns, which must outlive the caller.
    std::mem::forget(keep);
}

pub unsafe extern "C" fn dealloc_imp(this: id, _cmd: SEL) {
    // Break the callback cycle before the memory is reused: registry entry
    // first, roots and thread-safe tokens with it.
    let removed = registry::protocols().remove(this as usize);
    drop(removed);

    // then [super dealloc]
    let class = sys::object_getClass(this);
    let superclass = sys::class_getSuperclass(class);
    if superclass.is_null() {
        return;
    }
    if let Some(dealloc_sel) = sys::selector("dealloc") {
        let method = sys::class_getInstanceMethod(superclass, dealloc_sel);
        if !method.is_null() {
            let imp = sys::method_getImplementation(method);
            if !imp.is_null() {
                let f: unsafe extern "C" fn(id, SEL) = std::mem::transmute(imp);
                f(this, dealloc_sel);
            }
        }
    }
}

/// Install the four shim IMPs on a freshly allocated class.
pub fn install_shim(class: sys::Class) -> Result<(), crate::error::BridgeError> {
    add_method(
        class,
        c"respondsToSelector:",
        responds_to_selector_imp as *const c_void,
        c"c@::",
    )?;
    add_method(
        class,
        c"methodSignatureForSelector:",
        method_signature_for_selector_imp as *const c_void,
        c"@@::",
    )?;
    add_method(
        class,
        c"forwardInvocation:",
        forward_invocation_imp as *const c_void,
        c"v@:@",
    )?;
    add_method(class, c"dealloc", dealloc_imp as *const c_void, c"v@:")?;
    Ok(())
}

/// Install the forwarding entry points on a metaclass so class-method
/// overrides route through the same shim.
pub fn install_class_shim(metaclass: sys::Class) -> Result<(), crate::error::BridgeError> {
    add_method(
        metaclass,
        c"respondsToSelector:",
        responds_to_selector_imp as *const c_void,
        c"c@::",
    )?;
    add_method(
        metaclass,
        c"methodSignatureForSelector:",
        method_signature_for_selector_imp as *const c_void,
        c"@@::",
    )?;
    add_method(
        metaclass,
        c"forwardInvocation:",
        forward_invocation_imp as *const c_void,
        c"v@:@",
    )?;
    Ok(())
}

fn add_method(
    class: sys::Class,
    selector: &std::ffi::CStr,
    imp: *const c_void,
    types: &std::ffi::CStr,
) -> Result<(), crate::error::BridgeError> {
    let sel = unsafe { sys::sel_registerName(selector.as_ptr()) };
    let imp: Imp = unsafe { std::mem::transmute(imp) };
    let added = unsafe { sys::class_addMethod(class, sel, imp, types.as_ptr()) };
    if added == sys::NO {
        return Err(crate::error::BridgeError::FfiFailure {
            stage: "class_addMethod",
        });
    }
    Ok(())
}
