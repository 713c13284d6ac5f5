//! The outbound message-send pipeline.
//!
//! `send` resolves the selector, fetches (or reuses) a prepared call plan
//! for the receiver's class, and dispatches either directly — a libffi call
//! on the raw `objc_msgSend` entry with the concrete signature — or through
//! an `NSInvocation` when struct values or out-parameters are involved.
//!
//! Objective-C exceptions are not caught anywhere on this path; they are
//! fatal by policy.

#![cfg(target_vendor = "apple")]

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use host::Value;
use libffi::middle::CodePtr;
use parking_lot::Mutex;

use crate::error::BridgeError;
use crate::ffi::{return_cell_size, CallInterface};
use crate::handle;
use crate::invocation::{Invocation, MethodSignature};
use crate::marshal::{self, KeepAlive};
use crate::sys::{self, id, SEL};

/// Codes eligible for direct dispatch: pointer-sized or primitive values
/// whose ABI never needs the invocation object. Struct returns and
/// out-parameters stay on the invocation path.
fn is_direct_code(enc: &str) -> bool {
    matches!(
        encoding::simplify(enc).as_bytes().first(),
        Some(
            b'v' | b'c'
                | b'C'
                | b'i'
                | b'I'
                | b's'
                | b'S'
                | b'l'
                | b'L'
                | b'q'
                | b'Q'
                | b'f'
                | b'd'
                | b'B'
                | b'@'
                | b'#'
                | b':'
                | b'*'
        )
    )
}

/// Per-(class, selector) call plan. Signatures are a property of the class,
/// so reuse across instances is sound; plans live for the process.
pub struct PreparedCall {
    pub selector: SEL,
    pub selector_name: String,
    pub return_enc: String,
    /// User-argument encodings (invocation slots 2..).
    pub arg_encs: Vec<String>,
    pub expected_args: usize,
    pub fast_path: bool,
    signature: MethodSignature,
    /// Direct-mode CIF, built on first fast-path send.
    direct_interface: OnceLock<CallInterface>,
}

// SEL and the signature are immutable after preparation.
unsafe impl Send for PreparedCall {}
unsafe impl Sync for PreparedCall {}

fn prepared_calls() -> &'static Mutex<HashMap<(usize, usize), Arc<PreparedCall>>> {
    static CACHE: OnceLock<Mutex<HashMap<(usize, usize), Arc<PreparedCall>>>> =
        OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Does the receiver respond to the named selector?
pub fn responds_to_selector(receiver: &Value, selector: &str) -> Result<bool, BridgeError> {
    let target = handle::object_ptr(receiver)?;
    if target.is_null() {
        return Ok(false);
    }
    let sel = register(selector)?;
    let responds: sys::BOOL = unsafe {
        sys::msg_send_1(
            target,
            register("respondsToSelector:")?,
            sel,
        )
    };
    Ok(responds != sys::NO)
}

/// Build (or fetch) the call plan for this receiver and selector.
pub fn prepare(receiver: &Value, selector: &str) -> Result<Arc<PreparedCall>, BridgeError> {
    let target = handle::object_ptr(receiver)?;
    if target.is_null() {
        return Err(BridgeError::DoesNotRespond {
            class: "nil".to_string(),
            selector: selector.to_string(),
        });
    }
    let class = unsafe { sys::object_getClass(target) };
    let sel = register(selector)?;

    let key = (class as usize, sel as usize);
    if let Some(hit) = prepared_calls().lock().get(&key) {
        return Ok(hit.clone());
    }

    // built outside the lock; on a race the first insertion wins
    let plan = Arc::new(build_plan(target, class, sel, selector)?);
    let mut cache = prepared_calls().lock();
    let entry = cache.entry(key).or_insert(plan);
    Ok(entry.clone())
}

fn build_plan(
    target: id,
    class: sys::Class,
    sel: SEL,
    selector: &str,
) -> Result<PreparedCall, BridgeError> {
    let signature = MethodSignature::for_receiver(target, sel).ok_or_else(|| {
        BridgeError::DoesNotRespond {
            class: sys::class_name(class),
            selector: selector.to_string(),
        }
    })?;

    let total_args = signature.number_of_arguments();
    let expected_args = total_args.saturating_sub(2);
    let return_enc = signature.return_type();

    // The signature accessor strips extended block tails; when the class
    // has a concrete Method the full encoding recovers them.
    let full_enc = method_type_encoding(class, sel);

    let mut arg_encs = Vec::with_capacity(expected_args);
    for slot in 2..total_args {
        let from_signature = signature.argument_type(slot);
        let enc = match &full_enc {
            Some(full) => encoding::method_argument(full, slot)?
                .map(str::to_string)
                .unwrap_or(from_signature),
            None => from_signature,
        };
        arg_encs.push(enc);
    }

    let fast_path =
        is_direct_code(&return_enc) && arg_encs.iter().all(|enc| is_direct_code(enc));

    Ok(PreparedCall {
        selector: sel,
        selector_name: selector.to_string(),
        return_enc,
        arg_encs,
        expected_args,
        fast_path,
        signature,
        direct_interface: OnceLock::new(),
    })
}

fn method_type_encoding(class: sys::Class, sel: SEL) -> Option<String> {
    let mut method = unsafe { sys::class_getInstanceMethod(class, sel) };
    if method.is_null() {
        method = unsafe { sys::class_getClassMethod(class, sel) };
    }
    if method.is_null() {
        return None;
    }
    let types = unsafe { sys::method_getTypeEncoding(method) };
    if types.is_null() {
        return None;
    }
    Some(
        unsafe { std::ffi::CStr::from_ptr(types) }
            .to_string_lossy()
            .into_owned(),
    )
}

/// Send a message, preparing (or reusing) the call plan.
pub fn send(receiver: &Value, selector: &str, args: &[Value]) -> Result<Value, BridgeError> {
    let target = handle::object_ptr(receiver)?;
    if target.is_null() {
        // messaging nil: every message answers nil
        return Ok(Value::Null);
    }
    let plan = prepare(receiver, selector)?;
    send_prepared(receiver, &plan, args)
}

/// The hot path: dispatch with an existing plan. Produces exactly the same
/// results as [`send`] for the same inputs.
pub fn send_prepared(
    receiver: &Value,
    plan: &PreparedCall,
    args: &[Value],
) -> Result<Value, BridgeError> {
    let target = handle::object_ptr(receiver)?;
    if target.is_null() {
        return Ok(Value::Null);
    }
    if args.len() != plan.expected_args {
        return Err(BridgeError::Arity {
            context: plan.selector_name.clone(),
            expected: plan.expected_args,
            got: args.len(),
        });
    }

    if plan.fast_path {
        send_direct(target, plan, args)
    } else {
        send_invocation(target, plan, args)
    }
}

/// Direct mode: a concrete-signature libffi call on `objc_msgSend`.
fn send_direct(target: id, plan: &PreparedCall, args: &[Value]) -> Result<Value, BridgeError> {
    let interface = match plan.direct_interface.get() {
        Some(interface) => interface,
        None => {
            let mut encs: Vec<&str> = Vec::with_capacity(args.len() + 2);
            encs.push("@");
            encs.push(":");
            encs.extend(plan.arg_encs.iter().map(String::as_str));
            let built = CallInterface::prepare(&plan.return_enc, &encs, None)?;
            plan.direct_interface.get_or_init(|| built)
        }
    };

    let mut keep = KeepAlive::new();
    let mut self_buf = target;
    let mut sel_buf = plan.selector;
    let mut buffers: Vec<Box<[u8]>> = Vec::with_capacity(args.len());
    let mut arg_ptrs: Vec<*mut c_void> = Vec::with_capacity(args.len() + 2);
    arg_ptrs.push(&mut self_buf as *mut id as *mut c_void);
    arg_ptrs.push(&mut sel_buf as *mut SEL as *mut c_void);

    for (index, (value, enc)) in args.iter().zip(&plan.arg_encs).enumerate() {
        let (size, _) = encoding::size_and_alignment(enc)?;
        let mut buffer = vec![0u8; size.max(1)].into_boxed_slice();
        marshal::write_value(
            &mut buffer,
            enc,
            value,
            &mut keep,
            &plan.selector_name,
            index,
        )?;
        arg_ptrs.push(buffer.as_mut_ptr() as *mut c_void);
        buffers.push(buffer);
    }

    let ret_size = return_cell_size(&plan.return_enc)?;
    let mut ret_buffer = vec![0u8; ret_size.max(1)];
    unsafe {
        interface.call(
            CodePtr(sys::objc_msgSend as *mut c_void),
            &mut arg_ptrs,
            ret_buffer.as_mut_ptr() as *mut c_void,
        );
    }
    drop(keep);

    if ret_size == 0 {
        return Ok(Value::Undefined);
    }
    marshal::read_value(&ret_buffer, &plan.return_enc)
}

/// Invocation mode: required for struct returns or arguments and for
/// out-parameters.
fn send_invocation(target: id, plan: &PreparedCall, args: &[Value]) -> Result<Value, BridgeError> {
    let invocation =
        Invocation::with_signature(&plan.signature).ok_or(BridgeError::FfiFailure {
            stage: "invocation_alloc",
        })?;
    invocation.set_target(target);
    invocation.set_selector(plan.selector);

    // Argument buffers (and everything they point into) stay alive until
    // after invoke.
    let mut keep = KeepAlive::new();
    let mut buffers: Vec<Box<[u8]>> = Vec::with_capacity(args.len());
    let mut out_indices: Vec<usize> = Vec::new();

    for (index, (value, enc)) in args.iter().zip(&plan.arg_encs).enumerate() {
        let simplified = encoding::simplify(enc);
        let mut buffer = if simplified.starts_with("^@") && value.is_nullish() {
            // caller-declared out-parameter slot
            let mut slot = vec![0u8; 8].into_boxed_slice();
            marshal::write_out_slot(&mut slot, &mut keep);
            out_indices.push(keep.out_slots().len() - 1);
            slot
        } else {
            let (size, _) = encoding::size_and_alignment(enc)?;
            let mut plain = vec![0u8; size.max(1)].into_boxed_slice();
            marshal::write_value(
                &mut plain,
                enc,
                value,
                &mut keep,
                &plan.selector_name,
                index,
            )?;
            plain
        };
        invocation.set_argument(index + 2, buffer.as_mut_ptr() as *mut c_void);
        buffers.push(buffer);
    }

    invocation.invoke();

    let result = if encoding::simplify(&plan.return_enc).starts_with('v') {
        Value::Undefined
    } else {
        let ret_size = return_cell_size(&plan.return_enc)?;
        let mut ret_buffer = vec![0u8; ret_size];
        invocation.get_return_value(ret_buffer.as_mut_ptr() as *mut c_void);
        marshal::read_value(&ret_buffer, &plan.return_enc)?
    };

    // Out-params read back after invoke, surfaced alongside the return.
    if out_indices.is_empty() {
        drop(keep);
        return Ok(result);
    }
    let outs: Vec<Value> = out_indices
        .iter()
        .map(|&slot| handle::wrap_raw(keep.out_slots()[slot].stored_object()))
        .collect();
    drop(keep);
    Ok(Value::Object(vec![
        ("return".to_string(), result),
        ("out".to_string(), Value::Array(outs)),
    ]))
}

fn register(selector: &str) -> Result<SEL, BridgeError> {
    sys::selector(selector).ok_or_else(|| BridgeError::UnknownSelector {
        name: selector.to_string(),
    })
}
