//! Host-defined subclasses with method overrides and a super-call path.
//!
//! Declared overrides are installed as `_objc_msgForward` stubs so ordinary
//! dispatch lands in the forwarding shim instead of the inherited
//! implementation; the shim routes to the host callback recorded in the
//! subclass registry. `call_super` is the one way back up: a libffi call on
//! `objc_msgSendSuper` with the superclass pinned.

#![cfg(target_vendor = "apple")]

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::sync::Arc;

use host::{CallbackQueue, HostFunction, ThreadSafeFunction, Value};
use libffi::middle::CodePtr;

use crate::error::BridgeError;
use crate::ffi::{return_cell_size, CallInterface};
use crate::forwarding;
use crate::handle;
use crate::invocation::MethodSignature;
use crate::marshal::{self, KeepAlive};
use crate::registry::{self, MethodOverride, SubclassImpl};
use crate::sys::{self, SEL};

extern "C" {
    /// The runtime's forwarding stub; installing it as an IMP makes normal
    /// dispatch take the full forwarding path.
    fn _objc_msgForward();
}

/// One declared method of a host-defined class.
pub struct MethodSpec {
    pub function: HostFunction,
    /// Explicit encoding; omitted for overrides, where the superclass's
    /// encoding is authoritative.
    pub types: Option<String>,
    pub is_class_method: bool,
}

/// Declaration of a new class.
pub struct ClassSpec {
    pub name: String,
    pub superclass: String,
    pub protocols: Vec<String>,
    /// selector name → implementation
    pub methods: HashMap<String, MethodSpec>,
    pub cross_context: bool,
}

/// Define and register the class; returns a handle to the class object.
/// The class (and its registry entry) lives for the process.
pub fn define_class(spec: ClassSpec) -> Result<Value, BridgeError> {
    let superclass =
        sys::lookup_class(&spec.superclass).ok_or_else(|| BridgeError::UnknownClass {
            name: spec.superclass.clone(),
        })?;

    let c_name = CString::new(spec.name.as_str()).map_err(|_| BridgeError::UnknownClass {
        name: spec.name.clone(),
    })?;
    let class = unsafe { sys::objc_allocateClassPair(superclass, c_name.as_ptr(), 0) };
    if class.is_null() {
        return Err(BridgeError::Fatal {
            message: format!("class '{}' already exists", spec.name),
        });
    }

    for protocol_name in &spec.protocols {
        let c_protocol = CString::new(protocol_name.as_str()).map_err(|_| {
            BridgeError::UnknownProtocol {
                name: protocol_name.clone(),
            }
        })?;
        let protocol = unsafe { sys::objc_getProtocol(c_protocol.as_ptr()) };
        if protocol.is_null() {
            return Err(BridgeError::UnknownProtocol {
                name: protocol_name.clone(),
            });
        }
        unsafe { sys::class_addProtocol(class, protocol) };
    }

    forwarding::install_shim(class)?;
    let metaclass = unsafe { sys::object_getClass(class) };
    let has_class_methods = spec.methods.values().any(|m| m.is_class_method);
    if has_class_methods {
        forwarding::install_class_shim(metaclass)?;
    }

    let queue = CallbackQueue::current();
    let home_thread = queue.home_thread();
    let mut methods = HashMap::with_capacity(spec.methods.len());
    for (selector_name, method) in spec.methods {
        let sel = selector(&selector_name)?;
        let encoding = resolve_method_encoding(superclass, sel, &method)?;

        // dispatch must reach forwardInvocation:, not the inherited IMP
        install_forward_stub(
            if method.is_class_method { metaclass } else { class },
            sel,
            &encoding,
        )?;

        methods.insert(
            selector_name,
            MethodOverride {
                tsfn: ThreadSafeFunction::new(method.function, queue.clone()),
                encoding,
                is_class_method: method.is_class_method,
            },
        );
    }

    unsafe { sys::objc_registerClassPair(class) };

    let entry = Arc::new(SubclassImpl {
        class_name: spec.name,
        class_ptr: class as usize,
        superclass_ptr: superclass as usize,
        methods,
        home_thread,
        cross_context: spec.cross_context,
    });
    // instance methods key on the class, class methods on the metaclass
    registry::subclasses().register(class as usize, entry.clone());
    registry::subclasses().register(metaclass as usize, entry);

    Ok(handle::wrap_object(class))
}

fn resolve_method_encoding(
    superclass: sys::Class,
    sel: SEL,
    method: &MethodSpec,
) -> Result<String, BridgeError> {
    if let Some(types) = &method.types {
        return Ok(types.clone());
    }
    // override: inherit the superclass's encoding
    let inherited = if method.is_class_method {
        unsafe { sys::class_getClassMethod(superclass, sel) }
    } else {
        unsafe { sys::class_getInstanceMethod(superclass, sel) }
    };
    if !inherited.is_null() {
        let types = unsafe { sys::method_getTypeEncoding(inherited) };
        if !types.is_null() {
            return Ok(unsafe { std::ffi::CStr::from_ptr(types) }
                .to_string_lossy()
                .into_owned());
        }
    }
    Err(BridgeError::UnsupportedEncoding {
        encoding: format!("(no declared types for {})", sys::selector_name(sel)),
    })
}

fn install_forward_stub(class: sys::Class, sel: SEL, encoding: &str) -> Result<(), BridgeError> {
    let c_encoding = CString::new(encoding).map_err(|_| BridgeError::UnsupportedEncoding {
        encoding: encoding.to_string(),
    })?;
    let imp: sys::Imp = unsafe { std::mem::transmute(_objc_msgForward as *const c_void) };
    let added = unsafe { sys::class_addMethod(class, sel, imp, c_encoding.as_ptr()) };
    if added == sys::NO {
        return Err(BridgeError::FfiFailure {
            stage: "class_addMethod",
        });
    }
    Ok(())
}

/// Entry point for super calls: `objc_msgSendSuper`, or the struct-return
/// variant on x86_64 when the return needs the hidden-pointer convention.
fn super_entry_point(return_enc: &str) -> *mut c_void {
    #[cfg(target_arch = "x86_64")]
    {
        if let Ok((size, _)) = encoding::size_and_alignment(return_enc) {
            if encoding::is_struct(return_enc) && size > 16 {
                return sys::objc_msgSendSuper_stret as *mut c_void;
            }
        }
    }
    let _ = return_enc;
    sys::objc_msgSendSuper as *mut c_void
}

/// Invoke the superclass implementation of an overridden method. This is
/// the only route from host code to the inherited behavior.
pub fn call_super(receiver: &Value, selector_name: &str, args: &[Value]) -> Result<Value, BridgeError> {
    let target = handle::object_ptr(receiver)?;
    if target.is_null() {
        return Ok(Value::Null);
    }
    let sel = selector(selector_name)?;

    let class = unsafe { sys::object_getClass(target) };
    let entry = registry::subclasses()
        .lookup_in_hierarchy(class as usize, |cls| unsafe {
            sys::class_getSuperclass(cls as *mut c_void) as usize
        })
        .ok_or_else(|| BridgeError::UnknownClass {
            name: sys::class_name(class),
        })?;
    let superclass = entry.superclass_ptr as sys::Class;

    let signature =
        MethodSignature::for_instance_method(superclass, sel).ok_or_else(|| {
            BridgeError::DoesNotRespond {
                class: sys::class_name(superclass),
                selector: selector_name.to_string(),
            }
        })?;

    let expected = signature.number_of_arguments().saturating_sub(2);
    if args.len() != expected {
        return Err(BridgeError::Arity {
            context: selector_name.to_string(),
            expected,
            got: args.len(),
        });
    }

    let return_enc = signature.return_type();
    let full_enc = full_method_encoding(superclass, sel);

    // slot 0 is the objc_super pointer, slot 1 the selector
    let mut arg_encs: Vec<String> = vec!["^v".to_string(), ":".to_string()];
    for slot in 2..signature.number_of_arguments() {
        let enc = match &full_enc {
            Some(full) => encoding::method_argument(full, slot)?
                .map(str::to_string)
                .unwrap_or_else(|| signature.argument_type(slot)),
            None => signature.argument_type(slot),
        };
        arg_encs.push(enc);
    }
    let enc_refs: Vec<&str> = arg_encs.iter().map(String::as_str).collect();
    let interface = CallInterface::prepare(&return_enc, &enc_refs, None)?;

    let mut super_struct = sys::objc_super {
        receiver: target,
        super_class: superclass,
    };
    let mut super_ptr = &mut super_struct as *mut sys::objc_super;
    let mut sel_value = sel;

    let mut keep = KeepAlive::new();
    let mut buffers: Vec<Box<[u8]>> = Vec::new();
    let mut out_indices: Vec<usize> = Vec::new();
    let mut arg_ptrs: Vec<*mut c_void> = Vec::with_capacity(arg_encs.len());
    arg_ptrs.push(&mut super_ptr as *mut *mut sys::objc_super as *mut c_void);
    arg_ptrs.push(&mut sel_value as *mut SEL as *mut c_void);

    for (index, (value, enc)) in args.iter().zip(&arg_encs[2..]).enumerate() {
        let simplified = encoding::simplify(enc);
        let mut buffer = if simplified.starts_with("^@") && value.is_nullish() {
            let mut slot = vec![0u8; 8].into_boxed_slice();
            marshal::write_out_slot(&mut slot, &mut keep);
            out_indices.push(keep.out_slots().len() - 1);
            slot
        } else {
            let (size, _) = encoding::size_and_alignment(enc)?;
            let mut plain = vec![0u8; size.max(1)].into_boxed_slice();
            marshal::write_value(&mut plain, enc, value, &mut keep, selector_name, index)?;
            plain
        };
        arg_ptrs.push(buffer.as_mut_ptr() as *mut c_void);
        buffers.push(buffer);
    }

    let ret_size = return_cell_size(&return_enc)?;
    let mut ret_buffer = vec![0u8; ret_size.max(1)];
    unsafe {
        interface.call(
            CodePtr(super_entry_point(&return_enc)),
            &mut arg_ptrs,
            ret_buffer.as_mut_ptr() as *mut c_void,
        );
    }

    let result = if ret_size == 0 {
        Value::Undefined
    } else {
        marshal::read_value(&ret_buffer, &return_enc)?
    };

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

fn full_method_encoding(class: sys::Class, sel: SEL) -> Option<String> {
    let method = unsafe { sys::class_getInstanceMethod(class, sel) };
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

fn selector(name: &str) -> Result<SEL, BridgeError> {
    sys::selector(name).ok_or_else(|| BridgeError::UnknownSelector {
        name: name.to_string(),
    })
}
