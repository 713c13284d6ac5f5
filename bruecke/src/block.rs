//! Host functions as Objective-C blocks.
//!
//! A block is a heap object whose `invoke` slot is a function pointer; here
//! that pointer is a libffi closure whose trampoline converts the raw
//! arguments, routes onto the host thread, and writes the return value
//! back. The closure/trampoline half is portable; only the block literal
//! (`isa`, `_Block_copy`) needs the Apple block runtime.
//!
//! Lifetime: created blocks are appended to the global registry and never
//! freed. Foreign code may stash a block copy and invoke it arbitrarily
//! late; nothing tells the bridge when the last copy dies.

use std::ffi::c_void;
use std::sync::Arc;

use encoding::{parse_block_signature, simplify, BlockSignature};
use host::{HostFunction, ThreadSafeFunction, Value};
use libffi::low;
use libffi::middle::CodePtr;
use tracing::warn;

use crate::dispatch::{self, SendPtr};
use crate::error::BridgeError;
use crate::ffi::CallInterface;
use crate::marshal::{self, KeepAlive};
use crate::registry;

#[cfg(target_vendor = "apple")]
use bitflags::bitflags;

#[cfg(target_vendor = "apple")]
bitflags! {
    /// Flag word of a block literal. This bridge emits flag-free blocks:
    /// no copy/dispose helpers (nothing ObjC-managed is captured — the host
    /// root lives in the registry) and no descriptor signature field.
    #[derive(Clone, Copy)]
    pub struct BlockFlags: i32 {
        const HAS_COPY_DISPOSE = 1 << 25;
        const IS_GLOBAL = 1 << 28;
        const HAS_STRET = 1 << 29;
        const HAS_SIGNATURE = 1 << 30;
    }
}

/// Parameter kind `?`: no declared encoding, converted heuristically.
const INFERRED: &str = "?";

// ── Trampoline state ─────────────────────────────────────────────────

struct TrampolineData {
    return_type: String,
    return_size: usize,
    param_types: Vec<String>,
    tsfn: ThreadSafeFunction,
    cross_context: bool,
}

/// A host function behind a libffi closure with the block-invoke shape
/// (`ret (blockSelf, params...)`). The code pointer is what goes into a
/// block literal's `invoke` slot.
pub struct JsClosure {
    closure: *mut low::ffi_closure,
    code: CodePtr,
    // Referenced by the prepared closure; dropping either invalidates the
    // code pointer, which is why BlockInfo is never freed once registered.
    _data: Box<TrampolineData>,
    _interface: CallInterface,
}

unsafe impl Send for JsClosure {}
unsafe impl Sync for JsClosure {}

impl JsClosure {
    pub fn new(
        tsfn: ThreadSafeFunction,
        signature: BlockSignature,
        cross_context: bool,
    ) -> Result<JsClosure, BridgeError> {
        let return_size = if signature.return_type.starts_with('v') {
            0
        } else {
            encoding::size_and_alignment(&signature.return_type)
                .map(|(size, _)| size)
                .unwrap_or(std::mem::size_of::<usize>())
        };

        // arg 0 is the block literal itself
        let mut arg_encs: Vec<&str> = vec!["^v"];
        arg_encs.extend(signature.param_types.iter().map(|s| s.as_str()));
        let interface = CallInterface::prepare(&signature.return_type, &arg_encs, None)?;

        let data = Box::new(TrampolineData {
            return_type: signature.return_type,
            return_size,
            param_types: signature.param_types,
            tsfn,
            cross_context,
        });

        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(BridgeError::FfiFailure {
                stage: "closure_alloc",
            });
        }
        let prepared = unsafe {
            low::prep_closure(
                closure,
                interface.cif_ptr(),
                block_trampoline,
                &*data as *const TrampolineData,
                code,
            )
        };
        if prepared.is_err() {
            unsafe { low::closure_free(closure) };
            return Err(BridgeError::FfiFailure {
                stage: "prep_closure",
            });
        }

        Ok(JsClosure {
            closure,
            code,
            _data: data,
            _interface: interface,
        })
    }

    /// The executable entry point — a C function pointer with the block
    /// invoke convention.
    pub fn code_ptr(&self) -> *const c_void {
        self.code.as_ptr() as *const c_void
    }
}

impl Drop for JsClosure {
    fn drop(&mut self) {
        unsafe { low::closure_free(self.closure) };
    }
}

unsafe extern "C" fn block_trampoline(
    _cif: &low::ffi_cif,
    result: &mut c_void,
    args: *const *const c_void,
    userdata: &TrampolineData,
) {
    let ret_ptr = result as *mut c_void as *mut u8;
    // libffi does not zero the return cell; errors must leave it nil/zero.
    if userdata.return_size > 0 {
        std::ptr::write_bytes(ret_ptr, 0, userdata.return_size);
    }

    // args[0] is block self; user parameters start at 1.
    let mut param_ptrs = Vec::with_capacity(userdata.param_types.len());
    for i in 0..userdata.param_types.len() {
        param_ptrs.push(SendPtr(*args.add(i + 1) as *mut u8));
    }

    let ret = SendPtr(ret_ptr);
    let param_types = userdata.param_types.clone();
    let return_type = userdata.return_type.clone();
    let return_size = userdata.return_size;
    let function = userdata.tsfn.function().clone();

    dispatch::run_on_host(&userdata.tsfn, userdata.cross_context, move || {
        let mut host_args = Vec::with_capacity(param_types.len());
        for (enc, ptr) in param_types.iter().zip(&param_ptrs) {
            host_args.push(convert_block_arg(ptr.get(), enc));
        }

        let result = dispatch::call_logging_errors(&function, &host_args, "block invoke");

        if return_size == 0 {
            return;
        }
        if let Some(value) = result {
            let ret_slice =
                unsafe { std::slice::from_raw_parts_mut(ret.get(), return_size) };
            let mut keep = KeepAlive::new();
            if let Err(err) =
                marshal::write_value(ret_slice, &return_type, &value, &mut keep, "block", 0)
            {
                warn!(%err, "block return value dropped");
            }
            // Anything the written return points into has to outlive the
            // caller; it leaks with the block (v1 block lifetime policy).
            std::mem::forget(keep);
        }
    });
}

/// Convert one raw block argument to a host value.
fn convert_block_arg(ptr: *mut u8, enc: &str) -> Value {
    let enc = simplify(enc);
    if enc == INFERRED {
        let word = unsafe { (ptr as *const usize).read_unaligned() };
        return convert_inferred_word(word);
    }

    let size = match encoding::size_and_alignment(enc) {
        Ok((size, _)) if size > 0 => size,
        _ => return Value::Undefined,
    };
    let slice = unsafe { std::slice::from_raw_parts(ptr, size) };
    marshal::read_value(slice, enc).unwrap_or(Value::Undefined)
}

/// Heuristic for undeclared pointer-sized parameters: decide object vs
/// integer. Callers that need this to be right must provide the extended
/// block encoding; this is a best-effort safety net.
#[cfg(target_vendor = "apple")]
fn convert_inferred_word(word: usize) -> Value {
    if word == 0 {
        // nil object and integer zero are indistinguishable; zero works as
        // both downstream.
        return Value::Number(0.0);
    }
    if looks_like_object(word) {
        crate::handle::wrap_raw(word as *mut c_void)
    } else {
        Value::Number(word as f64)
    }
}

#[cfg(not(target_vendor = "apple"))]
fn convert_inferred_word(word: usize) -> Value {
    Value::Number(word as f64)
}

/// Tagged-pointer bit, heap-zone membership, then a class-pointer probe.
#[cfg(target_vendor = "apple")]
fn looks_like_object(word: usize) -> bool {
    use crate::sys;

    if word & (1 << 63) != 0 {
        return true;
    }
    // small integers and the null page
    if word < 4096 {
        return false;
    }
    let ptr = word as *const c_void;
    if unsafe { sys::malloc_zone_from_ptr(ptr) }.is_null() {
        return false;
    }
    !unsafe { sys::object_getClass(ptr as sys::id) }.is_null()
}

/// Resolve the signature a block will be invoked with: the extended
/// encoding when present, otherwise arity from the host function with every
/// parameter inferred and a void return.
pub fn resolve_signature(
    function: &HostFunction,
    enc: &str,
) -> Result<BlockSignature, BridgeError> {
    if let Some(signature) = parse_block_signature(enc)? {
        return Ok(signature);
    }
    Ok(BlockSignature {
        return_type: "v".to_string(),
        param_types: vec![INFERRED.to_string(); function.arity()],
    })
}

// ── Block construction (Apple) ───────────────────────────────────────

/// `struct Block_descriptor { unsigned long reserved, size; }` — the
/// minimal form: no copy/dispose helpers, no signature string.
#[cfg(target_vendor = "apple")]
#[repr(C)]
struct BlockDescriptor {
    reserved: u64,
    size: u64,
}

#[cfg(target_vendor = "apple")]
#[repr(C)]
struct BlockLiteral {
    isa: *const c_void,
    flags: i32,
    reserved: i32,
    invoke: *const c_void,
    descriptor: *const BlockDescriptor,
}

#[cfg(target_vendor = "apple")]
struct LiteralStorage {
    descriptor: BlockDescriptor,
    literal: BlockLiteral,
}

/// Everything keeping one block alive. Registered and never dropped.
pub struct BlockInfo {
    pub closure: JsClosure,
    #[cfg(target_vendor = "apple")]
    _storage: Box<LiteralStorage>,
    #[cfg(target_vendor = "apple")]
    heap_block: *mut c_void,
}

unsafe impl Send for BlockInfo {}
unsafe impl Sync for BlockInfo {}

impl BlockInfo {
    #[cfg(target_vendor = "apple")]
    pub fn heap_block(&self) -> *mut c_void {
        self.heap_block
    }
}

/// Build a heap block invoking `function`, registered for the life of the
/// process. The result is an `id`-sized pointer usable wherever `@?` is
/// expected.
#[cfg(target_vendor = "apple")]
pub fn create_block(function: HostFunction, enc: &str) -> Result<*mut c_void, BridgeError> {
    let tsfn = ThreadSafeFunction::new(function.clone(), host::CallbackQueue::current());
    create_block_with(tsfn, enc, crate::DEFAULT_CROSS_CONTEXT)
}

#[cfg(target_vendor = "apple")]
pub fn create_block_with(
    tsfn: ThreadSafeFunction,
    enc: &str,
    cross_context: bool,
) -> Result<*mut c_void, BridgeError> {
    use crate::sys;

    let signature = resolve_signature(tsfn.function(), enc)?;
    let closure = JsClosure::new(tsfn, signature, cross_context)?;

    let mut storage = Box::new(LiteralStorage {
        descriptor: BlockDescriptor {
            reserved: 0,
            size: std::mem::size_of::<BlockLiteral>() as u64,
        },
        literal: BlockLiteral {
            isa: std::ptr::null(),
            flags: BlockFlags::empty().bits(),
            reserved: 0,
            invoke: closure.code_ptr(),
            descriptor: std::ptr::null(),
        },
    });
    storage.literal.isa = unsafe { sys::_NSConcreteStackBlock.as_ptr() as *const c_void };
    storage.literal.descriptor = &storage.descriptor;

    let heap_block =
        unsafe { sys::_Block_copy(&storage.literal as *const BlockLiteral as *const c_void) };
    if heap_block.is_null() {
        return Err(BridgeError::FfiFailure {
            stage: "block_copy",
        });
    }

    let info = Arc::new(BlockInfo {
        closure,
        _storage: storage,
        heap_block,
    });
    registry::blocks().register(info);
    Ok(heap_block)
}

/// Public API shape: the block wrapped as an object handle.
#[cfg(target_vendor = "apple")]
pub fn create_block_value(function: HostFunction, enc: &str) -> Result<Value, BridgeError> {
    let block = create_block(function, enc)?;
    Ok(crate::handle::wrap_object(block))
}

/// Off-Apple there is no block runtime; the closure itself is still usable
/// through its code pointer (tests drive the trampoline this way).
#[cfg(not(target_vendor = "apple"))]
pub fn create_closure(
    function: HostFunction,
    enc: &str,
    cross_context: bool,
) -> Result<Arc<BlockInfo>, BridgeError> {
    let tsfn = ThreadSafeFunction::new(function.clone(), host::CallbackQueue::current());
    let signature = resolve_signature(&function, enc)?;
    let closure = JsClosure::new(tsfn, signature, cross_context)?;
    let info = Arc::new(BlockInfo { closure });
    registry::blocks().register(info.clone());
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use host::CallbackQueue;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn make_closure(
        f: impl Fn(&[Value]) -> Result<Value, host::HostError> + Send + Sync + 'static,
        arity: usize,
        enc: &str,
    ) -> JsClosure {
        let function = HostFunction::new(arity, f);
        let tsfn = ThreadSafeFunction::new(function, CallbackQueue::current());
        let signature = resolve_signature(tsfn.function(), enc).expect("signature");
        JsClosure::new(tsfn, signature, false).expect("closure")
    }

    #[test]
    fn closure_invokes_host_function_with_converted_args() {
        let closure = make_closure(
            |args| {
                let a = args[0].as_i64().expect("a");
                let b = args[1].as_i64().expect("b");
                Ok(Value::Number((a * b) as f64))
            },
            2,
            "@?<q@?qq>",
        );

        let invoke: unsafe extern "C" fn(*const c_void, i64, i64) -> i64 =
            unsafe { std::mem::transmute(closure.code_ptr()) };
        let block_self = std::ptr::null();
        assert_eq!(unsafe { invoke(block_self, 6, 7) }, 42);
    }

    #[test]
    fn closure_handles_struct_parameters() {
        let closure = make_closure(
            |args| {
                let x = args[0].get("x").and_then(Value::as_f64).expect("x");
                let y = args[0].get("y").and_then(Value::as_f64).expect("y");
                Ok(Value::Number(x + y))
            },
            1,
            "@?<d@?{CGPoint=dd}>",
        );

        #[repr(C)]
        struct CPoint {
            x: f64,
            y: f64,
        }
        let invoke: unsafe extern "C" fn(*const c_void, CPoint) -> f64 =
            unsafe { std::mem::transmute(closure.code_ptr()) };
        let sum = unsafe { invoke(std::ptr::null(), CPoint { x: 1.5, y: 2.25 }) };
        assert_eq!(sum, 3.75);
    }

    #[test]
    fn callback_error_leaves_return_zeroed() {
        let closure = make_closure(
            |_| Err(host::HostError::new("deliberate failure")),
            0,
            "@?<q@?>",
        );
        let invoke: unsafe extern "C" fn(*const c_void) -> i64 =
            unsafe { std::mem::transmute(closure.code_ptr()) };
        assert_eq!(unsafe { invoke(std::ptr::null()) }, 0);
    }

    #[test]
    fn inferred_signature_uses_function_arity() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let closure = make_closure(
            move |args| {
                assert_eq!(args.len(), 2);
                hits_cb.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Undefined)
            },
            2,
            "@?",
        );
        let invoke: unsafe extern "C" fn(*const c_void, usize, usize) =
            unsafe { std::mem::transmute(closure.code_ptr()) };
        unsafe { invoke(std::ptr::null(), 11, 13) };
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cross_thread_invokes_arrive_in_order() {
        // A `@?<v@?q>` block appending its argument to an array, dispatched
        // serially from a background thread while the home thread drains.
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let function = HostFunction::new(1, move |args| {
            seen_cb.lock().push(args[0].as_i64().expect("argument"));
            Ok(Value::Undefined)
        });
        let queue = CallbackQueue::current();
        let tsfn = ThreadSafeFunction::new(function, queue.clone());
        let signature =
            resolve_signature(tsfn.function(), "@?<v@?q>").expect("signature");
        let closure = JsClosure::new(tsfn, signature, true).expect("closure");

        let invoke: unsafe extern "C" fn(*const c_void, i64) =
            unsafe { std::mem::transmute(closure.code_ptr()) };

        let worker = std::thread::spawn(move || {
            for i in [1i64, 2, 3] {
                unsafe { invoke(std::ptr::null(), i) };
            }
        });

        while seen.lock().len() < 3 {
            queue.drain_for(Duration::from_millis(5));
        }
        worker.join().expect("worker");
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn registry_keeps_created_closures() {
        #[cfg(not(target_vendor = "apple"))]
        {
            let before = registry::blocks().len();
            let function = HostFunction::new(0, |_| Ok(Value::Undefined));
            let _ = CallbackQueue::current();
            let info =
                create_closure(function, "@?<v@?>", true).expect("closure");
            assert!(!info.closure.code_ptr().is_null());
            assert_eq!(registry::blocks().len(), before + 1);
        }
    }
}
