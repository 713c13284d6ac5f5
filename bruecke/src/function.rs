//! C function calls through the dynamic loader.
//!
//! Symbols come out of whatever images the process has loaded (frameworks
//! are loaded by the embedder before calling in); the call itself is a
//! libffi CIF built from the declared encodings, fixed or variadic.

use std::ffi::c_void;

use host::Value;
use libffi::middle::CodePtr;

use crate::error::BridgeError;
use crate::ffi::{return_cell_size, CallInterface};
use crate::marshal::{self, KeepAlive};
use crate::sys;

/// Call a named C function.
///
/// `fixed_args` selects the variadic calling convention when it names fewer
/// arguments than `arg_encs` declares (e.g. `printf`-style tails); pass
/// `None` for ordinary functions.
pub fn call_function(
    name: &str,
    ret_enc: &str,
    arg_encs: &[&str],
    fixed_args: Option<usize>,
    args: &[Value],
) -> Result<Value, BridgeError> {
    let fn_ptr = sys::resolve_symbol(name).ok_or_else(|| BridgeError::SymbolNotFound {
        name: name.to_string(),
    })?;
    call_pointer(fn_ptr, name, ret_enc, arg_encs, fixed_args, args)
}

/// Call a resolved function pointer with the declared signature.
pub fn call_pointer(
    fn_ptr: *mut c_void,
    context: &str,
    ret_enc: &str,
    arg_encs: &[&str],
    fixed_args: Option<usize>,
    args: &[Value],
) -> Result<Value, BridgeError> {
    if args.len() != arg_encs.len() {
        return Err(BridgeError::Arity {
            context: context.to_string(),
            expected: arg_encs.len(),
            got: args.len(),
        });
    }

    let interface = CallInterface::prepare(ret_enc, arg_encs, fixed_args)?;

    // Each argument gets its own buffer; keep-alives (strings, out cells)
    // must live until after the call returns.
    let mut keep = KeepAlive::new();
    let mut buffers: Vec<Box<[u8]>> = Vec::with_capacity(args.len());
    for (index, (value, enc)) in args.iter().zip(arg_encs).enumerate() {
        let (size, _) = encoding::size_and_alignment(enc)?;
        if size == 0 {
            return Err(BridgeError::UnsupportedEncoding {
                encoding: enc.to_string(),
            });
        }
        let mut buffer = vec![0u8; size].into_boxed_slice();
        marshal::write_value(&mut buffer, enc, value, &mut keep, context, index)?;
        buffers.push(buffer);
    }
    let mut arg_ptrs: Vec<*mut c_void> = buffers
        .iter_mut()
        .map(|b| b.as_mut_ptr() as *mut c_void)
        .collect();

    let ret_size = return_cell_size(ret_enc)?;
    let mut ret_buffer = vec![0u8; ret_size.max(1)];

    unsafe {
        interface.call(
            CodePtr(fn_ptr),
            &mut arg_ptrs,
            ret_buffer.as_mut_ptr() as *mut c_void,
        );
    }
    drop(keep);

    if ret_size == 0 {
        return Ok(Value::Undefined);
    }
    marshal::read_value(&ret_buffer, ret_enc)
}
