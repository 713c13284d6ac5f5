//! Type encodings to libffi call interfaces.
//!
//! All dynamic calls — C functions, the raw message-send entry points, super
//! calls and block invokes — go through libffi with a CIF built from the
//! runtime's type encodings. Struct encodings become `Type::structure`
//! values whose element arrays are owned by the returned `Type`, so keeping
//! the [`CallInterface`] alive keeps every libffi type alive.

use std::ffi::c_void;

use libffi::low;
use libffi::middle::{CodePtr, Type};
use libffi::raw;

use encoding::{parse_struct, simplify};

use crate::error::BridgeError;

/// Minimum byte size of a return cell: libffi requires at least a register's
/// worth of space even for narrow returns.
pub const MIN_RETURN_CELL: usize = 16;

/// Map one encoding to its libffi type.
pub fn ffi_type_for(enc: &str) -> Result<Type, BridgeError> {
    let enc = simplify(enc);
    let Some(first) = enc.as_bytes().first() else {
        return Err(BridgeError::UnsupportedEncoding {
            encoding: enc.to_string(),
        });
    };

    Ok(match first {
        b'c' => Type::i8(),
        b'C' | b'B' => Type::u8(),
        b's' => Type::i16(),
        b'S' => Type::u16(),
        b'i' => Type::i32(),
        b'I' => Type::u32(),
        b'l' | b'q' => Type::i64(),
        b'L' | b'Q' => Type::u64(),
        b'f' => Type::f32(),
        b'd' => Type::f64(),
        b'@' | b'#' | b':' | b'*' | b'^' | b'?' => Type::pointer(),
        b'v' => Type::void(),
        b'{' | b'(' => aggregate_type(enc)?,
        b'[' => array_type(enc)?,
        _ => {
            return Err(BridgeError::UnsupportedEncoding {
                encoding: enc.to_string(),
            })
        }
    })
}

/// Struct (and union — libffi has no union kind, so members are laid out as
/// a struct, matching how such arguments are passed in practice).
fn aggregate_type(enc: &str) -> Result<Type, BridgeError> {
    let parsed = parse_struct(enc)?;
    if parsed.fields.is_empty() {
        return Err(BridgeError::UnsupportedEncoding {
            encoding: enc.to_string(),
        });
    }
    let mut elements = Vec::with_capacity(parsed.fields.len());
    for field in &parsed.fields {
        elements.push(ffi_type_for(&field.encoding)?);
    }
    Ok(Type::structure(elements))
}

/// `[NT]` — libffi models fixed arrays inside aggregates as N elements.
fn array_type(enc: &str) -> Result<Type, BridgeError> {
    let inner = &enc[1..enc.len() - 1];
    let elem_start = inner
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| BridgeError::UnsupportedEncoding {
            encoding: enc.to_string(),
        })?;
    let count: usize =
        inner[..elem_start]
            .parse()
            .map_err(|_| BridgeError::UnsupportedEncoding {
                encoding: enc.to_string(),
            })?;
    let elem = ffi_type_for(&inner[elem_start..])?;
    Ok(Type::structure(std::iter::repeat(elem).take(count)))
}

// ── Call interfaces ──────────────────────────────────────────────────

/// A prepared call interface. Owns its argument/return [`Type`]s so the raw
/// element arrays stay valid for the lifetime of the interface.
pub struct CallInterface {
    raw_cif: low::ffi_cif,
    // Held for ownership of libffi's element arrays; the raw cif points into
    // these allocations.
    _ret: Type,
    _args: Vec<Type>,
    _arg_ptrs: Vec<*mut raw::ffi_type>,
}

// The raw cif only references heap allocations owned by the fields above.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl CallInterface {
    /// Prepare a CIF from encodings. `fixed_args` switches to the variadic
    /// calling convention when it names fewer arguments than provided.
    pub fn prepare(
        ret_enc: &str,
        arg_encs: &[&str],
        fixed_args: Option<usize>,
    ) -> Result<CallInterface, BridgeError> {
        let ret = ffi_type_for(ret_enc)?;
        let args: Vec<Type> = arg_encs
            .iter()
            .map(|enc| ffi_type_for(enc))
            .collect::<Result<_, _>>()?;
        let mut arg_ptrs: Vec<*mut raw::ffi_type> =
            args.iter().map(|t| t.as_raw_ptr()).collect();

        let mut raw_cif: low::ffi_cif = unsafe { std::mem::zeroed() };
        let status = unsafe {
            match fixed_args {
                Some(fixed) if fixed < args.len() => low::prep_cif_var(
                    &mut raw_cif,
                    low::ffi_abi_FFI_DEFAULT_ABI,
                    fixed,
                    args.len(),
                    ret.as_raw_ptr(),
                    arg_ptrs.as_mut_ptr(),
                ),
                _ => low::prep_cif(
                    &mut raw_cif,
                    low::ffi_abi_FFI_DEFAULT_ABI,
                    args.len(),
                    ret.as_raw_ptr(),
                    arg_ptrs.as_mut_ptr(),
                ),
            }
        };
        status.map_err(|_| BridgeError::FfiFailure {
            stage: "prep_cif",
        })?;

        Ok(CallInterface {
            raw_cif,
            _ret: ret,
            _args: args,
            _arg_ptrs: arg_ptrs,
        })
    }

    pub fn arg_count(&self) -> usize {
        self._args.len()
    }

    pub fn cif_ptr(&self) -> *mut low::ffi_cif {
        &self.raw_cif as *const low::ffi_cif as *mut low::ffi_cif
    }

    /// Perform the call. `arg_values[i]` must point at the i-th argument's
    /// storage; `ret` must be at least [`MIN_RETURN_CELL`] bytes (or the
    /// struct size for aggregate returns).
    ///
    /// # Safety
    ///
    /// `code` must be callable with exactly this interface's signature and
    /// every pointer must reference live, correctly-sized storage.
    pub unsafe fn call(
        &self,
        code: CodePtr,
        arg_values: &mut [*mut c_void],
        ret: *mut c_void,
    ) {
        raw::ffi_call(
            self.cif_ptr(),
            Some(*code.as_safe_fun()),
            ret,
            arg_values.as_mut_ptr(),
        );
    }
}

/// Return-buffer size for an encoding: the natural size, padded up to the
/// libffi minimum cell.
pub fn return_cell_size(enc: &str) -> Result<usize, BridgeError> {
    let enc = simplify(enc);
    if enc.starts_with('v') {
        return Ok(0);
    }
    let (size, _) = encoding::size_and_alignment(enc)?;
    Ok(size.max(MIN_RETURN_CELL))
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn sum3(a: i64, b: i64, c: i64) -> i64 {
        a + b + c
    }

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Pair {
        x: f64,
        y: f64,
    }

    unsafe extern "C" fn pair_swap(p: Pair) -> Pair {
        Pair { x: p.y, y: p.x }
    }

    #[test]
    fn scalar_cif_roundtrip() {
        let cif =
            CallInterface::prepare("q", &["q", "q", "q"], None).expect("prepare");
        let (mut a, mut b, mut c) = (1i64, 2i64, 39i64);
        let mut args: Vec<*mut c_void> = vec![
            &mut a as *mut i64 as *mut c_void,
            &mut b as *mut i64 as *mut c_void,
            &mut c as *mut i64 as *mut c_void,
        ];
        let mut ret = [0u8; MIN_RETURN_CELL];
        unsafe {
            cif.call(
                CodePtr(sum3 as *mut c_void),
                &mut args,
                ret.as_mut_ptr() as *mut c_void,
            );
        }
        assert_eq!(i64::from_ne_bytes(ret[..8].try_into().expect("8 bytes")), 42);
    }

    #[test]
    fn struct_cif_roundtrip() {
        let cif = CallInterface::prepare(
            "{CGPoint=dd}",
            &["{CGPoint=dd}"],
            None,
        )
        .expect("prepare");
        let mut input = Pair { x: 1.0, y: 2.0 };
        let mut args: Vec<*mut c_void> = vec![&mut input as *mut Pair as *mut c_void];
        let mut ret = Pair { x: 0.0, y: 0.0 };
        unsafe {
            cif.call(
                CodePtr(pair_swap as *mut c_void),
                &mut args,
                &mut ret as *mut Pair as *mut c_void,
            );
        }
        assert_eq!(ret, Pair { x: 2.0, y: 1.0 });
    }

    #[test]
    fn unsupported_encodings_fail_preparation() {
        assert!(matches!(
            CallInterface::prepare("b8", &[], None),
            Err(BridgeError::UnsupportedEncoding { .. })
        ));
        assert!(matches!(
            ffi_type_for("{Opaque}"),
            Err(BridgeError::UnsupportedEncoding { .. })
        ));
    }

    #[test]
    fn return_cell_sizes() {
        assert_eq!(return_cell_size("v").expect("void"), 0);
        assert_eq!(return_cell_size("c").expect("char"), MIN_RETURN_CELL);
        assert_eq!(
            return_cell_size("{CGRect={CGPoint=dd}{CGSize=dd}}").expect("rect"),
            32
        );
    }
}
