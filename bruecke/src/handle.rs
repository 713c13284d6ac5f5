//! Retained Objective-C object handles.
//!
//! A handle owns exactly one strong reference: wrapping retains, and the
//! cell's release hook releases exactly once when the host drops the last
//! clone. nil never becomes a handle — the host sees `Null`.

use std::ffi::c_void;

use host::{ForeignCell, Value};

use crate::error::BridgeError;
use crate::sys;

/// Wrap an object pointer the bridge has just produced, taking a strong
/// reference. Returns `Null` for nil.
pub fn wrap_object(obj: sys::id) -> Value {
    if obj.is_null() {
        return Value::Null;
    }
    sys::retain(obj);
    Value::Foreign(ForeignCell::new(obj, Some(Box::new(sys::release))))
}

/// Wrap an object the bridge already owns one reference to (alloc/init or
/// copy results): no extra retain, the release hook drops the owned
/// reference when the host lets go.
pub fn adopt_object(obj: sys::id) -> Value {
    if obj.is_null() {
        return Value::Null;
    }
    Value::Foreign(ForeignCell::new(obj, Some(Box::new(sys::release))))
}

/// Wrap a pointer read out of an ABI buffer. On Apple targets this retains
/// like [`wrap_object`]; elsewhere there is no runtime to count against and
/// the cell is a plain borrow.
#[cfg(target_vendor = "apple")]
pub fn wrap_raw(ptr: *mut c_void) -> Value {
    wrap_object(ptr)
}

#[cfg(not(target_vendor = "apple"))]
pub fn wrap_raw(ptr: *mut c_void) -> Value {
    if ptr.is_null() {
        Value::Null
    } else {
        Value::Foreign(ForeignCell::borrowed(ptr))
    }
}

/// Extract the object pointer a handle carries. `Null`/`Undefined` are nil.
pub fn object_ptr(value: &Value) -> Result<sys::id, BridgeError> {
    match value {
        Value::Undefined | Value::Null => Ok(sys::nil),
        Value::Foreign(cell) => Ok(cell.as_ptr()),
        other => Err(BridgeError::InvalidArgument {
            context: "receiver".to_string(),
            index: 0,
            expected: "@".to_string(),
            actual: other.kind(),
        }),
    }
}

/// Numeric pointer value of a handle, for diagnostics only. The number must
/// never be turned back into a pointer that outlives the handle.
pub fn pointer_value(value: &Value) -> Option<usize> {
    match value {
        Value::Foreign(cell) => Some(cell.addr()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_never_becomes_a_handle() {
        assert_eq!(wrap_object(sys::nil), Value::Null);
        assert_eq!(wrap_raw(std::ptr::null_mut()), Value::Null);
    }

    #[test]
    fn object_ptr_accepts_nullish() {
        assert_eq!(object_ptr(&Value::Null).expect("null"), sys::nil);
        assert_eq!(object_ptr(&Value::Undefined).expect("undefined"), sys::nil);
        assert!(object_ptr(&Value::Number(1.0)).is_err());
    }

    #[test]
    fn pointer_value_reports_the_address() {
        let value = wrap_raw(0xbeef as *mut c_void);
        assert_eq!(pointer_value(&value), Some(0xbeef));
        assert_eq!(pointer_value(&Value::Null), None);
    }
}
