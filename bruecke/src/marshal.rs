//! Value marshalling between the host boundary and raw ABI buffers.
//!
//! Every conversion is driven by a single simplified type code. Writes go
//! into caller-sized buffers laid out exactly as the ABI expects (arguments,
//! invocation slots, struct fields); reads are the mirror image. Transient
//! allocations a call depends on — C strings, out-parameter cells — live in
//! a [`KeepAlive`] that must outlive the call.

use std::ffi::{c_void, CStr, CString};

use encoding::{parse_struct, simplify, ParsedStruct};
use host::Value;

use crate::error::BridgeError;
use crate::handle;

// ── Keep-alive storage ───────────────────────────────────────────────

/// Owner of transient buffers referenced by in-flight call frames.
///
/// A `*` argument's bytes, for example, are only guaranteed for the duration
/// of the call; dropping the KeepAlive before the call completes is a bug in
/// the caller.
#[derive(Default)]
pub struct KeepAlive {
    cstrings: Vec<CString>,
    out_slots: Vec<OutSlot>,
}

impl KeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    fn keep_cstring(&mut self, s: CString) -> *const c_void {
        let ptr = s.as_ptr() as *const c_void;
        self.cstrings.push(s);
        ptr
    }

    /// Allocate an out-parameter cell and return the address that goes into
    /// the argument slot.
    pub fn push_out_slot(&mut self) -> *mut c_void {
        let slot = OutSlot::new();
        let address = slot.slot_address();
        self.out_slots.push(slot);
        address
    }

    pub fn out_slots(&self) -> &[OutSlot] {
        &self.out_slots
    }
}

/// Storage for a `^@` out-parameter: the callee writes an object pointer
/// into the inner cell; the argument slot itself carries the cell's address.
pub struct OutSlot {
    storage: Box<std::cell::UnsafeCell<*mut c_void>>,
}

impl OutSlot {
    fn new() -> Self {
        OutSlot {
            storage: Box::new(std::cell::UnsafeCell::new(std::ptr::null_mut())),
        }
    }

    /// Address of the inner cell — the value passed in the argument slot.
    pub fn slot_address(&self) -> *mut c_void {
        self.storage.get() as *mut c_void
    }

    /// The object pointer stored by the callee (nil if untouched).
    pub fn stored_object(&self) -> *mut c_void {
        unsafe { *self.storage.get() }
    }
}

// ── Host → buffer ────────────────────────────────────────────────────

fn invalid(ctx: &str, index: usize, enc: &str, value: &Value) -> BridgeError {
    BridgeError::InvalidArgument {
        context: ctx.to_string(),
        index,
        expected: enc.to_string(),
        actual: value.kind(),
    }
}

macro_rules! write_int {
    ($dst:expr, $value:expr, $ty:ty, $as:ident, $ctx:expr, $index:expr, $enc:expr) => {{
        let n = $value
            .$as()
            .ok_or_else(|| invalid($ctx, $index, $enc, $value))?;
        let truncated = n as $ty;
        $dst[..std::mem::size_of::<$ty>()].copy_from_slice(&truncated.to_ne_bytes());
        Ok(())
    }};
}

/// Write one host value into `dst` according to `enc`.
///
/// `dst` must be at least the encoded size; `keep` owns any transient
/// storage the written bytes point into.
pub fn write_value(
    dst: &mut [u8],
    enc: &str,
    value: &Value,
    keep: &mut KeepAlive,
    ctx: &str,
    index: usize,
) -> Result<(), BridgeError> {
    let enc = simplify(enc);
    let bytes = enc.as_bytes();
    let first = *bytes.first().ok_or(BridgeError::UnsupportedEncoding {
        encoding: enc.to_string(),
    })?;

    match first {
        b'c' => write_int!(dst, value, i8, as_i64, ctx, index, enc),
        b's' => write_int!(dst, value, i16, as_i64, ctx, index, enc),
        b'i' => write_int!(dst, value, i32, as_i64, ctx, index, enc),
        b'l' | b'q' => write_int!(dst, value, i64, as_i64, ctx, index, enc),
        b'C' => write_int!(dst, value, u8, as_u64, ctx, index, enc),
        b'S' => write_int!(dst, value, u16, as_u64, ctx, index, enc),
        b'I' => write_int!(dst, value, u32, as_u64, ctx, index, enc),
        b'L' | b'Q' => write_int!(dst, value, u64, as_u64, ctx, index, enc),
        b'f' => {
            let n = value
                .as_f64()
                .ok_or_else(|| invalid(ctx, index, enc, value))?;
            dst[..4].copy_from_slice(&(n as f32).to_ne_bytes());
            Ok(())
        }
        b'd' => {
            let n = value
                .as_f64()
                .ok_or_else(|| invalid(ctx, index, enc, value))?;
            dst[..8].copy_from_slice(&n.to_ne_bytes());
            Ok(())
        }
        b'B' => {
            let b = value
                .as_bool()
                .ok_or_else(|| invalid(ctx, index, enc, value))?;
            dst[0] = u8::from(b);
            Ok(())
        }
        b'@' if bytes.get(1) == Some(&b'?') => write_block(dst, enc, value, ctx, index),
        b'@' | b'#' => {
            let ptr = match value {
                Value::Undefined | Value::Null => std::ptr::null_mut(),
                Value::Foreign(cell) => cell.as_ptr(),
                _ => return Err(invalid(ctx, index, enc, value)),
            };
            write_pointer(dst, ptr);
            Ok(())
        }
        b':' => {
            let Value::String(name) = value else {
                return Err(invalid(ctx, index, enc, value));
            };
            let sel = register_selector(name).ok_or_else(|| BridgeError::UnknownSelector {
                name: name.clone(),
            })?;
            write_pointer(dst, sel);
            Ok(())
        }
        b'*' => {
            let Value::String(s) = value else {
                return Err(invalid(ctx, index, enc, value));
            };
            let cstr = CString::new(s.as_str())
                .map_err(|_| invalid(ctx, index, enc, value))?;
            // valid only for the duration of the call frame
            let ptr = keep.keep_cstring(cstr);
            write_pointer(dst, ptr as *mut c_void);
            Ok(())
        }
        b'^' => {
            let ptr = match value {
                Value::Undefined | Value::Null => std::ptr::null_mut(),
                Value::Buffer(buf) => buf.as_ptr() as *mut c_void,
                Value::Foreign(cell) => cell.as_ptr(),
                _ => return Err(invalid(ctx, index, enc, value)),
            };
            write_pointer(dst, ptr);
            Ok(())
        }
        b'{' => {
            let parsed = parse_struct(enc)?;
            pack_struct(dst, &parsed, value, keep, ctx, index)
        }
        _ => Err(BridgeError::UnsupportedEncoding {
            encoding: enc.to_string(),
        }),
    }
}

/// Install an out-parameter cell into an argument slot. The stored object is
/// read back through the [`OutSlot`] after the call.
pub fn write_out_slot(dst: &mut [u8], keep: &mut KeepAlive) {
    let address = keep.push_out_slot();
    write_pointer(dst, address);
}

#[inline]
fn write_pointer(dst: &mut [u8], ptr: *mut c_void) {
    dst[..8].copy_from_slice(&(ptr as usize).to_ne_bytes());
}

#[cfg(target_vendor = "apple")]
fn register_selector(name: &str) -> Option<*mut c_void> {
    crate::sys::selector(name)
}

#[cfg(not(target_vendor = "apple"))]
fn register_selector(_name: &str) -> Option<*mut c_void> {
    None
}

#[cfg(target_vendor = "apple")]
fn write_block(
    dst: &mut [u8],
    enc: &str,
    value: &Value,
    ctx: &str,
    index: usize,
) -> Result<(), BridgeError> {
    match value {
        Value::Undefined | Value::Null => {
            write_pointer(dst, std::ptr::null_mut());
            Ok(())
        }
        Value::Function(f) => {
            let block = crate::block::create_block(f.clone(), enc)?;
            write_pointer(dst, block);
            Ok(())
        }
        Value::Foreign(cell) => {
            write_pointer(dst, cell.as_ptr());
            Ok(())
        }
        _ => Err(invalid(ctx, index, enc, value)),
    }
}

#[cfg(not(target_vendor = "apple"))]
fn write_block(
    dst: &mut [u8],
    enc: &str,
    value: &Value,
    ctx: &str,
    index: usize,
) -> Result<(), BridgeError> {
    // Without the Apple block runtime there is no heap block to build; an
    // already-materialized block pointer still passes through.
    match value {
        Value::Undefined | Value::Null => {
            write_pointer(dst, std::ptr::null_mut());
            Ok(())
        }
        Value::Foreign(cell) => {
            write_pointer(dst, cell.as_ptr());
            Ok(())
        }
        Value::Function(_) => Err(BridgeError::UnsupportedEncoding {
            encoding: enc.to_string(),
        }),
        _ => Err(invalid(ctx, index, enc, value)),
    }
}

// ── Buffer → host ────────────────────────────────────────────────────

macro_rules! read_int {
    ($src:expr, $ty:ty) => {{
        let mut raw = [0u8; std::mem::size_of::<$ty>()];
        raw.copy_from_slice(&$src[..std::mem::size_of::<$ty>()]);
        Value::Number(<$ty>::from_ne_bytes(raw) as f64)
    }};
}

/// Read one value out of `src` according to `enc`.
///
/// Object reads retain the produced reference (the handle owns it from
/// here on); `q`/`Q` beyond 2^53 lose precision in the host number model.
pub fn read_value(src: &[u8], enc: &str) -> Result<Value, BridgeError> {
    let enc = simplify(enc);
    let bytes = enc.as_bytes();
    let first = *bytes.first().ok_or(BridgeError::UnsupportedEncoding {
        encoding: enc.to_string(),
    })?;

    Ok(match first {
        b'c' => read_int!(src, i8),
        b's' => read_int!(src, i16),
        b'i' => read_int!(src, i32),
        b'l' | b'q' => read_int!(src, i64),
        b'C' => read_int!(src, u8),
        b'S' => read_int!(src, u16),
        b'I' => read_int!(src, u32),
        b'L' | b'Q' => read_int!(src, u64),
        b'f' => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&src[..4]);
            Value::Number(f32::from_ne_bytes(raw) as f64)
        }
        b'd' => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[..8]);
            Value::Number(f64::from_ne_bytes(raw))
        }
        b'B' => Value::Bool(src[0] != 0),
        b'@' | b'#' => {
            let ptr = read_pointer(src);
            if ptr.is_null() {
                Value::Null
            } else {
                handle::wrap_raw(ptr)
            }
        }
        b':' => read_selector(src),
        b'*' => {
            let ptr = read_pointer(src) as *const std::ffi::c_char;
            if ptr.is_null() {
                Value::Null
            } else {
                Value::String(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
            }
        }
        b'^' => {
            let ptr = read_pointer(src);
            if ptr.is_null() {
                Value::Null
            } else {
                Value::Undefined
            }
        }
        b'{' => {
            let parsed = parse_struct(enc)?;
            unpack_struct(src, &parsed)?
        }
        b'v' => Value::Undefined,
        _ => {
            return Err(BridgeError::UnsupportedEncoding {
                encoding: enc.to_string(),
            })
        }
    })
}

#[inline]
fn read_pointer(src: &[u8]) -> *mut c_void {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[..8]);
    usize::from_ne_bytes(raw) as *mut c_void
}

#[cfg(target_vendor = "apple")]
fn read_selector(src: &[u8]) -> Value {
    let sel = read_pointer(src);
    if sel.is_null() {
        Value::Null
    } else {
        Value::String(crate::sys::selector_name(sel))
    }
}

#[cfg(not(target_vendor = "apple"))]
fn read_selector(src: &[u8]) -> Value {
    if read_pointer(src).is_null() {
        Value::Null
    } else {
        Value::Undefined
    }
}

// ── Struct packing ───────────────────────────────────────────────────

/// Pack a host value into a struct buffer laid out per `parsed`.
pub fn pack_struct(
    dst: &mut [u8],
    parsed: &ParsedStruct,
    value: &Value,
    keep: &mut KeepAlive,
    ctx: &str,
    index: usize,
) -> Result<(), BridgeError> {
    if parsed.fields.is_empty() {
        return Err(BridgeError::UnsupportedEncoding {
            encoding: format!("{{{}}}", parsed.name),
        });
    }
    if pack_well_known(dst, parsed, value) {
        return Ok(());
    }
    pack_fields(dst, parsed, value, keep, ctx, index)
}

fn pack_fields(
    dst: &mut [u8],
    parsed: &ParsedStruct,
    value: &Value,
    keep: &mut KeepAlive,
    ctx: &str,
    index: usize,
) -> Result<(), BridgeError> {
    // Three accepted shapes: object keyed by the struct's field names,
    // object iterated in own-key order, or a positional array.
    match value {
        Value::Object(entries) => {
            let names_match = parsed
                .fields
                .first()
                .map(|f| value.get(&f.name).is_some())
                .unwrap_or(false);

            for (i, field) in parsed.fields.iter().enumerate() {
                let field_value = if names_match {
                    value.get(&field.name).unwrap_or(&Value::Undefined)
                } else {
                    entries
                        .get(i)
                        .map(|(_, v)| v)
                        .ok_or_else(|| invalid(ctx, index, &field.encoding, value))?
                };
                pack_one_field(dst, field, field_value, keep, ctx, index)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            if items.len() < parsed.fields.len() {
                return Err(BridgeError::Arity {
                    context: format!("struct {}", parsed.name),
                    expected: parsed.fields.len(),
                    got: items.len(),
                });
            }
            for (field, item) in parsed.fields.iter().zip(items) {
                pack_one_field(dst, field, item, keep, ctx, index)?;
            }
            Ok(())
        }
        _ => Err(invalid(ctx, index, &parsed.name, value)),
    }
}

fn pack_one_field(
    dst: &mut [u8],
    field: &encoding::StructField,
    value: &Value,
    keep: &mut KeepAlive,
    ctx: &str,
    index: usize,
) -> Result<(), BridgeError> {
    let slice = &mut dst[field.offset..field.offset + field.size];
    write_value(slice, &field.encoding, value, keep, ctx, index)
}

/// Unpack a struct buffer into an object keyed by field names.
pub fn unpack_struct(src: &[u8], parsed: &ParsedStruct) -> Result<Value, BridgeError> {
    if let Some(fast) = unpack_well_known(src, parsed) {
        return Ok(fast);
    }
    let mut entries = Vec::with_capacity(parsed.fields.len());
    for field in &parsed.fields {
        let slice = &src[field.offset..field.offset + field.size];
        entries.push((field.name.clone(), read_value(slice, &field.encoding)?));
    }
    Ok(Value::Object(entries))
}

// ── Well-known struct fast paths ─────────────────────────────────────
//
// The geometry types dominate real call traffic; they skip the generic
// walker with direct offset arithmetic. A value that doesn't carry the
// canonical field names falls back to the generic path.

fn pack_well_known(dst: &mut [u8], parsed: &ParsedStruct, value: &Value) -> bool {
    match parsed.name.as_str() {
        "CGPoint" | "NSPoint" => pack_two_f64(dst, value, "x", "y"),
        "CGSize" | "NSSize" => pack_two_f64(dst, value, "width", "height"),
        "CGRect" | "NSRect" => {
            let (Some(origin), Some(size)) = (value.get("origin"), value.get("size"))
            else {
                return false;
            };
            pack_two_f64(&mut dst[0..16], origin, "x", "y")
                && pack_two_f64(&mut dst[16..32], size, "width", "height")
        }
        "NSRange" | "_NSRange" => {
            let (Some(location), Some(length)) =
                (value.get("location"), value.get("length"))
            else {
                return false;
            };
            let (Some(location), Some(length)) = (location.as_u64(), length.as_u64())
            else {
                return false;
            };
            dst[0..8].copy_from_slice(&location.to_ne_bytes());
            dst[8..16].copy_from_slice(&length.to_ne_bytes());
            true
        }
        _ => false,
    }
}

fn pack_two_f64(dst: &mut [u8], value: &Value, a: &str, b: &str) -> bool {
    let (Some(first), Some(second)) = (value.get(a), value.get(b)) else {
        return false;
    };
    let (Some(first), Some(second)) = (first.as_f64(), second.as_f64()) else {
        return false;
    };
    dst[0..8].copy_from_slice(&first.to_ne_bytes());
    dst[8..16].copy_from_slice(&second.to_ne_bytes());
    true
}

fn unpack_well_known(src: &[u8], parsed: &ParsedStruct) -> Option<Value> {
    match parsed.name.as_str() {
        "CGPoint" | "NSPoint" => Some(unpack_two_f64(src, "x", "y")),
        "CGSize" | "NSSize" => Some(unpack_two_f64(src, "width", "height")),
        "CGRect" | "NSRect" => Some(Value::Object(vec![
            ("origin".into(), unpack_two_f64(&src[0..16], "x", "y")),
            (
                "size".into(),
                unpack_two_f64(&src[16..32], "width", "height"),
            ),
        ])),
        "NSRange" | "_NSRange" => {
            let mut location = [0u8; 8];
            let mut length = [0u8; 8];
            location.copy_from_slice(&src[0..8]);
            length.copy_from_slice(&src[8..16]);
            Some(Value::Object(vec![
                (
                    "location".into(),
                    Value::Number(u64::from_ne_bytes(location) as f64),
                ),
                (
                    "length".into(),
                    Value::Number(u64::from_ne_bytes(length) as f64),
                ),
            ]))
        }
        _ => None,
    }
}

fn unpack_two_f64(src: &[u8], a: &str, b: &str) -> Value {
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&src[0..8]);
    second.copy_from_slice(&src[8..16]);
    Value::Object(vec![
        (a.into(), Value::Number(f64::from_ne_bytes(first))),
        (b.into(), Value::Number(f64::from_ne_bytes(second))),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use host::value::ByteBuffer;

    fn roundtrip(enc: &str, value: Value) -> Value {
        let (size, _) = encoding::size_and_alignment(enc).expect("size");
        let mut buf = vec![0u8; size.max(1)];
        let mut keep = KeepAlive::new();
        write_value(&mut buf, enc, &value, &mut keep, "test", 0).expect("write");
        read_value(&buf, enc).expect("read")
    }

    #[test]
    fn primitive_roundtrips() {
        for enc in ["c", "i", "s", "l", "q", "C", "I", "S", "L", "Q"] {
            assert_eq!(
                roundtrip(enc, Value::Number(42.0)),
                Value::Number(42.0),
                "encoding {}",
                enc
            );
        }
        assert_eq!(roundtrip("f", Value::Number(1.5)), Value::Number(1.5));
        assert_eq!(roundtrip("d", Value::Number(-0.25)), Value::Number(-0.25));
        assert_eq!(roundtrip("B", Value::Bool(true)), Value::Bool(true));
    }

    #[test]
    fn signed_negative_roundtrips() {
        assert_eq!(roundtrip("c", Value::Number(-5.0)), Value::Number(-5.0));
        assert_eq!(roundtrip("q", Value::Number(-1.0e9)), Value::Number(-1.0e9));
    }

    #[test]
    fn width_truncation() {
        // 300 does not fit a signed byte: 300 % 256 = 44
        assert_eq!(roundtrip("C", Value::Number(300.0)), Value::Number(44.0));
        assert_eq!(roundtrip("c", Value::Number(130.0)), Value::Number(-126.0));
    }

    #[test]
    fn bool_coercion_for_integers() {
        assert_eq!(roundtrip("i", Value::Bool(true)), Value::Number(1.0));
        assert_eq!(roundtrip("B", Value::Number(2.0)), Value::Bool(true));
        assert_eq!(roundtrip("B", Value::Number(0.0)), Value::Bool(false));
    }

    #[test]
    fn nil_objects() {
        let mut buf = [0xffu8; 8];
        let mut keep = KeepAlive::new();
        write_value(&mut buf, "@", &Value::Null, &mut keep, "test", 0).expect("write nil");
        assert_eq!(read_value(&buf, "@").expect("read nil"), Value::Null);
    }

    #[test]
    fn rejects_mismatched_kinds() {
        let mut buf = [0u8; 8];
        let mut keep = KeepAlive::new();
        let err = write_value(
            &mut buf,
            "q",
            &Value::String("nope".into()),
            &mut keep,
            "doWork:",
            2,
        )
        .expect_err("string into integer slot");
        match err {
            BridgeError::InvalidArgument {
                context,
                index,
                expected,
                actual,
            } => {
                assert_eq!(context, "doWork:");
                assert_eq!(index, 2);
                assert_eq!(expected, "q");
                assert_eq!(actual, "string");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn cstring_arguments_point_at_kept_storage() {
        let mut buf = [0u8; 8];
        let mut keep = KeepAlive::new();
        write_value(
            &mut buf,
            "*",
            &Value::String("hello".into()),
            &mut keep,
            "test",
            0,
        )
        .expect("write");
        let back = read_value(&buf, "*").expect("read");
        assert_eq!(back, Value::String("hello".into()));
    }

    #[test]
    fn buffer_arguments_pass_their_data_pointer() {
        let data = ByteBuffer::from_slice(&[7, 8, 9]);
        let expected = data.as_ptr() as usize;
        let mut buf = [0u8; 8];
        let mut keep = KeepAlive::new();
        write_value(
            &mut buf,
            "^C",
            &Value::Buffer(data),
            &mut keep,
            "test",
            0,
        )
        .expect("write");
        assert_eq!(usize::from_ne_bytes(buf), expected);
    }

    #[test]
    fn struct_roundtrip_named() {
        let rect = Value::Object(vec![
            (
                "origin".into(),
                Value::Object(vec![
                    ("x".into(), Value::Number(1.0)),
                    ("y".into(), Value::Number(2.0)),
                ]),
            ),
            (
                "size".into(),
                Value::Object(vec![
                    ("width".into(), Value::Number(3.0)),
                    ("height".into(), Value::Number(4.0)),
                ]),
            ),
        ]);
        let back = roundtrip("{CGRect={CGPoint=dd}{CGSize=dd}}", rect.clone());
        assert_eq!(back, rect);
    }

    #[test]
    fn struct_pack_from_array() {
        let parsed = parse_struct("{CGPoint=dd}").expect("parse");
        let mut buf = vec![0u8; parsed.total_size];
        let mut keep = KeepAlive::new();
        pack_struct(
            &mut buf,
            &parsed,
            &Value::Array(vec![Value::Number(5.0), Value::Number(6.0)]),
            &mut keep,
            "test",
            0,
        )
        .expect("pack");
        let back = unpack_struct(&buf, &parsed).expect("unpack");
        assert_eq!(back.get("x"), Some(&Value::Number(5.0)));
        assert_eq!(back.get("y"), Some(&Value::Number(6.0)));
    }

    #[test]
    fn struct_pack_from_unnamed_object_uses_key_order() {
        let parsed = parse_struct("{CGPoint=dd}").expect("parse");
        let mut buf = vec![0u8; parsed.total_size];
        let mut keep = KeepAlive::new();
        // keys don't match the canonical names: declaration order wins
        pack_struct(
            &mut buf,
            &parsed,
            &Value::Object(vec![
                ("horizontal".into(), Value::Number(7.0)),
                ("vertical".into(), Value::Number(8.0)),
            ]),
            &mut keep,
            "test",
            0,
        )
        .expect("pack");
        let back = unpack_struct(&buf, &parsed).expect("unpack");
        assert_eq!(back.get("x"), Some(&Value::Number(7.0)));
        assert_eq!(back.get("y"), Some(&Value::Number(8.0)));
    }

    #[test]
    fn nsrange_fast_path() {
        let range = Value::Object(vec![
            ("location".into(), Value::Number(2.0)),
            ("length".into(), Value::Number(2.0)),
        ]);
        assert_eq!(roundtrip("{_NSRange=QQ}", range.clone()), range);
    }

    #[test]
    fn synthetic_nested_struct_roundtrip() {
        let value = Value::Object(vec![
            ("field0".into(), Value::Number(3.0)),
            (
                "field1".into(),
                Value::Object(vec![
                    ("field0".into(), Value::Number(-2.0)),
                    ("field1".into(), Value::Number(9.0)),
                ]),
            ),
            ("field2".into(), Value::Number(0.5)),
        ]);
        assert_eq!(roundtrip("{outer=i{inner=sc}d}", value.clone()), value);
    }

    #[test]
    fn struct_with_padding_keeps_field_positions() {
        let parsed = parse_struct("{pair=cq}").expect("parse");
        let mut buf = vec![0u8; parsed.total_size];
        let mut keep = KeepAlive::new();
        pack_struct(
            &mut buf,
            &parsed,
            &Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]),
            &mut keep,
            "test",
            0,
        )
        .expect("pack");
        assert_eq!(buf[0], 1);
        assert_eq!(
            i64::from_ne_bytes(buf[8..16].try_into().expect("8 bytes")),
            2
        );
    }

    #[test]
    fn out_slot_reads_back_stored_pointer() {
        let mut keep = KeepAlive::new();
        let mut arg = [0u8; 8];
        write_out_slot(&mut arg, &mut keep);

        let slot = &keep.out_slots()[0];
        assert_eq!(usize::from_ne_bytes(arg), slot.slot_address() as usize);
        assert!(slot.stored_object().is_null());

        // callee writes an object pointer through the argument
        let fake_object = 0x5150usize as *mut c_void;
        unsafe {
            *(slot.slot_address() as *mut *mut c_void) = fake_object;
        }
        assert_eq!(slot.stored_object(), fake_object);
    }

    #[test]
    fn qualifiers_are_ignored() {
        assert_eq!(roundtrip("rq", Value::Number(13.0)), Value::Number(13.0));
    }
}
