//! Struct and union layout derived from type encodings.
//!
//! The runtime hands out struct encodings in two shapes:
//!
//! ```text
//! {CGRect="origin"{CGPoint="x"d"y"d}"size"{CGSize="width"d"height"d}}
//! {CGRect={CGPoint=dd}{CGSize=dd}}
//! ```
//!
//! Quoted field names only appear when the compiler's `@encode()` produced
//! the string; runtime queries usually return the bare form. For bare forms
//! the well-known Apple geometry/Foundation types get their canonical field
//! names from a built-in table; everything else is named positionally
//! (`field0`, `field1`, ...).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::{simplify, size_and_alignment, split_first, ParseError};

/// One field of a parsed struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructField {
    pub name: String,
    pub encoding: String,
    pub offset: usize,
    pub size: usize,
    pub alignment: usize,
    pub is_struct: bool,
    /// Field layout of a nested struct; empty otherwise.
    pub subfields: Vec<StructField>,
}

/// Layout of a struct (or union) encoding.
///
/// Invariants: `total_size` is the ABI size of the aggregate;
/// field offsets are a monotone forward pass with per-field alignment
/// rounding, and `total_size` is the end offset rounded up to `alignment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStruct {
    pub name: String,
    pub total_size: usize,
    pub alignment: usize,
    pub fields: Vec<StructField>,
}

impl ParsedStruct {
    /// Look up a top-level field by name.
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

// ── Well-known field names ───────────────────────────────────────────

/// Canonical field names for Apple structs whose runtime encodings carry no
/// quoted names.
fn known_field_names(struct_name: &str) -> Option<&'static [&'static str]> {
    Some(match struct_name {
        "CGPoint" | "NSPoint" => &["x", "y"],
        "CGSize" | "NSSize" => &["width", "height"],
        "CGRect" | "NSRect" => &["origin", "size"],
        "CGVector" => &["dx", "dy"],
        "NSRange" | "_NSRange" => &["location", "length"],
        "NSEdgeInsets" | "UIEdgeInsets" => &["top", "left", "bottom", "right"],
        "NSDirectionalEdgeInsets" => &["top", "leading", "bottom", "trailing"],
        "CGAffineTransform" => &["a", "b", "c", "d", "tx", "ty"],
        _ => return None,
    })
}

// ── Parse cache ──────────────────────────────────────────────────────

fn cache() -> &'static Mutex<HashMap<String, Arc<ParsedStruct>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<ParsedStruct>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Parse a struct or union encoding, memoized on the encoding string.
///
/// Repeated calls return the same `Arc`; cache hits and misses are
/// indistinguishable to the caller.
pub fn parse_struct(enc: &str) -> Result<Arc<ParsedStruct>, ParseError> {
    let enc = simplify(enc);
    if let Some(hit) = cache().lock().get(enc) {
        return Ok(hit.clone());
    }

    // built outside the lock; on a race the first insertion wins
    let parsed = Arc::new(parse_aggregate(enc)?);
    let mut cache = cache().lock();
    let entry = cache.entry(enc.to_string()).or_insert(parsed);
    Ok(entry.clone())
}

// ── Recursive descent ────────────────────────────────────────────────

fn parse_aggregate(enc: &str) -> Result<ParsedStruct, ParseError> {
    let bytes = enc.as_bytes();
    let (close, is_union) = match bytes.first() {
        Some(b'{') => (b'}', false),
        Some(b'(') => (b')', true),
        _ => {
            return Err(ParseError::NotAggregate {
                encoding: enc.to_string(),
            })
        }
    };
    if bytes.last() != Some(&close) {
        return Err(ParseError::Truncated {
            encoding: enc.to_string(),
        });
    }

    let inner = &enc[1..enc.len() - 1];
    let (name, body) = match inner.find('=') {
        Some(eq) => (&inner[..eq], Some(&inner[eq + 1..])),
        // opaque: {CGRect} — name only, no field list
        None => (inner, None),
    };

    let mut fields = Vec::new();
    if let Some(mut body) = body {
        let mut index = 0usize;
        while !body.is_empty() {
            body = simplify(body);
            if body.is_empty() {
                break;
            }

            // optional quoted field name
            let mut field_name = None;
            if body.starts_with('"') {
                let end = body[1..]
                    .find('"')
                    .ok_or_else(|| ParseError::Truncated {
                        encoding: enc.to_string(),
                    })?;
                field_name = Some(body[1..1 + end].to_string());
                body = &body[end + 2..];
            }

            let (tok, rest) = split_first(simplify(body))?;
            body = rest;

            let (size, alignment) = size_and_alignment(tok)?;
            let is_struct = tok.starts_with('{') || tok.starts_with('(');
            let subfields = if is_struct {
                parse_struct(tok)?.fields.clone()
            } else {
                Vec::new()
            };

            fields.push(StructField {
                name: field_name.unwrap_or_else(|| format!("field{}", index)),
                encoding: tok.to_string(),
                offset: 0,
                size,
                alignment,
                is_struct,
                subfields,
            });
            index += 1;
        }
    }

    // Bare encodings get the canonical names when the whole field list is
    // positional and the arity matches.
    let all_positional = fields
        .iter()
        .enumerate()
        .all(|(i, f)| f.name == format!("field{}", i));
    if all_positional {
        if let Some(names) = known_field_names(name) {
            if names.len() == fields.len() {
                for (field, &known) in fields.iter_mut().zip(names) {
                    field.name = known.to_string();
                }
            }
        }
    }

    let (total_size, alignment) = if is_union {
        union_layout(&fields)
    } else {
        struct_layout(&mut fields)
    };

    Ok(ParsedStruct {
        name: name.to_string(),
        total_size,
        alignment,
        fields,
    })
}

/// Forward pass with alignment rounding; returns (size, alignment).
fn struct_layout(fields: &mut [StructField]) -> (usize, usize) {
    let mut offset = 0usize;
    let mut alignment = 1usize;
    for field in fields.iter_mut() {
        alignment = alignment.max(field.alignment);
        offset = round_up(offset, field.alignment);
        field.offset = offset;
        offset += field.size;
    }
    (round_up(offset, alignment), alignment)
}

/// All union members share offset 0; size is the widest member rounded up.
fn union_layout(fields: &[StructField]) -> (usize, usize) {
    let mut size = 0usize;
    let mut alignment = 1usize;
    for field in fields {
        size = size.max(field.size);
        alignment = alignment.max(field.alignment);
    }
    (round_up(size, alignment), alignment)
}

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CGRECT: &str = "{CGRect={CGPoint=dd}{CGSize=dd}}";

    #[test]
    fn cgrect_layout_with_known_names() {
        let parsed = parse_struct(CGRECT).expect("parse CGRect");
        assert_eq!(parsed.name, "CGRect");
        assert_eq!(parsed.total_size, 32);
        assert_eq!(parsed.alignment, 8);
        assert_eq!(parsed.fields.len(), 2);

        let origin = &parsed.fields[0];
        assert_eq!(origin.name, "origin");
        assert_eq!(origin.offset, 0);
        assert_eq!(origin.size, 16);
        assert!(origin.is_struct);
        assert_eq!(origin.subfields[0].name, "x");
        assert_eq!(origin.subfields[1].name, "y");
        assert_eq!(origin.subfields[1].offset, 8);

        let size = &parsed.fields[1];
        assert_eq!(size.name, "size");
        assert_eq!(size.offset, 16);
        assert_eq!(size.subfields[0].name, "width");
    }

    #[test]
    fn nsrange_layout() {
        let parsed = parse_struct("{_NSRange=QQ}").expect("parse NSRange");
        assert_eq!(parsed.total_size, 16);
        assert_eq!(parsed.fields[0].name, "location");
        assert_eq!(parsed.fields[1].name, "length");
        assert_eq!(parsed.fields[1].offset, 8);
    }

    #[test]
    fn quoted_names_win_over_table() {
        let parsed =
            parse_struct("{CGPoint=\"a\"d\"b\"d}").expect("parse named CGPoint");
        assert_eq!(parsed.fields[0].name, "a");
        assert_eq!(parsed.fields[1].name, "b");
    }

    #[test]
    fn padding_between_fields() {
        // char followed by long long: 7 bytes of padding
        let parsed = parse_struct("{pair=cq}").expect("parse");
        assert_eq!(parsed.fields[0].offset, 0);
        assert_eq!(parsed.fields[1].offset, 8);
        assert_eq!(parsed.total_size, 16);
        assert_eq!(parsed.alignment, 8);

        let padding: usize =
            parsed.total_size - parsed.fields.iter().map(|f| f.size).sum::<usize>();
        assert_eq!(padding, 7);
    }

    #[test]
    fn tail_padding() {
        // long long followed by char: size rounds up to 16
        let parsed = parse_struct("{pair=qc}").expect("parse");
        assert_eq!(parsed.fields[1].offset, 8);
        assert_eq!(parsed.total_size, 16);
    }

    #[test]
    fn synthetic_nested_struct() {
        let parsed = parse_struct("{outer=i{inner=sc}d}").expect("parse");
        assert_eq!(parsed.fields[0].offset, 0);
        // inner: {s@0 c@2} size 4 align 2
        assert_eq!(parsed.fields[1].offset, 4);
        assert_eq!(parsed.fields[1].size, 4);
        assert_eq!(parsed.fields[1].alignment, 2);
        assert_eq!(parsed.fields[2].offset, 8);
        assert_eq!(parsed.total_size, 16);
        assert_eq!(parsed.fields[1].subfields[1].offset, 2);
    }

    #[test]
    fn union_members_overlap() {
        let parsed = parse_struct("(u=qd{CGPoint=dd})").expect("parse union");
        assert_eq!(parsed.total_size, 16);
        assert_eq!(parsed.alignment, 8);
        for field in &parsed.fields {
            assert_eq!(field.offset, 0);
        }
    }

    #[test]
    fn opaque_struct_has_no_fields() {
        let parsed = parse_struct("{CGRect}").expect("parse opaque");
        assert_eq!(parsed.name, "CGRect");
        assert!(parsed.fields.is_empty());
        assert_eq!(parsed.total_size, 0);
    }

    #[test]
    fn anonymous_struct() {
        let parsed = parse_struct("{?=qq}").expect("parse anonymous");
        assert_eq!(parsed.name, "?");
        assert_eq!(parsed.fields[0].name, "field0");
        assert_eq!(parsed.total_size, 16);
    }

    #[test]
    fn parse_is_idempotent_and_cached() {
        let first = parse_struct(CGRECT).expect("first parse");
        let second = parse_struct(CGRECT).expect("second parse");
        assert!(Arc::ptr_eq(&first, &second), "cache should return the same Arc");
        assert_eq!(*first, *second);

        // Qualified spelling simplifies to the same cache key.
        let qualified = parse_struct(&format!("r{}", CGRECT)).expect("qualified");
        assert!(Arc::ptr_eq(&first, &qualified));
    }

    #[test]
    fn affine_transform_names() {
        let parsed =
            parse_struct("{CGAffineTransform=dddddd}").expect("parse transform");
        assert_eq!(parsed.total_size, 48);
        let names: Vec<&str> = parsed.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "tx", "ty"]);
    }

    #[test]
    fn rejects_non_aggregates() {
        assert!(matches!(
            parse_struct("q"),
            Err(ParseError::NotAggregate { .. })
        ));
    }
}
