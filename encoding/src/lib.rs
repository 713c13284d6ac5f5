//! Objective-C type-encoding parsing.
//!
//! Everything the bridge knows about a method or block signature comes out of
//! the runtime's type-encoding strings (`"q24@0:8@16"`, `"{CGRect={CGPoint=dd}{CGSize=dd}}"`,
//! `"@?<v@?q>"`, ...). This crate tokenizes those strings, computes struct
//! layout, and extracts per-argument encodings from full method encodings.
//!
//! No platform calls are made here: sizes and alignments are derived from the
//! encoding itself under the LP64 Apple ABI rules, which keeps the parser
//! deterministic and testable anywhere.

pub mod layout;

pub use layout::{parse_struct, ParsedStruct, StructField};

use std::fmt;

/// Qualifier prefixes the runtime may attach to any encoding:
/// const, in, inout, out, bycopy, byref, oneway.
const QUALIFIERS: &[u8] = b"rnNoORV";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The encoding ended before a balanced token was complete.
    Truncated { encoding: String },
    /// A code we do not implement (bit-fields, unknown characters).
    Unsupported { encoding: String },
    /// `parse_struct` was handed something that is not `{...}` or `(...)`.
    NotAggregate { encoding: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated { encoding } => {
                write!(f, "truncated type encoding '{}'", encoding)
            }
            ParseError::Unsupported { encoding } => {
                write!(f, "unsupported type encoding '{}'", encoding)
            }
            ParseError::NotAggregate { encoding } => {
                write!(f, "expected struct or union encoding, got '{}'", encoding)
            }
        }
    }
}

impl std::error::Error for ParseError {}

// ── Simplified view ──────────────────────────────────────────────────

/// Strip leading qualifier characters, returning a view into the same string.
#[inline]
pub fn simplify(enc: &str) -> &str {
    let bytes = enc.as_bytes();
    let mut i = 0;
    while i < bytes.len() && QUALIFIERS.contains(&bytes[i]) {
        i += 1;
    }
    &enc[i..]
}

/// True iff the simplified encoding denotes a block (`@?`, with or without
/// an extended signature tail).
#[inline]
pub fn is_block(enc: &str) -> bool {
    simplify(enc).as_bytes().starts_with(b"@?")
}

/// True iff the simplified encoding denotes a struct.
#[inline]
pub fn is_struct(enc: &str) -> bool {
    simplify(enc).starts_with('{')
}

// ── Token scanning ───────────────────────────────────────────────────

/// Split exactly one balanced encoding token off the front of `enc`.
///
/// `enc` must already be simplified (no leading qualifiers). Handles nested
/// `{...}`, `(...)`, `[NT]`, `^T`, `@?<...>` and quoted-name-prefixed tokens
/// (`"name"T`). Returns `(token, rest)`.
pub fn split_first(enc: &str) -> Result<(&str, &str), ParseError> {
    let len = token_len(enc)?;
    Ok(enc.split_at(len))
}

/// Byte length of the first balanced token of `enc`.
fn token_len(enc: &str) -> Result<usize, ParseError> {
    let bytes = enc.as_bytes();
    let Some(&first) = bytes.first() else {
        return Err(ParseError::Truncated {
            encoding: enc.to_string(),
        });
    };

    match first {
        b'"' => {
            // "name"T counts as one token
            let close = find_byte(bytes, 1, b'"').ok_or_else(|| ParseError::Truncated {
                encoding: enc.to_string(),
            })?;
            let inner = token_len(&enc[close + 1..])?;
            Ok(close + 1 + inner)
        }
        b'{' => balanced_len(enc, b'{', b'}'),
        b'(' => balanced_len(enc, b'(', b')'),
        b'[' => balanced_len(enc, b'[', b']'),
        b'^' => Ok(1 + token_len(&enc[1..])?),
        b'@' => {
            if bytes.get(1) == Some(&b'?') {
                if bytes.get(2) == Some(&b'<') {
                    // extended block signature: @?<ret@?args...>
                    Ok(2 + balanced_len(&enc[2..], b'<', b'>')?)
                } else {
                    Ok(2)
                }
            } else if bytes.get(1) == Some(&b'"') {
                // @"NSString" — typed object pointer
                let close =
                    find_byte(bytes, 2, b'"').ok_or_else(|| ParseError::Truncated {
                        encoding: enc.to_string(),
                    })?;
                Ok(close + 1)
            } else {
                Ok(1)
            }
        }
        b'b' => {
            // bit-field: bN — scanned but not convertible
            let mut i = 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            Ok(i)
        }
        c if is_scalar_code(c) => Ok(1),
        c if QUALIFIERS.contains(&c) => Ok(1 + token_len(&enc[1..])?),
        _ => Err(ParseError::Unsupported {
            encoding: enc.to_string(),
        }),
    }
}

fn is_scalar_code(c: u8) -> bool {
    matches!(
        c,
        b'c' | b'i'
            | b's'
            | b'l'
            | b'q'
            | b'C'
            | b'I'
            | b'S'
            | b'L'
            | b'Q'
            | b'f'
            | b'd'
            | b'B'
            | b'v'
            | b'*'
            | b'#'
            | b':'
            | b'?'
    )
}

fn find_byte(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes[from..].iter().position(|&b| b == needle).map(|p| from + p)
}

/// Length of a bracketed token, honoring nesting and quoted field names
/// (a quoted name may legally contain bracket characters).
fn balanced_len(enc: &str, open: u8, close: u8) -> Result<usize, ParseError> {
    let bytes = enc.as_bytes();
    let mut depth = 0usize;
    let mut in_quote = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_quote {
            if b == b'"' {
                in_quote = false;
            }
            continue;
        }
        match b {
            b'"' => in_quote = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i + 1);
                }
            }
            _ => {}
        }
    }
    Err(ParseError::Truncated {
        encoding: enc.to_string(),
    })
}

#[inline]
fn skip_digits(enc: &str) -> &str {
    enc.trim_start_matches(|c: char| c.is_ascii_digit())
}

// ── Size & alignment ─────────────────────────────────────────────────

/// Size and alignment of one encoded type under the LP64 Apple ABI.
///
/// `l`/`L` are modeled as 64-bit: the bridge only targets LP64 Apple
/// platforms, and the runtime emits `q`/`Q` for NSInteger there anyway.
pub fn size_and_alignment(enc: &str) -> Result<(usize, usize), ParseError> {
    let enc = simplify(enc);
    let bytes = enc.as_bytes();
    let Some(&first) = bytes.first() else {
        return Err(ParseError::Truncated {
            encoding: enc.to_string(),
        });
    };

    match first {
        b'c' | b'C' | b'B' => Ok((1, 1)),
        b's' | b'S' => Ok((2, 2)),
        b'i' | b'I' | b'f' => Ok((4, 4)),
        b'l' | b'L' | b'q' | b'Q' | b'd' => Ok((8, 8)),
        b'@' | b'#' | b':' | b'*' | b'^' | b'?' => Ok((8, 8)),
        b'v' => Ok((0, 1)),
        b'{' | b'(' => {
            let parsed = layout::parse_struct(enc)?;
            Ok((parsed.total_size, parsed.alignment))
        }
        b'[' => {
            // [NT] — fixed array of N elements of type T
            let inner = &enc[1..enc.len() - 1];
            let elem = skip_digits(inner);
            let count: usize = inner[..inner.len() - elem.len()]
                .parse()
                .map_err(|_| ParseError::Truncated {
                    encoding: enc.to_string(),
                })?;
            let (elem_size, elem_align) = size_and_alignment(elem)?;
            Ok((count * elem_size, elem_align))
        }
        _ => Err(ParseError::Unsupported {
            encoding: enc.to_string(),
        }),
    }
}

// ── Block signatures ─────────────────────────────────────────────────

/// Return and parameter encodings of a block, from its extended signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSignature {
    pub return_type: String,
    /// Parameter encodings, excluding the implicit block-self slot.
    pub param_types: Vec<String>,
}

/// Parse a block's extended signature `@?<ret @? params...>`.
///
/// Returns `Ok(None)` for a plain `@?` with no extended tail — the caller
/// decides how to infer a signature then.
pub fn parse_block_signature(enc: &str) -> Result<Option<BlockSignature>, ParseError> {
    let enc = simplify(enc);
    if !enc.as_bytes().starts_with(b"@?") {
        return Err(ParseError::Unsupported {
            encoding: enc.to_string(),
        });
    }
    if enc.as_bytes().get(2) != Some(&b'<') {
        return Ok(None);
    }

    let tail_len = balanced_len(&enc[2..], b'<', b'>')?;
    let mut inner = &enc[3..2 + tail_len - 1];

    let (ret, rest) = split_first(simplify(inner))?;
    let return_type = ret.to_string();
    inner = rest;

    // Second token is the block-self slot (@?) — skipped.
    if !inner.is_empty() {
        let (_, rest) = split_first(simplify(inner))?;
        inner = rest;
    }

    let mut param_types = Vec::new();
    while !inner.is_empty() {
        let simplified = simplify(inner);
        if simplified.is_empty() {
            break;
        }
        let (tok, rest) = split_first(simplified)?;
        param_types.push(tok.to_string());
        inner = rest;
    }

    Ok(Some(BlockSignature {
        return_type,
        param_types,
    }))
}

// ── Method encodings ─────────────────────────────────────────────────
//
// A full method encoding as returned by the runtime's method-type query
// interleaves frame offsets with the types: "q24@0:8@16". Index 0 is self,
// 1 is _cmd, user arguments start at 2. Walking the full string is the only
// way to recover extended block tails — per-argument signature accessors
// discard them.

/// The return encoding of a full method type encoding.
pub fn method_return(method_enc: &str) -> Result<&str, ParseError> {
    let enc = simplify(method_enc);
    let (tok, _) = split_first(enc)?;
    Ok(tok)
}

/// The encoding of argument `index` of a full method type encoding, or
/// `None` if the method has fewer arguments.
pub fn method_argument(method_enc: &str, index: usize) -> Result<Option<&str>, ParseError> {
    let mut rest = after_return(method_enc)?;
    for i in 0.. {
        rest = simplify(rest);
        if rest.is_empty() {
            return Ok(None);
        }
        let (tok, tail) = split_first(rest)?;
        if i == index {
            return Ok(Some(tok));
        }
        rest = skip_digits(tail);
    }
    unreachable!()
}

/// Number of arguments (including self and _cmd) in a full method encoding.
pub fn method_arg_count(method_enc: &str) -> Result<usize, ParseError> {
    let mut rest = after_return(method_enc)?;
    let mut count = 0;
    loop {
        rest = simplify(rest);
        if rest.is_empty() {
            return Ok(count);
        }
        let (_, tail) = split_first(rest)?;
        count += 1;
        rest = skip_digits(tail);
    }
}

fn after_return(method_enc: &str) -> Result<&str, ParseError> {
    let enc = simplify(method_enc);
    let (_, rest) = split_first(enc)?;
    Ok(skip_digits(rest))
}
