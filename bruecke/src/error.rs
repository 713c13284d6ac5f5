//! Bridge errors surfaced to the host caller.

use std::fmt;

use encoding::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    UnknownSelector { name: String },
    DoesNotRespond { class: String, selector: String },
    UnknownProtocol { name: String },
    UnknownClass { name: String },
    SymbolNotFound { name: String },
    Arity { context: String, expected: usize, got: usize },
    InvalidArgument {
        context: String,
        index: usize,
        expected: String,
        actual: &'static str,
    },
    UnsupportedEncoding { encoding: String },
    FfiFailure { stage: &'static str },
    /// An Objective-C exception escaped the boundary; not recoverable.
    Fatal { message: String },
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::UnknownSelector { name } => {
                write!(f, "unknown selector '{}'", name)
            }
            BridgeError::DoesNotRespond { class, selector } => {
                write!(f, "'{}' does not respond to selector '{}'", class, selector)
            }
            BridgeError::UnknownProtocol { name } => {
                write!(f, "unknown protocol '{}'", name)
            }
            BridgeError::UnknownClass { name } => write!(f, "unknown class '{}'", name),
            BridgeError::SymbolNotFound { name } => {
                write!(f, "symbol '{}' not found in loaded images", name)
            }
            BridgeError::Arity {
                context,
                expected,
                got,
            } => write!(
                f,
                "{} expected {} argument(s), got {}",
                context, expected, got
            ),
            BridgeError::InvalidArgument {
                context,
                index,
                expected,
                actual,
            } => write!(
                f,
                "{}: argument {} expects encoding '{}', got a {} value",
                context, index, expected, actual
            ),
            BridgeError::UnsupportedEncoding { encoding } => {
                write!(f, "unsupported type encoding '{}'", encoding)
            }
            BridgeError::FfiFailure { stage } => {
                write!(f, "libffi preparation failed at {}", stage)
            }
            BridgeError::Fatal { message } => write!(f, "fatal: {}", message),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<ParseError> for BridgeError {
    fn from(err: ParseError) -> BridgeError {
        let encoding = match err {
            ParseError::Truncated { encoding }
            | ParseError::Unsupported { encoding }
            | ParseError::NotAggregate { encoding } => encoding,
        };
        BridgeError::UnsupportedEncoding { encoding }
    }
}
