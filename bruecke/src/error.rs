use std::fmt;

/// Recoverable marshaling and resolution errors.
///
/// Fatal classifier invariants are not represented here: an unsupported
/// leaf kind discovered mid-walk or an eightbyte accumulator overflow
/// means the register image under construction cannot be trusted, and
/// issuing the call anyway could corrupt unrelated native memory. Those
/// conditions abort at the point of detection with a `bruecke:` panic
/// message naming the offender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FfiError {
    LibraryNotFound { path: String },
    SymbolNotFound { name: String },
    TypeMismatch { expected: &'static str, got: &'static str },
    ArityMismatch { expected: usize, got: usize },
    InvalidString { message: &'static str },
    InvalidCallback { message: &'static str },
    Unsupported { message: &'static str },
}

impl fmt::Display for FfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfiError::LibraryNotFound { path } => {
                write!(f, "library not found: {path}")
            }
            FfiError::SymbolNotFound { name } => {
                write!(f, "symbol not found: {name}")
            }
            FfiError::TypeMismatch { expected, got } => {
                write!(f, "type mismatch: expected {expected}, got {got}")
            }
            FfiError::ArityMismatch { expected, got } => {
                write!(f, "arity mismatch: expected {expected} values, got {got}")
            }
            FfiError::InvalidString { message } => write!(f, "{message}"),
            FfiError::InvalidCallback { message } => write!(f, "{message}"),
            FfiError::Unsupported { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for FfiError {}
