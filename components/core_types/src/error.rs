//! Runtime error types.
//!
//! Every recoverable failure raised while a program runs is a
//! [`RuntimeError`]. Handlers in the program can catch it; if none does,
//! the host prints it with its traceback and exits non-zero.

use std::fmt;

use thiserror::Error;

use crate::source::TraceFrame;
use crate::Value;

/// The kind of runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operand kinds not supported by an operation
    TypeError,
    /// Wrong number of arguments
    ArityError,
    /// List or string index out of range
    IndexError,
    /// Missing map key
    KeyError,
    /// Division or modulo by zero
    ZeroDivisionError,
    /// Read of a global that was never assigned
    NameError,
    /// Call depth or value stack exhausted
    RecursionError,
    /// Raised by the program with `throw`
    UserError,
}

impl ErrorKind {
    /// Name shown in diagnostics and in caught error maps.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ArityError => "ArityError",
            ErrorKind::IndexError => "IndexError",
            ErrorKind::KeyError => "KeyError",
            ErrorKind::ZeroDivisionError => "ZeroDivisionError",
            ErrorKind::NameError => "NameError",
            ErrorKind::RecursionError => "RecursionError",
            ErrorKind::UserError => "UserError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A catchable runtime error.
///
/// `offset` and `trace` are filled in by the interpreter at the point the
/// error is raised; builtins only supply kind and message.
///
/// # Examples
///
/// ```
/// use core_types::{ErrorKind, RuntimeError};
///
/// let err = RuntimeError::new(ErrorKind::ZeroDivisionError, "Division by zero.");
/// assert_eq!(err.to_string(), "ZeroDivisionError: Division by zero.");
/// ```
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Bytecode offset of the faulting instruction
    pub offset: Option<usize>,
    /// Call stack at the time of the error, innermost first
    pub trace: Vec<TraceFrame>,
    /// Value passed to `throw`, for user errors
    pub payload: Option<Value>,
}

impl RuntimeError {
    /// Error without location information.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            offset: None,
            trace: Vec::new(),
            payload: None,
        }
    }

    /// Shorthand for [`ErrorKind::TypeError`].
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    /// A `throw`n value. `rendered` is the value as `say` would print it.
    pub fn thrown(payload: Value, rendered: String) -> Self {
        let mut err = Self::new(ErrorKind::UserError, rendered);
        err.payload = Some(payload);
        err
    }

    /// Whether the interpreter already attached a location.
    pub fn is_located(&self) -> bool {
        self.offset.is_some()
    }

    /// Multi-line report: message, offset and traceback.
    pub fn report(&self) -> String {
        let mut out = format!("{self}");
        if let Some(offset) = self.offset {
            out.push_str(&format!(" (at bytecode offset {offset})"));
        }
        if !self.trace.is_empty() {
            out.push_str("\nTraceback (most recent call first):");
            for frame in &self.trace {
                out.push_str(&format!("\n  {frame}"));
            }
        }
        out
    }
}
