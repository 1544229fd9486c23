//! Uncaught error reports

use std::fmt::Write;

use core_types::RuntimeError;

/// Render an uncaught error with its traceback, outermost frame first.
///
/// # Example
///
/// ```
/// use core_types::{ErrorKind, RuntimeError, TraceFrame};
/// use lev_cli::format_diagnostic;
///
/// let mut err = RuntimeError::new(ErrorKind::ZeroDivisionError, "Division by zero.");
/// err.offset = Some(2);
/// err.trace = vec![
///     TraceFrame { function: "div".into(), offset: 2, compiled: true },
///     TraceFrame { function: "<main>".into(), offset: 7, compiled: false },
/// ];
/// assert_eq!(
///     format_diagnostic(&err),
///     "Traceback (most recent call last):\n  \
///      <main> @ 7\n  \
///      div @ 2\n\
///      ZeroDivisionError: Division by zero. (at offset 2)"
/// );
/// ```
pub fn format_diagnostic(err: &RuntimeError) -> String {
    let mut out = String::new();
    if !err.trace.is_empty() {
        out.push_str("Traceback (most recent call last):\n");
        for frame in err.trace.iter().rev() {
            let _ = writeln!(out, "  {frame}");
        }
    }
    let _ = write!(out, "{}: {}", err.kind, err.message);
    if let Some(offset) = err.offset {
        let _ = write!(out, " (at offset {offset})");
    }
    out
}
