//! Call-stack frame descriptions for tracebacks.

use std::fmt;

/// One activation in a traceback.
///
/// The rendered form names only the function and offset, so a traceback
/// reads the same whichever tier ran the frame.
///
/// # Examples
///
/// ```
/// use core_types::TraceFrame;
///
/// let frame = TraceFrame {
///     function: "fib".to_string(),
///     offset: 7,
///     compiled: false,
/// };
/// assert_eq!(frame.to_string(), "fib @ 7");
///
/// let native = TraceFrame { compiled: true, ..frame };
/// assert_eq!(native.to_string(), "fib @ 7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Function name
    pub function: String,
    /// Bytecode offset being executed in that frame
    pub offset: usize,
    /// Whether the frame was running native code
    pub compiled: bool,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.function, self.offset)
    }
}
