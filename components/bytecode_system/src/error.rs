//! Errors for malformed bytecode.
//!
//! A program that fails validation is a defect in whatever produced it;
//! the engine refuses to run it.

use thiserror::Error;

/// Validation failure, located by function name and instruction offset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    /// Entry function index out of range
    #[error("entry function {0} does not exist")]
    MissingEntry(u32),
    /// Entry function declares parameters
    #[error("entry function '{0}' must take no parameters")]
    EntryArity(String),
    /// Assembler label used but never bound
    #[error("function '{0}' jumps to an unbound label")]
    UnboundLabel(String),
    /// Function without instructions
    #[error("function '{0}' has no code")]
    EmptyFunction(String),
    /// Jump outside the function
    #[error("{function}@{offset}: jump target {target} out of range")]
    BadJump {
        /// Function name
        function: String,
        /// Instruction offset
        offset: usize,
        /// Offending target
        target: u32,
    },
    /// Operand index out of range (constant, local, global, capture, function)
    #[error("{function}@{offset}: {what} index {index} out of range")]
    BadOperand {
        /// Function name
        function: String,
        /// Instruction offset
        offset: usize,
        /// Operand kind
        what: &'static str,
        /// Offending index
        index: u32,
    },
    /// Field access whose name constant is not a string
    #[error("{function}@{offset}: field name constant {index} is not a string")]
    FieldName {
        /// Function name
        function: String,
        /// Instruction offset
        offset: usize,
        /// Constant index
        index: u32,
    },
    /// Operand stack underflow
    #[error("{function}@{offset}: operand stack underflow")]
    StackUnderflow {
        /// Function name
        function: String,
        /// Instruction offset
        offset: usize,
    },
    /// Two paths reach an instruction with different stack heights
    #[error("{function}@{offset}: stack height {found} conflicts with {expected}")]
    InconsistentStack {
        /// Function name
        function: String,
        /// Instruction offset
        offset: usize,
        /// Height seen first
        expected: u32,
        /// Height seen later
        found: u32,
    },
    /// Control reaches the end of the code without returning
    #[error("{function}@{offset}: control falls off the end of the function")]
    FallsOffEnd {
        /// Function name
        function: String,
        /// Instruction offset
        offset: usize,
    },
    /// Handler range or target out of bounds, or deeper than the stack it covers
    #[error("function '{function}': handler {index} is malformed")]
    BadHandler {
        /// Function name
        function: String,
        /// Position in the handler table
        index: usize,
    },
}
