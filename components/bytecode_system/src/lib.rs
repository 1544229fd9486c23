//! Bytecode program model for the Levython engine
//!
//! This crate defines what the bytecode compiler hands to the engine and
//! what both the interpreter and the JIT consume.
//!
//! # Features
//!
//! - Stack-machine instruction set with typed operands
//! - Per-function constant pools and exception handler ranges
//! - Validation with static operand-stack heights and loop discovery
//! - JSON program files via serde
//! - Label-based [`Assembler`] for tools and tests
//!
//! # Example
//!
//! ```
//! use bytecode_system::{Assembler, Opcode, Program};
//!
//! let mut asm = Assembler::new("<main>", 0, 0);
//! asm.load_int(40);
//! asm.load_int(2);
//! asm.emit(Opcode::Add);
//! asm.emit(Opcode::Return);
//!
//! let program = Program::with_entry(asm.finish().unwrap());
//! let layouts = program.validate().unwrap();
//! assert_eq!(layouts[0].max_stack, 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod analysis;
pub mod assembler;
pub mod error;
pub mod function;
pub mod instruction;
pub mod opcode;
pub mod program;

// Re-export main types at crate root
pub use analysis::{FunctionLayout, LoopInfo};
pub use assembler::{Assembler, Label};
pub use error::ProgramError;
pub use function::{Constant, FunctionProto, HandlerEntry};
pub use instruction::Instruction;
pub use opcode::{CaptureSource, Opcode};
pub use program::Program;
