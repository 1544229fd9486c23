//! Bytecode interpreter and tiering for the Levython VM
//!
//! This crate provides the stack-based virtual machine with:
//! - Interpretation of every opcode with exception handlers
//! - Type feedback collection at arithmetic, comparison and index sites
//! - A tiering controller promoting hot functions and loops
//! - The [`JitBackend`] seam native code generators plug into
//!
//! Native frames run on the same value stack and call stack as
//! interpreted ones, so a program behaves identically whichever tier
//! executes it.
//!
//! # Example
//!
//! ```
//! use bytecode_system::{Assembler, Opcode, Program};
//! use interpreter::{RuntimeConfig, VM};
//! use core_types::Value;
//!
//! let mut main = Assembler::new("<main>", 0, 0);
//! main.load_int(20);
//! main.load_int(22);
//! main.emit(Opcode::Add);
//! main.emit(Opcode::Return);
//! let program = Program::with_entry(main.finish().unwrap());
//!
//! let mut vm = VM::new(program, RuntimeConfig::interpreted()).unwrap();
//! assert_eq!(vm.run().unwrap(), Value::int(42));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backend;
pub mod builtins;
pub mod call_frame;
pub mod config;
pub mod inline_cache;
pub mod ops;
pub mod tiering;
pub mod vm;

// Re-export main types at crate root
pub use backend::{
    CompileRefusal, CompileRequest, CompiledCode, ExitKind, ExitPoint, FrameSlot, JitBackend,
    NativeExit, SiteKind, SiteReport, SpeculationLevel, ERROR_BITS, UNSET_BITS,
};
pub use call_frame::{ActiveNative, CallFrame};
pub use config::{RuntimeConfig, MAX_POLYMORPHIC_ENTRIES};
pub use inline_cache::{CacheState, CallCache, CallTarget, FieldCache, InlineCache};
pub use ops::BinaryOp;
pub use tiering::{Tier, TierStats, TieringController};
pub use vm::{Output, VM};
