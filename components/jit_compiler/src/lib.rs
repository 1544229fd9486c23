//! Cranelift JIT for the Levython VM
//!
//! This crate provides:
//! - Lowering of hot function and loop regions to native code, specialized
//!   on the interpreter's type feedback behind deoptimizing guards
//! - Inline caches for call and field sites, addressed directly by native code
//! - A code cache of read+execute mappings with deferred reclamation
//! - Runtime helpers that give native code the interpreter's semantics
//!
//! # Example
//!
//! ```no_run
//! use bytecode_system::{Constant, FunctionProto, Opcode, Program};
//! use interpreter::{RuntimeConfig, VM};
//! use jit_compiler::JitCompiler;
//!
//! let mut main = FunctionProto::new("<main>", 0, 0);
//! let k = main.add_constant(Constant::Int(42));
//! main.emit(Opcode::LoadConst(k));
//! main.emit(Opcode::Return);
//!
//! let backend = JitCompiler::new().unwrap();
//! let mut vm = VM::new(Program::with_entry(main), RuntimeConfig::default())
//!     .unwrap()
//!     .with_backend(Box::new(backend));
//! vm.run().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod code_cache;
pub mod codegen;
pub mod compiled_code;
pub mod compiler;
pub mod cranelift_backend;
pub mod deopt;
pub mod helpers;
pub mod type_specialization;

// Re-export main types at crate root
pub use code_cache::{CacheError, CacheStats, CodeCache, ExecutableMemory};
pub use compiled_code::{CallSite, CompiledEntry, EntryFn, FieldSite, Sites};
pub use compiler::JitCompiler;
pub use cranelift_backend::{CompiledFunction, CraneliftBackend};
pub use deopt::{ExitTable, GuardKind, GuardRecord};
pub use type_specialization::{Specialization, UnarySpecialization};
