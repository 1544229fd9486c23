//! Native code seam
//!
//! The VM knows nothing about machine code. A [`JitBackend`] turns hot
//! regions into [`CompiledCode`], and the VM drives it through
//! [`CompiledCode::invoke`] and the exit table.
//!
//! Native frames share the interpreter's value stack: a compiled region
//! reads its locals and operands from the frame's slots on entry and
//! writes them back before every exit, so the interpreter resumes with
//! exactly the state it would have had.

use std::fmt;
use std::rc::Rc;

use bytecode_system::{FunctionLayout, FunctionProto};
use core_types::{ProfileRecord, RegionId, Value};
use thiserror::Error;

use crate::inline_cache::CacheState;
use crate::vm::VM;

/// Returned by runtime helpers when they stored a pending error.
///
/// The pattern decodes as a float NaN no float constructor produces, so it
/// never collides with a real value.
pub const ERROR_BITS: u64 = 0xFFFF_0000_0000_0001;

/// Contents of a global slot that was never assigned.
pub const UNSET_BITS: u64 = 0xFFFF_0000_0000_0002;

/// How much a region may assume about operand types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeculationLevel {
    /// Specialize from type feedback behind guards
    Speculative,
    /// No guards; generic helpers and unguarded numeric fast paths only
    Generic,
}

/// Why native code handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitKind {
    /// A speculation failed; the region must be deoptimized
    Guard,
    /// A helper stored a pending error
    Error,
    /// Control left a loop region
    LoopExit,
}

/// Frame slot written before an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameSlot {
    /// Local variable
    Local(u16),
    /// Operand stack position, counted from the bottom
    Operand(u32),
}

/// Interpreter state at a native exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPoint {
    /// Why the exit is taken
    pub kind: ExitKind,
    /// Bytecode offset to resume at (for errors, the faulting instruction)
    pub offset: usize,
    /// Operand stack depth at `offset`
    pub stack_depth: u32,
    /// Slots holding live values when the exit is taken
    pub written: Vec<FrameSlot>,
}

/// Outcome of one native invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeExit {
    /// The function returned
    Return(Value),
    /// Control left through an exit point
    Exit(u32),
}

/// Operation an inline cache serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// `Call`, keyed by callee
    Call,
    /// `GetField`, keyed by map shape
    GetField,
    /// `SetField` of an existing key, keyed by map shape
    SetField,
}

/// Inline cache of one site in compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteReport {
    /// Bytecode offset of the instruction
    pub offset: usize,
    /// Operation
    pub kind: SiteKind,
    /// Current cache state
    pub state: CacheState,
    /// Executions answered from the cache
    pub hits: u64,
    /// Executions that took the generic path
    pub misses: u64,
}

/// Native code for one region.
pub trait CompiledCode: fmt::Debug {
    /// Region this code implements
    fn region(&self) -> RegionId;

    /// Speculation level it was compiled at
    fn speculation(&self) -> SpeculationLevel;

    /// Exit point by id
    fn exit_point(&self, id: u32) -> Option<&ExitPoint>;

    /// Size of the machine code in bytes
    fn code_size(&self) -> usize;

    /// Run the region on the frame whose locals start at stack slot `base`.
    fn invoke(&self, vm: &mut VM, base: usize) -> NativeExit;

    /// Inline caches of the code, in bytecode order
    fn inline_caches(&self) -> Vec<SiteReport> {
        Vec::new()
    }
}

/// Everything the back end may look at when compiling a region.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    /// Region to compile
    pub region: RegionId,
    /// Function containing it
    pub function: &'a FunctionProto,
    /// Static layout of that function
    pub layout: &'a FunctionLayout,
    /// Type feedback and entry tags
    pub profile: &'a ProfileRecord,
    /// Prepared constants, string constants already on the heap
    pub constants: &'a [Value],
    /// Speculation allowed
    pub speculation: SpeculationLevel,
    /// Region size limit in instructions
    pub max_region_size: usize,
    /// Inline cache width
    pub ic_polymorphic_limit: usize,
}

impl CompileRequest<'_> {
    /// Bytecode offsets covered by the region
    pub fn span(&self) -> std::ops::RangeInclusive<usize> {
        match self.region.kind {
            core_types::RegionKind::Function => 0..=self.function.len().saturating_sub(1),
            core_types::RegionKind::Loop { header } => {
                let end = self
                    .layout
                    .loops
                    .get(&header)
                    .map_or(header, |l| l.end);
                header as usize..=end as usize
            }
        }
    }
}

/// Reasons a back end declines a region. The region stays interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileRefusal {
    /// More instructions than `max_region_size`
    #[error("region has {size} instructions, limit is {limit}")]
    RegionTooLarge {
        /// Instructions in the region
        size: usize,
        /// Configured limit
        limit: usize,
    },
    /// An instruction in the region has no static stack height
    #[error("no static stack layout at offset {0}")]
    NoStaticLayout(usize),
    /// Code generation failed
    #[error("code generation failed: {0}")]
    Backend(String),
    /// Executable memory could not be mapped
    #[error("executable memory unavailable: {0}")]
    ExecutableMemory(String),
}

/// A native code generator.
pub trait JitBackend {
    /// Compile a region or refuse it
    fn compile(&mut self, request: &CompileRequest<'_>)
        -> Result<Rc<dyn CompiledCode>, CompileRefusal>;

    /// Stop dispatching to a region's code; its memory is released once no
    /// frame still runs it.
    fn retire(&mut self, region: RegionId);

    /// Release retired code no frame runs any more; returns how many
    /// entries were freed.
    fn reclaim(&mut self) -> usize {
        0
    }
}
