//! Deoptimization support
//!
//! Every place where native code can hand control back to the interpreter
//! is an exit point. The table built here is the deopt map: it tells the VM
//! which bytecode offset to resume at, how deep the operand stack is there
//! and which frame slots the code wrote before leaving. Speculations add a
//! [`GuardRecord`] naming the exit taken when they fail.

use core_types::TypeTag;
use interpreter::{ExitKind, ExitPoint, FrameSlot};

/// What a guard checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardKind {
    /// Both operands of a binary site are integers
    IntOperands,
    /// Both operands of a binary site are floats
    FloatOperands,
    /// The operand of a unary site is an integer
    IntOperand,
    /// A local holds the tag it always held on loop entry
    EntryTag {
        /// Local slot
        local: u16,
        /// Expected tag
        tag: TypeTag,
    },
}

/// One speculation in compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardRecord {
    /// What is checked
    pub kind: GuardKind,
    /// Instruction the speculation belongs to
    pub offset: usize,
    /// Exit taken on failure
    pub exit: u32,
}

/// Exit points and guards of one region, in creation order
#[derive(Debug, Clone, Default)]
pub struct ExitTable {
    exits: Vec<ExitPoint>,
    guards: Vec<GuardRecord>,
    local_count: u16,
}

impl ExitTable {
    /// Empty table for a frame with `local_count` locals
    pub fn new(local_count: u16) -> Self {
        Self {
            exits: Vec::new(),
            guards: Vec::new(),
            local_count,
        }
    }

    /// Add an exit that writes every local and the bottom `stack_depth`
    /// operands; returns its id.
    pub fn add_exit(&mut self, kind: ExitKind, offset: usize, stack_depth: u32) -> u32 {
        let written = (0..self.local_count)
            .map(FrameSlot::Local)
            .chain((0..stack_depth).map(FrameSlot::Operand))
            .collect();
        self.exits.push(ExitPoint {
            kind,
            offset,
            stack_depth,
            written,
        });
        (self.exits.len() - 1) as u32
    }

    /// Add a guard with its own deopt exit; returns the exit id.
    pub fn add_guard(&mut self, kind: GuardKind, offset: usize, stack_depth: u32) -> u32 {
        let exit = self.add_exit(ExitKind::Guard, offset, stack_depth);
        self.guards.push(GuardRecord { kind, offset, exit });
        exit
    }

    /// Exit point by id
    pub fn get(&self, id: u32) -> Option<&ExitPoint> {
        self.exits.get(id as usize)
    }

    /// Number of exits
    pub fn len(&self) -> usize {
        self.exits.len()
    }

    /// Whether there are no exits
    pub fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }

    /// Guards in creation order
    pub fn guards(&self) -> &[GuardRecord] {
        &self.guards
    }

    /// Split into exit points and guards
    pub fn into_parts(self) -> (Vec<ExitPoint>, Vec<GuardRecord>) {
        (self.exits, self.guards)
    }
}
