//! Function prototypes: code, constants and static metadata.

use serde::{Deserialize, Serialize};

use crate::instruction::Instruction;
use crate::opcode::Opcode;

/// Constant pool entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    /// Integer literal; out-of-range literals load as floats
    Int(i64),
    /// Float literal
    Float(f64),
    /// String literal
    Str(String),
}

/// Exception handler range.
///
/// An error raised at an offset in `start..end` transfers control to
/// `target` with the operand stack cut back to `stack_depth` and the caught
/// value pushed on top. The first matching entry wins, so compilers list
/// inner handlers before outer ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerEntry {
    /// First covered offset
    pub start: u32,
    /// One past the last covered offset
    pub end: u32,
    /// Handler entry offset
    pub target: u32,
    /// Operand depth restored before pushing the caught value
    pub stack_depth: u32,
}

impl HandlerEntry {
    /// Whether the range covers an offset
    pub fn covers(&self, offset: usize) -> bool {
        (self.start as usize..self.end as usize).contains(&offset)
    }
}

/// A compiled function body.
///
/// Frame layout: slots `0..arity` hold arguments, `arity..local_count`
/// hold the remaining locals (initialized to none), the operand stack
/// follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProto {
    /// Name used in tracebacks
    pub name: String,
    /// Number of parameters
    pub arity: u16,
    /// Number of local slots including parameters
    pub local_count: u16,
    /// Number of captures a closure over this function carries
    #[serde(default)]
    pub capture_count: u16,
    /// Instructions
    pub code: Vec<Instruction>,
    /// Constant pool
    #[serde(default)]
    pub constants: Vec<Constant>,
    /// Exception handler ranges
    #[serde(default)]
    pub handlers: Vec<HandlerEntry>,
}

impl FunctionProto {
    /// Create an empty function
    pub fn new(name: impl Into<String>, arity: u16, local_count: u16) -> Self {
        Self {
            name: name.into(),
            arity,
            local_count: local_count.max(arity),
            capture_count: 0,
            code: Vec::new(),
            constants: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Emit an instruction and return its offset
    pub fn emit(&mut self, opcode: Opcode) -> usize {
        self.code.push(Instruction::new(opcode));
        self.code.len() - 1
    }

    /// Add a constant, reusing an identical entry, and return its index
    pub fn add_constant(&mut self, constant: Constant) -> u32 {
        if let Some(idx) = self.constants.iter().position(|c| *c == constant) {
            return idx as u32;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    /// Opcode at an offset
    pub fn opcode(&self, offset: usize) -> Option<&Opcode> {
        self.code.get(offset).map(|i| &i.opcode)
    }

    /// First handler covering an offset
    pub fn handler_for(&self, offset: usize) -> Option<&HandlerEntry> {
        self.handlers.iter().find(|h| h.covers(offset))
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Whether the body is empty
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}
