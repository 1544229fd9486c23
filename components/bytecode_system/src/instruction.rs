//! Bytecode instruction representation

use serde::{Deserialize, Serialize};

use crate::opcode::Opcode;

/// A single bytecode instruction with optional source line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// The opcode for this instruction
    pub opcode: Opcode,
    /// Source line, when the compiler recorded one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Instruction {
    /// Create a new instruction without a source line
    pub fn new(opcode: Opcode) -> Self {
        Self { opcode, line: None }
    }

    /// Create a new instruction tagged with a source line
    pub fn with_line(opcode: Opcode, line: u32) -> Self {
        Self {
            opcode,
            line: Some(line),
        }
    }
}

impl From<Opcode> for Instruction {
    fn from(opcode: Opcode) -> Self {
        Instruction::new(opcode)
    }
}
