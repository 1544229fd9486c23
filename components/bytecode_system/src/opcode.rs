//! Bytecode opcodes for the stack machine.
//!
//! Operands live on the frame's operand stack above its local slots.
//! Jump operands are absolute instruction offsets within the function.

use core_types::FunctionId;
use serde::{Deserialize, Serialize};

/// Where a closure capture is read from in the creating frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureSource {
    /// A local slot of the creating frame
    Local(u16),
    /// A capture of the creating closure
    Capture(u16),
}

/// Bytecode opcodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    // Literals
    /// Push constant pool entry
    LoadConst(u32),
    /// Push none
    LoadNone,
    /// Push yes
    LoadTrue,
    /// Push no
    LoadFalse,

    // Variables
    /// Push local slot
    LoadLocal(u16),
    /// Pop into local slot
    StoreLocal(u16),
    /// Push global slot
    LoadGlobal(u32),
    /// Pop into global slot
    StoreGlobal(u32),
    /// Push capture of the running closure
    LoadCapture(u16),
    /// Pop into capture of the running closure
    StoreCapture(u16),

    // Stack
    /// Discard top
    Pop,
    /// Duplicate top
    Dup,

    // Arithmetic
    /// `a + b`, also string concatenation
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`, always float
    Div,
    /// `a % b`
    Mod,
    /// `a ^ b`, always float
    Pow,
    /// `-a`
    Neg,
    /// Logical negation of truthiness
    Not,

    // Comparison
    /// `a == b`
    Eq,
    /// `a != b`
    Ne,
    /// `a < b`
    Lt,
    /// `a <= b`
    Le,
    /// `a > b`
    Gt,
    /// `a >= b`
    Ge,
    /// Identity test
    Is,

    // Control flow
    /// Unconditional jump
    Jump(u32),
    /// Pop; jump if falsy
    JumpIfFalse(u32),
    /// Pop; jump if truthy
    JumpIfTrue(u32),
    /// Jump keeping top if falsy, else pop (`and`)
    JumpIfFalseOrPop(u32),
    /// Jump keeping top if truthy, else pop (`or`)
    JumpIfTrueOrPop(u32),

    // Containers
    /// Pop n values, push a list of them
    BuildList(u16),
    /// Pop n key/value pairs, push a map
    BuildMap(u16),
    /// Pop index and object, push element
    GetIndex,
    /// Pop value, index and object; store element
    SetIndex,
    /// Pop map, push member named by a string constant
    GetField(u32),
    /// Pop value and map; store member named by a string constant
    SetField(u32),

    // Functions
    /// Push a closure over the given captures
    MakeClosure(FunctionId, Vec<CaptureSource>),
    /// Call with n arguments; callee sits below them
    Call(u8),
    /// Return top of stack
    Return,
    /// Raise top of stack
    Throw,
}

impl Opcode {
    /// Check if this opcode ends a basic block
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Return
                | Opcode::Throw
                | Opcode::Jump(_)
                | Opcode::JumpIfFalse(_)
                | Opcode::JumpIfTrue(_)
                | Opcode::JumpIfFalseOrPop(_)
                | Opcode::JumpIfTrueOrPop(_)
        )
    }

    /// Check if control never falls through to the next instruction
    pub fn is_unconditional_terminator(&self) -> bool {
        matches!(self, Opcode::Return | Opcode::Jump(_) | Opcode::Throw)
    }

    /// Check if this opcode is a binary arithmetic operation
    pub fn is_binary_arithmetic(&self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow
        )
    }

    /// Check if this opcode is a comparison
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge
        )
    }

    /// Sites whose operand types the interpreter records
    pub fn is_profiled_site(&self) -> bool {
        self.is_binary_arithmetic()
            || self.is_comparison()
            || matches!(self, Opcode::Neg | Opcode::GetIndex | Opcode::SetIndex)
    }

    /// Jump target, if this opcode branches
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Opcode::Jump(t)
            | Opcode::JumpIfFalse(t)
            | Opcode::JumpIfTrue(t)
            | Opcode::JumpIfFalseOrPop(t)
            | Opcode::JumpIfTrueOrPop(t) => Some(*t),
            _ => None,
        }
    }

    /// Values popped and pushed on the fall-through path
    pub fn stack_effect(&self) -> (u32, u32) {
        match self {
            Opcode::LoadConst(_)
            | Opcode::LoadNone
            | Opcode::LoadTrue
            | Opcode::LoadFalse
            | Opcode::LoadLocal(_)
            | Opcode::LoadGlobal(_)
            | Opcode::LoadCapture(_)
            | Opcode::MakeClosure(..) => (0, 1),
            Opcode::StoreLocal(_)
            | Opcode::StoreGlobal(_)
            | Opcode::StoreCapture(_)
            | Opcode::Pop
            | Opcode::JumpIfFalse(_)
            | Opcode::JumpIfTrue(_)
            | Opcode::JumpIfFalseOrPop(_)
            | Opcode::JumpIfTrueOrPop(_) => (1, 0),
            Opcode::Dup => (1, 2),
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Is
            | Opcode::GetIndex => (2, 1),
            Opcode::Neg | Opcode::Not | Opcode::GetField(_) => (1, 1),
            Opcode::SetIndex => (3, 0),
            Opcode::SetField(_) => (2, 0),
            Opcode::BuildList(n) => (u32::from(*n), 1),
            Opcode::BuildMap(n) => (2 * u32::from(*n), 1),
            Opcode::Call(argc) => (u32::from(*argc) + 1, 1),
            Opcode::Jump(_) => (0, 0),
            Opcode::Return | Opcode::Throw => (1, 0),
        }
    }

    /// Stack effect when the branch is taken, for branching opcodes
    pub fn branch_effect(&self) -> Option<(u32, u32)> {
        match self {
            Opcode::Jump(_) => Some((0, 0)),
            Opcode::JumpIfFalse(_) | Opcode::JumpIfTrue(_) => Some((1, 0)),
            Opcode::JumpIfFalseOrPop(_) | Opcode::JumpIfTrueOrPop(_) => Some((0, 0)),
            _ => None,
        }
    }

    /// Operator symbol used in error messages
    pub fn symbol(&self) -> &'static str {
        match self {
            Opcode::Add => "+",
            Opcode::Sub => "-",
            Opcode::Mul => "*",
            Opcode::Div => "/",
            Opcode::Mod => "%",
            Opcode::Pow => "^",
            Opcode::Eq => "==",
            Opcode::Ne => "!=",
            Opcode::Lt => "<",
            Opcode::Le => "<=",
            Opcode::Gt => ">",
            Opcode::Ge => ">=",
            Opcode::Neg => "-",
            Opcode::Not => "not",
            _ => "?",
        }
    }
}
