//! Label-based function builder.
//!
//! Forward jumps are emitted with a placeholder and patched once the
//! label is bound.
//!
//! ```
//! use bytecode_system::{Assembler, Opcode};
//!
//! // return 1 if the argument is truthy, else 2
//! let mut asm = Assembler::new("pick", 1, 1);
//! let otherwise = asm.label();
//! asm.emit(Opcode::LoadLocal(0));
//! asm.jump_if_false(otherwise);
//! asm.load_int(1);
//! asm.emit(Opcode::Return);
//! asm.bind(otherwise);
//! asm.load_int(2);
//! asm.emit(Opcode::Return);
//! let f = asm.finish().unwrap();
//! assert_eq!(f.code[1].opcode, Opcode::JumpIfFalse(4));
//! ```

use crate::error::ProgramError;
use crate::function::{Constant, FunctionProto, HandlerEntry};
use crate::opcode::Opcode;

/// Jump target placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Incremental builder for one [`FunctionProto`]
#[derive(Debug)]
pub struct Assembler {
    function: FunctionProto,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
    handlers: Vec<(Label, Label, Label, u32)>,
}

impl Assembler {
    /// Start a function
    pub fn new(name: impl Into<String>, arity: u16, local_count: u16) -> Self {
        Self {
            function: FunctionProto::new(name, arity, local_count),
            labels: Vec::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Declare how many captures closures over this function carry
    pub fn captures(&mut self, count: u16) -> &mut Self {
        self.function.capture_count = count;
        self
    }

    /// Offset of the next instruction
    pub fn offset(&self) -> usize {
        self.function.code.len()
    }

    /// Fresh unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the next instruction
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.offset() as u32);
    }

    /// Fresh label bound here
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.bind(label);
        label
    }

    /// Emit an instruction and return its offset
    pub fn emit(&mut self, opcode: Opcode) -> usize {
        self.function.emit(opcode)
    }

    /// Emit a branch built by `make` towards `label`
    pub fn branch(&mut self, make: fn(u32) -> Opcode, label: Label) -> usize {
        let at = self.emit(make(u32::MAX));
        self.fixups.push((at, label));
        at
    }

    /// Unconditional jump
    pub fn jump(&mut self, label: Label) -> usize {
        self.branch(Opcode::Jump, label)
    }

    /// Pop and jump when falsy
    pub fn jump_if_false(&mut self, label: Label) -> usize {
        self.branch(Opcode::JumpIfFalse, label)
    }

    /// Pop and jump when truthy
    pub fn jump_if_true(&mut self, label: Label) -> usize {
        self.branch(Opcode::JumpIfTrue, label)
    }

    /// Add a constant
    pub fn constant(&mut self, constant: Constant) -> u32 {
        self.function.add_constant(constant)
    }

    /// Push an integer literal
    pub fn load_int(&mut self, value: i64) -> usize {
        let idx = self.constant(Constant::Int(value));
        self.emit(Opcode::LoadConst(idx))
    }

    /// Push a float literal
    pub fn load_float(&mut self, value: f64) -> usize {
        let idx = self.constant(Constant::Float(value));
        self.emit(Opcode::LoadConst(idx))
    }

    /// Push a string literal
    pub fn load_str(&mut self, value: &str) -> usize {
        let idx = self.constant(Constant::Str(value.to_string()));
        self.emit(Opcode::LoadConst(idx))
    }

    /// Register a handler for `start..end` entering at `target`
    pub fn handler(&mut self, start: Label, end: Label, target: Label, stack_depth: u32) {
        self.handlers.push((start, end, target, stack_depth));
    }

    /// Resolve labels and produce the function
    pub fn finish(mut self) -> Result<FunctionProto, ProgramError> {
        let name = self.function.name.clone();
        let resolve = |labels: &[Option<u32>], label: Label| {
            labels[label.0].ok_or_else(|| ProgramError::UnboundLabel(name.clone()))
        };
        for (at, label) in std::mem::take(&mut self.fixups) {
            let target = resolve(&self.labels, label)?;
            let patched = match self.function.code[at].opcode {
                Opcode::Jump(_) => Opcode::Jump(target),
                Opcode::JumpIfFalse(_) => Opcode::JumpIfFalse(target),
                Opcode::JumpIfTrue(_) => Opcode::JumpIfTrue(target),
                Opcode::JumpIfFalseOrPop(_) => Opcode::JumpIfFalseOrPop(target),
                Opcode::JumpIfTrueOrPop(_) => Opcode::JumpIfTrueOrPop(target),
                ref other => other.clone(),
            };
            self.function.code[at].opcode = patched;
        }
        for (start, end, target, stack_depth) in std::mem::take(&mut self.handlers) {
            self.function.handlers.push(HandlerEntry {
                start: resolve(&self.labels, start)?,
                end: resolve(&self.labels, end)?,
                target: resolve(&self.labels, target)?,
                stack_depth,
            });
        }
        Ok(self.function)
    }
}
