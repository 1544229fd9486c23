//! Whole programs: function table, global names, entry point.

use core_types::FunctionId;
use serde::{Deserialize, Serialize};

use crate::analysis::FunctionLayout;
use crate::error::ProgramError;
use crate::function::{Constant, FunctionProto};
use crate::opcode::{CaptureSource, Opcode};

/// A compiled program as produced by the bytecode compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Function table; `MakeClosure` operands index into it
    pub functions: Vec<FunctionProto>,
    /// Global slot names; `LoadGlobal`/`StoreGlobal` index into it
    #[serde(default)]
    pub globals: Vec<String>,
    /// Function run first
    pub entry: FunctionId,
}

impl Program {
    /// Program consisting of a single entry function
    pub fn with_entry(main: FunctionProto) -> Self {
        Self {
            functions: vec![main],
            globals: Vec::new(),
            entry: FunctionId(0),
        }
    }

    /// Add a function and return its id
    pub fn add_function(&mut self, function: FunctionProto) -> FunctionId {
        self.functions.push(function);
        FunctionId((self.functions.len() - 1) as u32)
    }

    /// Slot of a global, adding it if new
    pub fn global(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.globals.iter().position(|g| g == name) {
            return idx as u32;
        }
        self.globals.push(name.to_string());
        (self.globals.len() - 1) as u32
    }

    /// Function by id
    pub fn function(&self, id: FunctionId) -> Option<&FunctionProto> {
        self.functions.get(id.index())
    }

    /// Parse the JSON program format
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Render the JSON program format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Check every operand and compute per-function layouts.
    ///
    /// Layouts are returned in function-table order.
    pub fn validate(&self) -> Result<Vec<FunctionLayout>, ProgramError> {
        let entry = self
            .function(self.entry)
            .ok_or(ProgramError::MissingEntry(self.entry.0))?;
        if entry.arity != 0 {
            return Err(ProgramError::EntryArity(entry.name.clone()));
        }
        self.functions
            .iter()
            .map(|f| {
                self.check_operands(f)?;
                FunctionLayout::analyze(f)
            })
            .collect()
    }

    fn check_operands(&self, f: &FunctionProto) -> Result<(), ProgramError> {
        for (offset, inst) in f.code.iter().enumerate() {
            let bad = |what: &'static str, index: u32| ProgramError::BadOperand {
                function: f.name.clone(),
                offset,
                what,
                index,
            };
            let check = |what: &'static str, index: u32, limit: usize| {
                if (index as usize) < limit {
                    Ok(())
                } else {
                    Err(bad(what, index))
                }
            };
            match &inst.opcode {
                Opcode::LoadConst(i) => check("constant", *i, f.constants.len())?,
                Opcode::GetField(i) | Opcode::SetField(i) => {
                    check("constant", *i, f.constants.len())?;
                    if !matches!(f.constants[*i as usize], Constant::Str(_)) {
                        return Err(ProgramError::FieldName {
                            function: f.name.clone(),
                            offset,
                            index: *i,
                        });
                    }
                }
                Opcode::LoadLocal(i) | Opcode::StoreLocal(i) => {
                    check("local", u32::from(*i), f.local_count as usize)?
                }
                Opcode::LoadGlobal(i) | Opcode::StoreGlobal(i) => {
                    check("global", *i, self.globals.len())?
                }
                Opcode::LoadCapture(i) | Opcode::StoreCapture(i) => {
                    check("capture", u32::from(*i), f.capture_count as usize)?
                }
                Opcode::MakeClosure(id, captures) => {
                    check("function", id.0, self.functions.len())?;
                    let target = &self.functions[id.index()];
                    if captures.len() != target.capture_count as usize {
                        return Err(bad("capture list of function", id.0));
                    }
                    for source in captures {
                        match *source {
                            CaptureSource::Local(i) => {
                                check("local", u32::from(i), f.local_count as usize)?
                            }
                            CaptureSource::Capture(i) => {
                                check("capture", u32::from(i), f.capture_count as usize)?
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
