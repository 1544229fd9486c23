//! Static stack-height analysis and loop discovery.
//!
//! Both the interpreter (frame sizing) and the JIT (mapping operand stack
//! positions to variables, loop regions) rely on every reachable
//! instruction having one statically known operand depth.

use std::collections::BTreeMap;

use crate::error::ProgramError;
use crate::function::FunctionProto;

/// Loop body bounds: `header..=last_back_edge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopInfo {
    /// Target of the back-edges
    pub header: u32,
    /// Offset of the last back-edge jump
    pub end: u32,
}

impl LoopInfo {
    /// Whether an offset lies inside the body
    pub fn contains(&self, offset: usize) -> bool {
        (self.header as usize..=self.end as usize).contains(&offset)
    }
}

/// Static facts about one function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionLayout {
    /// Operand depth before each instruction; `None` if unreachable
    pub heights: Vec<Option<u32>>,
    /// Deepest operand stack
    pub max_stack: u32,
    /// Loops by header offset
    pub loops: BTreeMap<u32, LoopInfo>,
}

impl FunctionLayout {
    /// Analyze a function body.
    ///
    /// # Errors
    ///
    /// Underflow, inconsistent merges, out-of-range jumps, falling off the
    /// end and malformed handlers.
    pub fn analyze(function: &FunctionProto) -> Result<Self, ProgramError> {
        let name = || function.name.clone();
        let len = function.code.len();
        if len == 0 {
            return Err(ProgramError::EmptyFunction(name()));
        }

        let mut heights: Vec<Option<u32>> = vec![None; len];
        let mut max_stack = 0u32;
        let mut worklist: Vec<(usize, u32)> = vec![(0, 0)];

        for (index, handler) in function.handlers.iter().enumerate() {
            if handler.start > handler.end
                || handler.end as usize > len
                || handler.target as usize >= len
            {
                return Err(ProgramError::BadHandler {
                    function: name(),
                    index,
                });
            }
            worklist.push((handler.target as usize, handler.stack_depth + 1));
        }

        let visit = |offset: usize,
                         height: u32,
                         worklist: &mut Vec<(usize, u32)>,
                         heights: &mut Vec<Option<u32>>|
         -> Result<(), ProgramError> {
            match heights[offset] {
                Some(expected) if expected != height => Err(ProgramError::InconsistentStack {
                    function: name(),
                    offset,
                    expected,
                    found: height,
                }),
                Some(_) => Ok(()),
                None => {
                    heights[offset] = Some(height);
                    worklist.push((offset, height));
                    Ok(())
                }
            }
        };

        // Seed entries are recorded lazily so conflicting seeds are caught.
        let seeds = std::mem::take(&mut worklist);
        for (offset, height) in seeds {
            visit(offset, height, &mut worklist, &mut heights)?;
        }

        while let Some((offset, height)) = worklist.pop() {
            max_stack = max_stack.max(height);
            let opcode = &function.code[offset].opcode;
            let (pops, pushes) = opcode.stack_effect();
            if height < pops {
                return Err(ProgramError::StackUnderflow {
                    function: name(),
                    offset,
                });
            }
            let after = height - pops + pushes;
            max_stack = max_stack.max(after);

            if let (Some(target), Some((bpops, bpushes))) =
                (opcode.jump_target(), opcode.branch_effect())
            {
                if target as usize >= len {
                    return Err(ProgramError::BadJump {
                        function: name(),
                        offset,
                        target,
                    });
                }
                let taken = height - bpops + bpushes;
                visit(target as usize, taken, &mut worklist, &mut heights)?;
            }

            if !opcode.is_unconditional_terminator() {
                if offset + 1 >= len {
                    return Err(ProgramError::FallsOffEnd {
                        function: name(),
                        offset,
                    });
                }
                visit(offset + 1, after, &mut worklist, &mut heights)?;
            }
        }

        for (index, handler) in function.handlers.iter().enumerate() {
            let too_deep = (handler.start..handler.end)
                .filter_map(|o| heights[o as usize])
                .any(|h| h < handler.stack_depth);
            if too_deep {
                return Err(ProgramError::BadHandler {
                    function: name(),
                    index,
                });
            }
        }

        let mut loops: BTreeMap<u32, LoopInfo> = BTreeMap::new();
        for (offset, inst) in function.code.iter().enumerate() {
            if heights[offset].is_none() {
                continue;
            }
            if let Some(target) = inst.opcode.jump_target() {
                if target as usize <= offset {
                    let info = loops.entry(target).or_insert(LoopInfo {
                        header: target,
                        end: offset as u32,
                    });
                    info.end = info.end.max(offset as u32);
                }
            }
        }

        Ok(Self {
            heights,
            max_stack,
            loops,
        })
    }

    /// Operand depth before an instruction
    pub fn height(&self, offset: usize) -> Option<u32> {
        self.heights.get(offset).copied().flatten()
    }

    /// Whether a jump from `from` to `to` is a loop back-edge
    pub fn is_back_edge(&self, from: usize, to: usize) -> bool {
        to <= from && self.loops.contains_key(&(to as u32))
    }

    /// Innermost loop containing an offset
    pub fn innermost_loop(&self, offset: usize) -> Option<&LoopInfo> {
        self.loops
            .values()
            .filter(|l| l.contains(offset))
            .min_by_key(|l| l.end - l.header)
    }
}
