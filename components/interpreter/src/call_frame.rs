//! Call frame for function call stack management

use std::rc::Rc;

use core_types::{FunctionId, Handle};

use crate::backend::CompiledCode;

/// Native code currently running a frame
#[derive(Debug, Clone)]
pub struct ActiveNative {
    /// The code; holding it keeps a retired entry's memory alive
    pub entry: Rc<dyn CompiledCode>,
    /// Exit point of the call in progress, if any
    pub exit_hint: Option<u32>,
}

/// Call frame representing a function invocation
///
/// The frame owns the value stack slots from `base`: `local_count` locals
/// followed by the operand stack. The callee value sits just below `base`
/// and is replaced by the return value.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Function being executed
    pub function: FunctionId,
    /// Closure providing captures
    pub closure: Option<Handle>,
    /// Next instruction to execute
    pub ip: usize,
    /// Stack slot of local 0
    pub base: usize,
    /// Set while native code runs this frame
    pub native: Option<ActiveNative>,
}

impl CallFrame {
    /// Create a new call frame positioned at the first instruction
    pub fn new(function: FunctionId, closure: Option<Handle>, base: usize) -> Self {
        Self {
            function,
            closure,
            ip: 0,
            base,
            native: None,
        }
    }

    /// Offset of the instruction being executed (the call in progress for
    /// frames below the top)
    pub fn current_offset(&self) -> usize {
        match &self.native {
            Some(active) => active
                .exit_hint
                .and_then(|id| active.entry.exit_point(id))
                .map_or_else(|| active.entry.region().entry_offset(), |p| p.offset),
            None => self.ip.saturating_sub(1),
        }
    }

    /// Whether native code runs this frame
    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }
}
