//! Type specialization for JIT compilation
//!
//! Turns the interpreter's per-site type feedback into a lowering choice.
//! Speculative choices are backed by guards that deoptimize when they fail;
//! the unguarded choices are always correct and are all that generic
//! (post-deopt-limit) compilation may use.
//!
//! # Example
//!
//! ```
//! use core_types::{SiteFeedback, TagSet, TypeTag};
//! use interpreter::{BinaryOp, SpeculationLevel};
//! use jit_compiler::type_specialization::{specialize_binary, Specialization};
//!
//! let ints = SiteFeedback {
//!     lhs: TagSet::single(TypeTag::Int),
//!     rhs: TagSet::single(TypeTag::Int),
//!     hits: 100,
//! };
//! let level = SpeculationLevel::Speculative;
//! assert_eq!(specialize_binary(BinaryOp::Add, ints, level), Specialization::IntInt);
//! let level = SpeculationLevel::Generic;
//! assert_eq!(specialize_binary(BinaryOp::Add, ints, level), Specialization::Numeric);
//! ```

use core_types::{SiteFeedback, TagSet, TypeTag};
use interpreter::{BinaryOp, SpeculationLevel};

/// Lowering of a binary arithmetic or comparison site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Specialization {
    /// Guarded integer operation; overflow falls back to the helper
    IntInt,
    /// Guarded float operation
    FloatFloat,
    /// Integer and float fast paths, helper otherwise, no guard
    Numeric,
    /// Helper call only
    Generic,
}

impl Specialization {
    /// Whether the lowering carries a guard
    pub fn is_guarded(self) -> bool {
        matches!(self, Specialization::IntInt | Specialization::FloatFloat)
    }
}

/// Lowering of a unary minus site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnarySpecialization {
    /// Guarded integer negation
    Int,
    /// Helper call
    Generic,
}

/// Whether the float fast path covers an operator.
///
/// `%` keeps C `fmod` semantics and `^` needs `powf`; both stay in the
/// helper.
fn has_float_path(op: BinaryOp) -> bool {
    !matches!(op, BinaryOp::Mod | BinaryOp::Pow | BinaryOp::Is)
}

/// Choose the lowering of a binary site
pub fn specialize_binary(
    op: BinaryOp,
    feedback: SiteFeedback,
    level: SpeculationLevel,
) -> Specialization {
    if matches!(op, BinaryOp::Pow | BinaryOp::Is) {
        return Specialization::Generic;
    }
    let (lhs, rhs) = (feedback.lhs, feedback.rhs);
    if level == SpeculationLevel::Speculative {
        if lhs.only(TypeTag::Int) && rhs.only(TypeTag::Int) {
            return Specialization::IntInt;
        }
        if lhs.only(TypeTag::Float) && rhs.only(TypeTag::Float) && has_float_path(op) {
            return Specialization::FloatFloat;
        }
    }
    if lhs.is_numeric() && rhs.is_numeric() {
        Specialization::Numeric
    } else {
        Specialization::Generic
    }
}

/// Choose the lowering of a unary minus site
pub fn specialize_unary(feedback: SiteFeedback, level: SpeculationLevel) -> UnarySpecialization {
    if level == SpeculationLevel::Speculative && feedback.lhs.only(TypeTag::Int) {
        UnarySpecialization::Int
    } else {
        UnarySpecialization::Generic
    }
}

/// Locals a loop region may assume on entry: those that held a single
/// numeric tag every time the header was reached.
pub fn entry_guards(tags: &[TagSet], level: SpeculationLevel) -> Vec<(u16, TypeTag)> {
    if level == SpeculationLevel::Generic {
        return Vec::new();
    }
    tags.iter()
        .enumerate()
        .filter_map(|(local, set)| {
            let tag = if set.only(TypeTag::Int) {
                TypeTag::Int
            } else if set.only(TypeTag::Float) {
                TypeTag::Float
            } else {
                return None;
            };
            Some((local as u16, tag))
        })
        .collect()
}
