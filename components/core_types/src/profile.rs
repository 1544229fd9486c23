//! Profiling data collected by the interpreter for tiering decisions.
//!
//! Placed in core_types so the interpreter (writer) and the JIT compiler
//! (reader) share it without depending on each other.

use std::collections::BTreeMap;
use std::fmt;

use crate::heap::{FunctionId, Heap, HeapObject};
use crate::value::{Value, ValueKind};

/// Observed operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    /// Integer
    Int = 0,
    /// Float
    Float = 1,
    /// Boolean
    Bool = 2,
    /// None
    None = 3,
    /// String
    Str = 4,
    /// List
    List = 5,
    /// Map
    Map = 6,
    /// Closure or native function
    Function = 7,
}

impl TypeTag {
    /// Tag of a value, looking through heap references.
    pub fn of(value: Value, heap: &Heap) -> TypeTag {
        match value.kind() {
            ValueKind::Int(_) => TypeTag::Int,
            ValueKind::Float(_) => TypeTag::Float,
            ValueKind::Bool(_) => TypeTag::Bool,
            ValueKind::None => TypeTag::None,
            ValueKind::Heap(h) => match heap.get(h) {
                HeapObject::String(_) => TypeTag::Str,
                HeapObject::List(_) => TypeTag::List,
                HeapObject::Map(_) => TypeTag::Map,
                HeapObject::Closure(_) | HeapObject::NativeFunction(_) => TypeTag::Function,
            },
        }
    }
}

/// Set of observed tags, one bit per [`TypeTag`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TagSet(u8);

impl TagSet {
    /// Nothing observed.
    pub const EMPTY: TagSet = TagSet(0);

    /// Set holding exactly one tag.
    pub fn single(tag: TypeTag) -> Self {
        TagSet(1 << tag as u8)
    }

    /// Record a tag.
    pub fn insert(&mut self, tag: TypeTag) {
        self.0 |= 1 << tag as u8;
    }

    /// Whether `tag` was observed.
    pub fn contains(self, tag: TypeTag) -> bool {
        self.0 & (1 << tag as u8) != 0
    }

    /// Nothing observed yet.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Exactly one tag observed.
    pub fn is_monomorphic(self) -> bool {
        self.0.count_ones() == 1
    }

    /// Exactly `tag` observed.
    pub fn only(self, tag: TypeTag) -> bool {
        self.0 == 1 << tag as u8
    }

    /// Non-empty and nothing but integers and floats.
    pub fn is_numeric(self) -> bool {
        let numeric = (1 << TypeTag::Int as u8) | (1 << TypeTag::Float as u8);
        self.0 != 0 && self.0 & !numeric == 0
    }

    /// Tags observed in either set.
    pub fn union(self, other: TagSet) -> TagSet {
        TagSet(self.0 | other.0)
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 8] = ["int", "float", "bool", "none", "str", "list", "map", "fn"];
        let mut first = true;
        for (bit, name) in NAMES.iter().enumerate() {
            if self.0 & (1 << bit) != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Operand types seen at one instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteFeedback {
    /// Left (or only) operand
    pub lhs: TagSet,
    /// Right operand of binary operations
    pub rhs: TagSet,
    /// Number of executions recorded
    pub hits: u32,
}

/// What kind of region a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegionKind {
    /// A whole function body, entered at offset 0
    Function,
    /// A loop body entered at its header
    Loop {
        /// Target of the loop's back-edges
        header: u32,
    },
}

/// Stable identity of a bytecode region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId {
    /// Function containing the region
    pub function: FunctionId,
    /// Function body or loop
    pub kind: RegionKind,
}

impl RegionId {
    /// The function body region.
    pub fn function(function: FunctionId) -> Self {
        Self {
            function,
            kind: RegionKind::Function,
        }
    }

    /// A loop region.
    pub fn loop_at(function: FunctionId, header: u32) -> Self {
        Self {
            function,
            kind: RegionKind::Loop { header },
        }
    }

    /// Bytecode offset where execution enters the region.
    pub fn entry_offset(&self) -> usize {
        match self.kind {
            RegionKind::Function => 0,
            RegionKind::Loop { header } => header as usize,
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RegionKind::Function => write!(f, "fn#{}", self.function.0),
            RegionKind::Loop { header } => write!(f, "fn#{}@loop{}", self.function.0, header),
        }
    }
}

/// Per-function profile: region counters and per-site type feedback.
///
/// Written by the interpreter only; the tiering controller reads the
/// counters and the JIT reads the feedback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileRecord {
    /// Calls of the function since the last reset
    pub invocations: u64,
    /// Back-edges taken per loop header since the last reset
    pub loop_iterations: BTreeMap<u32, u64>,
    /// Feedback per instruction offset
    pub sites: Vec<SiteFeedback>,
    /// Local slot tags observed on function entry
    pub entry_tags: Vec<TagSet>,
    /// Local slot tags observed on each loop header
    pub loop_entry_tags: BTreeMap<u32, Vec<TagSet>>,
}

impl ProfileRecord {
    /// Empty record sized for a function of `code_len` instructions.
    pub fn new(code_len: usize) -> Self {
        Self {
            sites: vec![SiteFeedback::default(); code_len],
            ..Self::default()
        }
    }

    /// Count one call and return the new count.
    pub fn record_invocation(&mut self) -> u64 {
        self.invocations += 1;
        self.invocations
    }

    /// Count one back-edge to `header` and return the new count.
    pub fn record_iteration(&mut self, header: u32) -> u64 {
        let count = self.loop_iterations.entry(header).or_insert(0);
        *count += 1;
        *count
    }

    /// Counter of a region.
    pub fn count(&self, region: RegionKind) -> u64 {
        match region {
            RegionKind::Function => self.invocations,
            RegionKind::Loop { header } => self.loop_iterations.get(&header).copied().unwrap_or(0),
        }
    }

    /// Reset a region's counter; type feedback is kept.
    pub fn reset(&mut self, region: RegionKind) {
        match region {
            RegionKind::Function => self.invocations = 0,
            RegionKind::Loop { header } => {
                self.loop_iterations.insert(header, 0);
            }
        }
    }

    /// Record a unary operand.
    pub fn record_unary(&mut self, offset: usize, operand: TypeTag) {
        if let Some(site) = self.sites.get_mut(offset) {
            site.lhs.insert(operand);
            site.hits = site.hits.saturating_add(1);
        }
    }

    /// Record binary operands.
    pub fn record_binary(&mut self, offset: usize, lhs: TypeTag, rhs: TypeTag) {
        if let Some(site) = self.sites.get_mut(offset) {
            site.lhs.insert(lhs);
            site.rhs.insert(rhs);
            site.hits = site.hits.saturating_add(1);
        }
    }

    /// Feedback at an offset.
    pub fn site(&self, offset: usize) -> SiteFeedback {
        self.sites.get(offset).copied().unwrap_or_default()
    }

    /// Widen the tag sets observed on entry to a region.
    pub fn record_entry_tags(&mut self, region: RegionKind, tags: impl Iterator<Item = TypeTag>) {
        let slots = match region {
            RegionKind::Function => &mut self.entry_tags,
            RegionKind::Loop { header } => self.loop_entry_tags.entry(header).or_default(),
        };
        for (i, tag) in tags.enumerate() {
            if i == slots.len() {
                slots.push(TagSet::EMPTY);
            }
            slots[i].insert(tag);
        }
    }

    /// Tag sets observed on entry to a region, one per local slot.
    pub fn region_entry_tags(&self, region: RegionKind) -> &[TagSet] {
        match region {
            RegionKind::Function => &self.entry_tags,
            RegionKind::Loop { header } => self
                .loop_entry_tags
                .get(&header)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        }
    }
}
