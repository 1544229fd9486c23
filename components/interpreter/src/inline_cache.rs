//! Inline caching
//!
//! A call site caches the resolved target keyed by the callee value, so a
//! repeated call skips type dispatch and the arity check. A field site
//! caches the slot of its key keyed by the map's shape, so a repeated
//! access skips the name lookup. Both move through mono/poly/megamorphic
//! states as more keys are seen.

use arrayvec::ArrayVec;
use core_types::FunctionId;

use crate::config::MAX_POLYMORPHIC_ENTRIES;

/// What a callee resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTarget {
    /// Bytecode function with its closure in the callee slot
    Closure(FunctionId),
    /// Builtin in the callee slot
    Native,
}

impl CallTarget {
    /// Word stored in a native cache slot
    pub fn to_bits(self) -> u64 {
        match self {
            CallTarget::Closure(id) => u64::from(id.0),
            CallTarget::Native => u64::MAX,
        }
    }

    /// Inverse of [`CallTarget::to_bits`]
    pub fn from_bits(bits: u64) -> Self {
        match u32::try_from(bits) {
            Ok(id) => CallTarget::Closure(FunctionId(id)),
            Err(_) => CallTarget::Native,
        }
    }
}

/// Inline cache for one call site
///
/// Keys are callee value bits; a closure's identity determines its
/// function and therefore its arity.
pub type CallCache = InlineCache<CallTarget>;

/// Inline cache for one field site: shape index to slot
pub type FieldCache = InlineCache<u32>;

/// Per-site cache from a key word to a resolved target
#[derive(Debug, Clone, PartialEq)]
pub enum InlineCache<T> {
    /// Nothing seen yet
    Uninitialized,
    /// Single key cached (most common case)
    Monomorphic {
        /// Key bits
        key: u64,
        /// Resolved target
        target: T,
    },
    /// Several keys cached
    Polymorphic {
        /// (key bits, target) pairs
        entries: ArrayVec<(u64, T), MAX_POLYMORPHIC_ENTRIES>,
    },
    /// Too many keys, always take the generic path
    Megamorphic,
}

/// Coarse state of an inline cache, for reports and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// Nothing seen yet
    Uninitialized,
    /// One key cached
    Monomorphic,
    /// This many keys cached
    Polymorphic(usize),
    /// Caching abandoned
    Megamorphic,
}

impl<T> Default for InlineCache<T> {
    fn default() -> Self {
        InlineCache::Uninitialized
    }
}

impl<T: Copy> InlineCache<T> {
    /// Create a new uninitialized cache
    pub fn new() -> Self {
        InlineCache::Uninitialized
    }

    /// Cached target for a key
    pub fn lookup(&self, key: u64) -> Option<T> {
        match self {
            InlineCache::Uninitialized | InlineCache::Megamorphic => None,
            InlineCache::Monomorphic {
                key: cached,
                target,
            } => (*cached == key).then_some(*target),
            InlineCache::Polymorphic { entries } => entries
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, target)| *target),
        }
    }

    /// Record a resolved key.
    ///
    /// Uninitialized → Monomorphic → Polymorphic (up to `limit` entries)
    /// → Megamorphic.
    pub fn update(&mut self, key: u64, target: T, limit: usize) {
        let limit = limit.clamp(1, MAX_POLYMORPHIC_ENTRIES);
        match self {
            InlineCache::Uninitialized => {
                *self = InlineCache::Monomorphic { key, target };
            }
            InlineCache::Monomorphic {
                key: cached,
                target: cached_target,
            } => {
                if *cached == key {
                    *cached_target = target;
                } else if limit < 2 {
                    *self = InlineCache::Megamorphic;
                } else {
                    let mut entries = ArrayVec::new();
                    entries.push((*cached, *cached_target));
                    entries.push((key, target));
                    *self = InlineCache::Polymorphic { entries };
                }
            }
            InlineCache::Polymorphic { entries } => {
                if let Some(entry) = entries.iter_mut().find(|(k, _)| *k == key) {
                    entry.1 = target;
                } else if entries.len() < limit {
                    entries.push((key, target));
                } else {
                    *self = InlineCache::Megamorphic;
                }
            }
            InlineCache::Megamorphic => {}
        }
    }

    /// Whether the site gave up caching
    pub fn is_megamorphic(&self) -> bool {
        matches!(self, InlineCache::Megamorphic)
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        match self {
            InlineCache::Uninitialized | InlineCache::Megamorphic => 0,
            InlineCache::Monomorphic { .. } => 1,
            InlineCache::Polymorphic { entries } => entries.len(),
        }
    }

    /// Coarse state
    pub fn state(&self) -> CacheState {
        match self {
            InlineCache::Uninitialized => CacheState::Uninitialized,
            InlineCache::Monomorphic { .. } => CacheState::Monomorphic,
            InlineCache::Polymorphic { entries } => CacheState::Polymorphic(entries.len()),
            InlineCache::Megamorphic => CacheState::Megamorphic,
        }
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
