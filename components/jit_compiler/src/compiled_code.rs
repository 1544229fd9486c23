//! Compiled region entries
//!
//! A [`CompiledEntry`] bundles a region's machine code with its deopt map,
//! its guards and the inline caches of its call and field sites. Native
//! code addresses the sites directly, so they live in boxed slices that
//! never move.

use std::cell::{Cell, RefCell};

use core_types::{RegionId, ShapeId, Value};
use interpreter::{
    CallCache, CallTarget, CompiledCode, ExitPoint, FieldCache, NativeExit, SiteKind, SiteReport,
    SpeculationLevel, UNSET_BITS, VM,
};
use tracing::trace;

use crate::code_cache::ExecutableMemory;
use crate::deopt::GuardRecord;
use crate::type_specialization::Specialization;

/// Signature of generated code: frame slots in, 0 for return (value in
/// slot 0) or exit id + 1 out.
pub type EntryFn = unsafe extern "C" fn(vm: *mut VM, slots: *mut u64) -> u32;

/// Inline cache of one call site.
///
/// `key` and `target` are read by native code: a callee whose bits equal
/// `key` is called as `target` without resolution. `UNSET_BITS` in `key`
/// matches no value.
#[derive(Debug)]
#[repr(C)]
pub struct CallSite {
    key: Cell<u64>,
    target: Cell<u64>,
    cache: RefCell<CallCache>,
    limit: usize,
    offset: usize,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

impl CallSite {
    /// Byte offset of the key word
    pub const KEY_OFFSET: i32 = 0;
    /// Byte offset of the target word
    pub const TARGET_OFFSET: i32 = 8;

    /// Empty cache for the call at `offset`
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            key: Cell::new(UNSET_BITS),
            target: Cell::new(0),
            cache: RefCell::new(CallCache::new()),
            limit,
            offset,
            hits: Cell::new(0),
            misses: Cell::new(0),
        }
    }

    /// Bytecode offset of the call
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Cached target for a callee; counts a hit or a miss.
    pub fn lookup(&self, callee: Value) -> Option<CallTarget> {
        let target = self.cache.borrow().lookup(callee.to_bits());
        count(if target.is_some() { &self.hits } else { &self.misses });
        target
    }

    /// Count a call taken through the native fast path
    pub fn fast_hit(&self) {
        count(&self.hits);
    }

    /// Target the fast path calls
    pub fn fast_target(&self) -> CallTarget {
        CallTarget::from_bits(self.target.get())
    }

    /// Snapshot of the cache state
    pub fn state(&self) -> CallCache {
        self.cache.borrow().clone()
    }

    /// Record a resolved callee and refresh the fast-path words.
    pub fn record(&self, callee: Value, target: CallTarget) {
        let mut cache = self.cache.borrow_mut();
        let before = cache.len();
        cache.update(callee.to_bits(), target, self.limit);
        match &*cache {
            CallCache::Monomorphic { key, target } => {
                self.key.set(*key);
                self.target.set(target.to_bits());
            }
            CallCache::Polymorphic { entries } => {
                if let Some((key, target)) = entries.first() {
                    self.key.set(*key);
                    self.target.set(target.to_bits());
                }
            }
            CallCache::Megamorphic | CallCache::Uninitialized => self.key.set(UNSET_BITS),
        }
        if cache.len() != before {
            trace!(offset = self.offset, entries = cache.len(), "call site cache grew");
        } else if cache.is_megamorphic() {
            trace!(offset = self.offset, "call site megamorphic");
        }
    }
}

fn count(counter: &Cell<u64>) {
    counter.set(counter.get() + 1);
}

/// Inline cache of one `GetField` or `SetField` site.
///
/// Keyed by map shape: a shape the cache knows resolves straight to the
/// slot holding the site's key. Maps without a shape always miss.
#[derive(Debug)]
pub struct FieldSite {
    kind: SiteKind,
    name: u32,
    key: Box<str>,
    cache: RefCell<FieldCache>,
    limit: usize,
    offset: usize,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

impl FieldSite {
    /// Empty cache for the field access at `offset`; `name` indexes the
    /// function's constants and `key` is the constant's text.
    pub fn new(kind: SiteKind, offset: usize, name: u32, key: &str, limit: usize) -> Self {
        Self {
            kind,
            name,
            key: key.into(),
            cache: RefCell::new(FieldCache::new()),
            limit,
            offset,
            hits: Cell::new(0),
            misses: Cell::new(0),
        }
    }

    /// Bytecode offset of the access
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// `GetField` or `SetField`
    pub fn kind(&self) -> SiteKind {
        self.kind
    }

    /// Constant index of the field name
    pub fn name(&self) -> u32 {
        self.name
    }

    /// Field name
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Slot of the key in maps of `shape`; counts a hit or a miss.
    pub fn lookup(&self, shape: Option<ShapeId>) -> Option<u32> {
        let slot = shape.and_then(|shape| self.cache.borrow().lookup(u64::from(shape.index())));
        count(if slot.is_some() { &self.hits } else { &self.misses });
        slot
    }

    /// Record the slot resolved for a shape.
    pub fn record(&self, shape: ShapeId, slot: u32) {
        let mut cache = self.cache.borrow_mut();
        let before = cache.len();
        cache.update(u64::from(shape.index()), slot, self.limit);
        if cache.len() != before {
            trace!(offset = self.offset, field = %self.key, entries = cache.len(), "field site cache grew");
        } else if cache.is_megamorphic() {
            trace!(offset = self.offset, field = %self.key, "field site megamorphic");
        }
    }

    /// Snapshot of the cache state
    pub fn state(&self) -> FieldCache {
        self.cache.borrow().clone()
    }

    fn report(&self) -> SiteReport {
        SiteReport {
            offset: self.offset,
            kind: self.kind,
            state: self.cache.borrow().state(),
            hits: self.hits.get(),
            misses: self.misses.get(),
        }
    }
}

/// Native code for one region
#[derive(Debug)]
pub struct CompiledEntry {
    region: RegionId,
    speculation: SpeculationLevel,
    memory: ExecutableMemory,
    exits: Vec<ExitPoint>,
    guards: Vec<GuardRecord>,
    call_sites: Box<[CallSite]>,
    field_sites: Box<[FieldSite]>,
    specializations: Vec<(usize, Specialization)>,
}

/// Inline caches of a region, in bytecode order
#[derive(Debug, Default)]
pub struct Sites {
    /// One per `Call`
    pub calls: Box<[CallSite]>,
    /// One per `GetField` and `SetField`
    pub fields: Box<[FieldSite]>,
}

impl CompiledEntry {
    /// Assemble an entry from its parts
    pub fn new(
        region: RegionId,
        speculation: SpeculationLevel,
        memory: ExecutableMemory,
        exits: Vec<ExitPoint>,
        guards: Vec<GuardRecord>,
        sites: Sites,
        specializations: Vec<(usize, Specialization)>,
    ) -> Self {
        Self {
            region,
            speculation,
            memory,
            exits,
            guards,
            call_sites: sites.calls,
            field_sites: sites.fields,
            specializations,
        }
    }

    /// Region this code implements
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Deopt map
    pub fn exits(&self) -> &[ExitPoint] {
        &self.exits
    }

    /// Speculations and their exits
    pub fn guards(&self) -> &[GuardRecord] {
        &self.guards
    }

    /// Call-site caches, in bytecode order
    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    /// Field-site caches, in bytecode order
    pub fn field_sites(&self) -> &[FieldSite] {
        &self.field_sites
    }

    /// Lowering chosen for each arithmetic and comparison site
    pub fn specializations(&self) -> &[(usize, Specialization)] {
        &self.specializations
    }
}

impl CompiledCode for CompiledEntry {
    fn region(&self) -> RegionId {
        self.region
    }

    fn speculation(&self) -> SpeculationLevel {
        self.speculation
    }

    fn exit_point(&self, id: u32) -> Option<&ExitPoint> {
        self.exits.get(id as usize)
    }

    fn code_size(&self) -> usize {
        self.memory.len()
    }

    fn invoke(&self, vm: &mut VM, base: usize) -> NativeExit {
        let slots = vm.slots_ptr(base);
        // SAFETY: the mapping holds code generated for `EntryFn`, and the VM
        // sized the frame at `base` for this function before dispatching.
        let status = unsafe {
            let entry = std::mem::transmute::<*const u8, EntryFn>(self.memory.as_ptr());
            entry(vm, slots)
        };
        match status {
            // SAFETY: slot 0 of the frame holds the returned value.
            0 => NativeExit::Return(Value::from_bits(unsafe { slots.read() })),
            n => NativeExit::Exit(n - 1),
        }
    }

    fn inline_caches(&self) -> Vec<SiteReport> {
        let calls = self.call_sites.iter().map(|site| SiteReport {
            offset: site.offset,
            kind: SiteKind::Call,
            state: site.cache.borrow().state(),
            hits: site.hits.get(),
            misses: site.misses.get(),
        });
        let mut reports: Vec<_> = calls.chain(self.field_sites.iter().map(FieldSite::report)).collect();
        reports.sort_by_key(|report| report.offset);
        reports
    }
}
