//! Runtime helpers called from native code
//!
//! Every operation native code does not inline goes through one of these.
//! They call the same VM operations the interpreter uses, so results and
//! error messages are identical in both tiers. Values cross the boundary
//! as raw words; a helper that fails stores the error on the VM and
//! returns [`ERROR_BITS`], and the caller leaves through an error exit.

use core_types::{RuntimeError, Value};
use interpreter::{BinaryOp, ERROR_BITS, VM};

use crate::compiled_code::{CallSite, FieldSite};

/// Runtime helper callable from generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    /// `lev_binary(vm, op, a, b)`
    Binary,
    /// `lev_negate(vm, v)`
    Negate,
    /// `lev_truthy(vm, v)`, 0 or 1
    Truthy,
    /// `lev_get_index(vm, container, key)`
    GetIndex,
    /// `lev_set_index(vm, container, key, value)`
    SetIndex,
    /// `lev_get_field(vm, site, object)`
    GetField,
    /// `lev_set_field(vm, site, object, value)`
    SetField,
    /// `lev_load_global(vm, slot)`
    LoadGlobal,
    /// `lev_store_global(vm, slot, value)`
    StoreGlobal,
    /// `lev_load_capture(vm, index)`
    LoadCapture,
    /// `lev_store_capture(vm, index, value)`
    StoreCapture,
    /// `lev_build_list(vm, top, count)`
    BuildList,
    /// `lev_build_map(vm, top, count)`
    BuildMap,
    /// `lev_make_closure(vm, offset)`
    MakeClosure,
    /// `lev_throw(vm, value)`
    Throw,
    /// `lev_call_generic(vm, site, top, argc, exit)`
    CallGeneric,
    /// `lev_call_cached(vm, site, top, argc, exit)`
    CallCached,
}

impl Helper {
    /// Machine address of the helper
    pub fn address(self) -> usize {
        match self {
            Helper::Binary => lev_binary as usize,
            Helper::Negate => lev_negate as usize,
            Helper::Truthy => lev_truthy as usize,
            Helper::GetIndex => lev_get_index as usize,
            Helper::SetIndex => lev_set_index as usize,
            Helper::GetField => lev_get_field as usize,
            Helper::SetField => lev_set_field as usize,
            Helper::LoadGlobal => lev_load_global as usize,
            Helper::StoreGlobal => lev_store_global as usize,
            Helper::LoadCapture => lev_load_capture as usize,
            Helper::StoreCapture => lev_store_capture as usize,
            Helper::BuildList => lev_build_list as usize,
            Helper::BuildMap => lev_build_map as usize,
            Helper::MakeClosure => lev_make_closure as usize,
            Helper::Throw => lev_throw as usize,
            Helper::CallGeneric => lev_call_generic as usize,
            Helper::CallCached => lev_call_cached as usize,
        }
    }

    /// Number of word parameters, the VM pointer included; every helper
    /// returns one word.
    pub fn arity(self) -> usize {
        match self {
            Helper::Negate
            | Helper::Truthy
            | Helper::LoadGlobal
            | Helper::LoadCapture
            | Helper::MakeClosure
            | Helper::Throw => 2,
            Helper::GetIndex
            | Helper::GetField
            | Helper::StoreGlobal
            | Helper::StoreCapture
            | Helper::BuildList
            | Helper::BuildMap => 3,
            Helper::Binary | Helper::SetIndex | Helper::SetField => 4,
            Helper::CallGeneric | Helper::CallCached => 5,
        }
    }
}

fn value_or_error(vm: &mut VM, result: Result<Value, RuntimeError>) -> u64 {
    match result {
        Ok(value) => value.to_bits(),
        Err(err) => {
            vm.set_pending_error(err);
            ERROR_BITS
        }
    }
}

fn unit_or_error(vm: &mut VM, result: Result<(), RuntimeError>) -> u64 {
    value_or_error(vm, result.map(|()| Value::NONE))
}

/// # Safety
///
/// `vm` must be the VM running the calling native frame, with no other
/// live reference to it.
unsafe extern "C" fn lev_binary(vm: *mut VM, op: u64, a: u64, b: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    let Some(op) = u32::try_from(op).ok().and_then(BinaryOp::from_code) else {
        panic!("native code passed unknown operator code {op}");
    };
    let result = vm.binary_op(op, Value::from_bits(a), Value::from_bits(b));
    value_or_error(vm, result)
}

/// # Safety
///
/// See [`lev_binary`].
unsafe extern "C" fn lev_negate(vm: *mut VM, value: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    let result = vm.negate(Value::from_bits(value));
    value_or_error(vm, result)
}

/// # Safety
///
/// See [`lev_binary`].
unsafe extern "C" fn lev_truthy(vm: *mut VM, value: u64) -> u64 {
    let vm = unsafe { &*vm };
    u64::from(vm.is_truthy(Value::from_bits(value)))
}

/// # Safety
///
/// See [`lev_binary`].
unsafe extern "C" fn lev_get_index(vm: *mut VM, container: u64, key: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    let result = vm.get_index(Value::from_bits(container), Value::from_bits(key));
    value_or_error(vm, result)
}

/// # Safety
///
/// See [`lev_binary`].
unsafe extern "C" fn lev_set_index(vm: *mut VM, container: u64, key: u64, value: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    let result = vm.set_index(
        Value::from_bits(container),
        Value::from_bits(key),
        Value::from_bits(value),
    );
    unit_or_error(vm, result)
}

/// Read a field through the site's cache; a miss takes the interpreter's
/// path and caches the slot it found.
///
/// # Safety
///
/// See [`lev_binary`]. `site` must point into the running entry's field
/// sites.
unsafe extern "C" fn lev_get_field(vm: *mut VM, site: *const FieldSite, object: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    let site = unsafe { &*site };
    let object = Value::from_bits(object);
    let shape = vm.heap().shape_of(object);
    if let Some(value) = site.lookup(shape).and_then(|slot| vm.heap().map_slot(object, slot)) {
        return value.to_bits();
    }
    let result = vm.get_field(object, site.name());
    if let (Ok(_), Some(shape)) = (&result, shape) {
        if let Some(slot) = vm.heap().shapes().slot(shape, site.key()) {
            site.record(shape, slot);
        }
    }
    value_or_error(vm, result)
}

/// Store a field through the site's cache. Only stores to an existing key
/// are cached; adding a key changes the map's shape.
///
/// # Safety
///
/// See [`lev_get_field`].
unsafe extern "C" fn lev_set_field(
    vm: *mut VM,
    site: *const FieldSite,
    object: u64,
    value: u64,
) -> u64 {
    let vm = unsafe { &mut *vm };
    let site = unsafe { &*site };
    let (object, value) = (Value::from_bits(object), Value::from_bits(value));
    let shape = vm.heap().shape_of(object);
    if let Some(slot) = site.lookup(shape) {
        if vm.set_field_slot(object, slot, value) {
            return Value::NONE.to_bits();
        }
    }
    let result = vm.set_field(object, site.name(), value);
    if let (Ok(()), Some(shape)) = (&result, shape) {
        if vm.heap().shape_of(object) == Some(shape) {
            if let Some(slot) = vm.heap().shapes().slot(shape, site.key()) {
                site.record(shape, slot);
            }
        }
    }
    unit_or_error(vm, result)
}

/// # Safety
///
/// See [`lev_binary`].
unsafe extern "C" fn lev_load_global(vm: *mut VM, slot: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    let result = vm.load_global(slot as u32);
    value_or_error(vm, result)
}

/// # Safety
///
/// See [`lev_binary`].
unsafe extern "C" fn lev_store_global(vm: *mut VM, slot: u64, value: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    vm.store_global(slot as u32, Value::from_bits(value));
    0
}

/// # Safety
///
/// See [`lev_binary`].
unsafe extern "C" fn lev_load_capture(vm: *mut VM, index: u64) -> u64 {
    let vm = unsafe { &*vm };
    vm.load_capture(index as u16).to_bits()
}

/// # Safety
///
/// See [`lev_binary`].
unsafe extern "C" fn lev_store_capture(vm: *mut VM, index: u64, value: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    vm.store_capture(index as u16, Value::from_bits(value));
    0
}

/// # Safety
///
/// See [`lev_binary`]. The `count` operands below frame slot `top` must
/// have been stored.
unsafe extern "C" fn lev_build_list(vm: *mut VM, top: u64, count: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    vm.build_list_at(top as usize, count as usize).to_bits()
}

/// # Safety
///
/// See [`lev_build_list`].
unsafe extern "C" fn lev_build_map(vm: *mut VM, top: u64, count: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    let result = vm.build_map_at(top as usize, count as usize);
    value_or_error(vm, result)
}

/// # Safety
///
/// See [`lev_binary`]. Captured locals must have been stored.
unsafe extern "C" fn lev_make_closure(vm: *mut VM, offset: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    vm.make_closure_at(offset as usize).to_bits()
}

/// # Safety
///
/// See [`lev_binary`].
unsafe extern "C" fn lev_throw(vm: *mut VM, value: u64) -> u64 {
    let vm = unsafe { &mut *vm };
    let err = vm.throw_value(Value::from_bits(value));
    vm.set_pending_error(err);
    ERROR_BITS
}

/// Resolve the callee below frame slot `top`, consulting and updating the
/// site's cache, then call it.
///
/// # Safety
///
/// See [`lev_binary`]. `site` must point into the running entry's call
/// sites, and the callee and arguments below `top` must have been stored.
unsafe extern "C" fn lev_call_generic(
    vm: *mut VM,
    site: *const CallSite,
    top: u64,
    argc: u64,
    exit: u64,
) -> u64 {
    let vm = unsafe { &mut *vm };
    let site = unsafe { &*site };
    let (top, argc) = (top as usize, argc as usize);
    let callee = vm.callee_at(top, argc);
    let target = match site.lookup(callee) {
        Some(target) => target,
        None => match vm.resolve_call_target(callee, argc) {
            Ok(target) => {
                site.record(callee, target);
                target
            }
            Err(err) => {
                vm.set_pending_error(err);
                return ERROR_BITS;
            }
        },
    };
    let result = vm.call_from_native(target, top, argc, exit as u32);
    value_or_error(vm, result)
}

/// Call the site's fast-path target; the caller already matched the key.
///
/// # Safety
///
/// See [`lev_call_generic`].
unsafe extern "C" fn lev_call_cached(
    vm: *mut VM,
    site: *const CallSite,
    top: u64,
    argc: u64,
    exit: u64,
) -> u64 {
    let vm = unsafe { &mut *vm };
    let site = unsafe { &*site };
    site.fast_hit();
    let result = vm.call_from_native(site.fast_target(), top as usize, argc as usize, exit as u32);
    value_or_error(vm, result)
}
