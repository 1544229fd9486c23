//! Bytecode to Cranelift IR
//!
//! A region becomes one function `(vm, slots) -> status`. Locals and
//! operand stack positions map to SSA variables: local `i` is variable `i`,
//! operand `p` is variable `local_count + p`, which works because every
//! reachable instruction has a static stack height. The prologue loads the
//! live slots, and every exit stores them back before returning its id.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::RangeInclusive;

use bytecode_system::{CaptureSource, Opcode};
use core_types::value::{CANONICAL_NAN, FALSE_BITS, NONE_BITS, PAYLOAD_MASK, TAG_INT, TRUE_BITS};
use core_types::{RegionKind, TypeTag};
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    types, AbiParam, Block, Function, InstBuilder, MemFlags, SigRef, Signature, Value,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use interpreter::{BinaryOp, CompileRefusal, CompileRequest, ExitKind, ERROR_BITS};

use crate::compiled_code::{CallSite, FieldSite, Sites};
use crate::deopt::{ExitTable, GuardKind};
use crate::helpers::Helper;
use crate::type_specialization::{
    entry_guards, specialize_binary, specialize_unary, Specialization, UnarySpecialization,
};

const WORD: i32 = 8;
const INT_TAG_HIGH: i64 = (TAG_INT >> 48) as i64;

/// Control-flow facts of a region, computed before any IR is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPlan {
    /// Bytecode offsets covered
    pub span: RangeInclusive<usize>,
    /// Offsets reachable from the entry without leaving the span
    pub reachable: BTreeSet<usize>,
    /// Offsets that start a block
    pub block_starts: BTreeSet<usize>,
}

/// Normal successors of an instruction: jump target and fall-through.
fn successors(opcode: &Opcode, offset: usize) -> Vec<usize> {
    let mut next = Vec::with_capacity(2);
    if let Some(target) = opcode.jump_target() {
        next.push(target as usize);
    }
    if !opcode.is_unconditional_terminator() {
        next.push(offset + 1);
    }
    next
}

/// Check the region's size and layout and find its blocks.
///
/// Handler targets are not followed: an exception leaves native code
/// through an error exit and the interpreter runs the handler.
///
/// # Errors
///
/// [`CompileRefusal::RegionTooLarge`] past the size limit and
/// [`CompileRefusal::NoStaticLayout`] for a reachable instruction without
/// a stack height.
pub fn plan_region(request: &CompileRequest<'_>) -> Result<RegionPlan, CompileRefusal> {
    let span = request.span();
    let size = span.end() + 1 - span.start();
    if size > request.max_region_size {
        return Err(CompileRefusal::RegionTooLarge {
            size,
            limit: request.max_region_size,
        });
    }

    let entry = request.region.entry_offset();
    let mut reachable = BTreeSet::new();
    let mut block_starts = BTreeSet::from([entry]);
    let mut queue = VecDeque::from([entry]);
    while let Some(offset) = queue.pop_front() {
        if !reachable.insert(offset) {
            continue;
        }
        if request.layout.height(offset).is_none() {
            return Err(CompileRefusal::NoStaticLayout(offset));
        }
        let opcode = &request.function.code[offset].opcode;
        let next = successors(opcode, offset);
        for &target in &next {
            if !span.contains(&target) {
                continue;
            }
            if opcode.jump_target().is_some() {
                block_starts.insert(target);
            }
            queue.push_back(target);
        }
    }
    Ok(RegionPlan {
        span,
        reachable,
        block_starts,
    })
}

/// Product of lowering, besides the IR itself
#[derive(Debug)]
pub struct Lowered {
    /// Exit points and guards
    pub exits: ExitTable,
    /// Lowering chosen per arithmetic and comparison site
    pub specializations: Vec<(usize, Specialization)>,
}

/// Build the IR of a region into `func`.
///
/// `sites` are the region's inline caches in bytecode order; their
/// addresses are embedded in the code.
///
/// # Errors
///
/// Refusals from [`plan_region`].
pub fn lower_region(
    func: &mut Function,
    builder_ctx: &mut FunctionBuilderContext,
    request: &CompileRequest<'_>,
    call_conv: CallConv,
    sites: &Sites,
) -> Result<Lowered, CompileRefusal> {
    let plan = plan_region(request)?;

    let mut signature = Signature::new(call_conv);
    signature.params.push(AbiParam::new(types::I64));
    signature.params.push(AbiParam::new(types::I64));
    signature.returns.push(AbiParam::new(types::I32));
    func.signature = signature;

    let mut builder = FunctionBuilder::new(func, builder_ctx);
    let prologue = builder.create_block();
    builder.append_block_params_for_function_params(prologue);
    builder.switch_to_block(prologue);
    let (vm, slots) = {
        let params = builder.block_params(prologue);
        (params[0], params[1])
    };

    let local_count = request.function.local_count;
    let mut lowering = Lowering {
        builder,
        request,
        plan: &plan,
        sites,
        call_conv,
        local_count: u32::from(local_count),
        vm,
        slots,
        blocks: BTreeMap::new(),
        pending_exits: Vec::new(),
        signatures: HashMap::new(),
        exits: ExitTable::new(local_count),
        specializations: Vec::new(),
    };
    lowering.translate()?;
    let Lowering {
        builder,
        exits,
        specializations,
        ..
    } = lowering;
    builder.finalize();
    Ok(Lowered {
        exits,
        specializations,
    })
}

struct Lowering<'a, 'f> {
    builder: FunctionBuilder<'f>,
    request: &'a CompileRequest<'a>,
    plan: &'a RegionPlan,
    sites: &'a Sites,
    call_conv: CallConv,
    local_count: u32,
    vm: Value,
    slots: Value,
    blocks: BTreeMap<usize, Block>,
    pending_exits: Vec<(Block, u32)>,
    signatures: HashMap<usize, SigRef>,
    exits: ExitTable,
    specializations: Vec<(usize, Specialization)>,
}

impl Lowering<'_, '_> {
    fn translate(&mut self) -> Result<(), CompileRefusal> {
        let max_stack = self.request.layout.max_stack;
        for index in 0..self.local_count + max_stack {
            self.builder
                .declare_var(Variable::from_u32(index), types::I64);
        }
        for &start in &self.plan.block_starts {
            let block = self.builder.create_block();
            self.blocks.insert(start, block);
        }

        let entry = self.request.region.entry_offset();
        let entry_height = self.height(entry)?;
        for local in 0..self.local_count {
            let value = self.load_slot(local);
            self.builder.def_var(Variable::from_u32(local), value);
        }
        for position in 0..entry_height {
            let value = self.load_slot(self.local_count + position);
            self.push_value(position, value);
        }
        self.lower_entry_guards(entry, entry_height);
        let entry_block = self.block(entry)?;
        self.builder.ins().jump(entry_block, &[]);

        let mut filled = true;
        let offsets: Vec<usize> = self.plan.reachable.iter().copied().collect();
        for offset in offsets {
            if let Some(&block) = self.blocks.get(&offset) {
                if !filled {
                    self.builder.ins().jump(block, &[]);
                }
                self.builder.switch_to_block(block);
            }
            let height = self.height(offset)?;
            filled = self.lower_instruction(offset, height)?;

            if !filled && !self.plan.span.contains(&(offset + 1)) {
                let target = offset + 1;
                let exit = self.loop_exit(target)?;
                self.builder.ins().jump(exit, &[]);
                filled = true;
            }
        }

        for (block, exit) in std::mem::take(&mut self.pending_exits) {
            self.builder.switch_to_block(block);
            let depth = self.exits.get(exit).map_or(0, |point| point.stack_depth);
            self.flush(depth);
            let status = self.builder.ins().iconst(types::I32, i64::from(exit) + 1);
            self.builder.ins().return_(&[status]);
        }
        self.builder.seal_all_blocks();
        Ok(())
    }

    // ----- frame access -----

    fn height(&self, offset: usize) -> Result<u32, CompileRefusal> {
        self.request
            .layout
            .height(offset)
            .ok_or(CompileRefusal::NoStaticLayout(offset))
    }

    fn operand(&self, position: u32) -> Variable {
        Variable::from_u32(self.local_count + position)
    }

    fn block(&self, offset: usize) -> Result<Block, CompileRefusal> {
        self.blocks
            .get(&offset)
            .copied()
            .ok_or_else(|| CompileRefusal::Backend(format!("no block starts at offset {offset}")))
    }

    fn load_slot(&mut self, slot: u32) -> Value {
        let slots = self.slots;
        self.builder
            .ins()
            .load(types::I64, MemFlags::trusted(), slots, slot as i32 * WORD)
    }

    fn store_slot(&mut self, slot: u32, value: Value) {
        let slots = self.slots;
        self.builder
            .ins()
            .store(MemFlags::trusted(), value, slots, slot as i32 * WORD);
    }

    fn store_operands(&mut self, from: u32, to: u32) {
        for position in from..to {
            let value = self.top(position);
            self.store_slot(self.local_count + position, value);
        }
    }

    /// Write every local and the bottom `depth` operands to the frame.
    fn flush(&mut self, depth: u32) {
        for local in 0..self.local_count {
            let value = self.builder.use_var(Variable::from_u32(local));
            self.store_slot(local, value);
        }
        self.store_operands(0, depth);
    }

    fn push_value(&mut self, position: u32, value: Value) {
        let var = self.operand(position);
        self.builder.def_var(var, value);
    }

    fn top(&mut self, position: u32) -> Value {
        let var = self.operand(position);
        self.builder.use_var(var)
    }

    // ----- exits -----

    fn exit_block(&mut self, exit: u32) -> Block {
        let block = self.builder.create_block();
        self.pending_exits.push((block, exit));
        block
    }

    fn loop_exit(&mut self, target: usize) -> Result<Block, CompileRefusal> {
        let depth = self.height(target)?;
        let exit = self.exits.add_exit(ExitKind::LoopExit, target, depth);
        Ok(self.exit_block(exit))
    }

    /// Block for a control transfer to `target`: its own block inside the
    /// region, a loop exit outside.
    fn edge(&mut self, target: usize) -> Result<Block, CompileRefusal> {
        if self.plan.span.contains(&target) {
            self.block(target)
        } else {
            self.loop_exit(target)
        }
    }

    /// Leave through `exit` unless `ok` holds.
    fn guard(&mut self, ok: Value, kind: GuardKind, offset: usize, depth: u32) {
        let exit = self.exits.add_guard(kind, offset, depth);
        let fail = self.exit_block(exit);
        let next = self.builder.create_block();
        self.builder.ins().brif(ok, next, &[], fail, &[]);
        self.builder.switch_to_block(next);
    }

    fn error_exit(&mut self, offset: usize, depth: u32) -> u32 {
        self.exits.add_exit(ExitKind::Error, offset, depth)
    }

    /// Leave through `exit` when a helper returned the error marker.
    fn check_error(&mut self, result: Value, exit: u32) {
        let failed = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, result, ERROR_BITS as i64);
        let fail = self.exit_block(exit);
        let next = self.builder.create_block();
        self.builder.ins().brif(failed, fail, &[], next, &[]);
        self.builder.switch_to_block(next);
    }

    // ----- helpers -----

    fn signature(&mut self, arity: usize) -> SigRef {
        if let Some(&sig) = self.signatures.get(&arity) {
            return sig;
        }
        let mut signature = Signature::new(self.call_conv);
        for _ in 0..arity {
            signature.params.push(AbiParam::new(types::I64));
        }
        signature.returns.push(AbiParam::new(types::I64));
        let sig = self.builder.import_signature(signature);
        self.signatures.insert(arity, sig);
        sig
    }

    fn call(&mut self, helper: Helper, args: &[Value]) -> Value {
        let sig = self.signature(helper.arity());
        let callee = self
            .builder
            .ins()
            .iconst(types::I64, helper.address() as i64);
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(self.vm);
        operands.extend_from_slice(args);
        let inst = self.builder.ins().call_indirect(sig, callee, &operands);
        self.builder.inst_results(inst)[0]
    }

    fn word(&mut self, value: u64) -> Value {
        self.builder.ins().iconst(types::I64, value as i64)
    }

    // ----- value representation -----

    fn is_int(&mut self, value: Value) -> Value {
        let high = self.builder.ins().ushr_imm(value, 48);
        self.builder
            .ins()
            .icmp_imm(IntCC::Equal, high, INT_TAG_HIGH)
    }

    fn is_float(&mut self, value: Value) -> Value {
        let high = self.builder.ins().ushr_imm(value, 48);
        self.builder
            .ins()
            .icmp_imm(IntCC::UnsignedLessThan, high, INT_TAG_HIGH)
    }

    fn unbox_int(&mut self, value: Value) -> Value {
        let shifted = self.builder.ins().ishl_imm(value, 16);
        self.builder.ins().sshr_imm(shifted, 16)
    }

    fn box_int(&mut self, raw: Value) -> Value {
        let payload = self.builder.ins().band_imm(raw, PAYLOAD_MASK as i64);
        self.builder.ins().bor_imm(payload, TAG_INT as i64)
    }

    /// Whether a raw integer survives the round trip through 48 bits
    fn fits_int(&mut self, raw: Value) -> Value {
        let narrowed = self.unbox_int(raw);
        self.builder.ins().icmp(IntCC::Equal, narrowed, raw)
    }

    fn unbox_float(&mut self, value: Value) -> Value {
        self.builder
            .ins()
            .bitcast(types::F64, MemFlags::new(), value)
    }

    fn box_float(&mut self, raw: Value) -> Value {
        let nan = self.builder.ins().fcmp(FloatCC::Unordered, raw, raw);
        let bits = self.builder.ins().bitcast(types::I64, MemFlags::new(), raw);
        let canonical = self.word(CANONICAL_NAN);
        self.builder.ins().select(nan, canonical, bits)
    }

    fn box_bool(&mut self, flag: Value) -> Value {
        let wide = self.builder.ins().uextend(types::I64, flag);
        self.builder.ins().bor_imm(wide, FALSE_BITS as i64)
    }

    /// Truthiness as an `i8`; booleans are tested inline.
    fn truthy(&mut self, value: Value) -> Value {
        let is_true = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, value, TRUE_BITS as i64);
        let is_false = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, value, FALSE_BITS as i64);
        let is_bool = self.builder.ins().bor(is_true, is_false);

        let slow = self.builder.create_block();
        let merge = self.builder.create_block();
        self.builder.append_block_param(merge, types::I8);
        self.builder
            .ins()
            .brif(is_bool, merge, &[is_true], slow, &[]);

        self.builder.switch_to_block(slow);
        let result = self.call(Helper::Truthy, &[value]);
        let flag = self.builder.ins().icmp_imm(IntCC::NotEqual, result, 0);
        self.builder.ins().jump(merge, &[flag]);

        self.builder.switch_to_block(merge);
        self.builder.block_params(merge)[0]
    }

    // ----- instructions -----

    fn lower_entry_guards(&mut self, entry: usize, depth: u32) {
        if !matches!(self.request.region.kind, RegionKind::Loop { .. }) {
            return;
        }
        let request = self.request;
        let tags = request.profile.region_entry_tags(request.region.kind);
        for (local, tag) in entry_guards(tags, request.speculation) {
            if u32::from(local) >= self.local_count {
                continue;
            }
            let value = self.builder.use_var(Variable::from_u32(u32::from(local)));
            let ok = match tag {
                TypeTag::Int => self.is_int(value),
                _ => self.is_float(value),
            };
            self.guard(ok, GuardKind::EntryTag { local, tag }, entry, depth);
        }
    }

    /// Lower one instruction; returns whether the current block is filled.
    fn lower_instruction(&mut self, offset: usize, h: u32) -> Result<bool, CompileRefusal> {
        let request = self.request;
        let opcode = &request.function.code[offset].opcode;
        match opcode {
            Opcode::LoadConst(index) => {
                let bits = request
                    .constants
                    .get(*index as usize)
                    .map_or(NONE_BITS, |value| value.to_bits());
                let value = self.word(bits);
                self.push_value(h, value);
            }
            Opcode::LoadNone => {
                let value = self.word(NONE_BITS);
                self.push_value(h, value);
            }
            Opcode::LoadTrue => {
                let value = self.word(TRUE_BITS);
                self.push_value(h, value);
            }
            Opcode::LoadFalse => {
                let value = self.word(FALSE_BITS);
                self.push_value(h, value);
            }
            Opcode::LoadLocal(local) => {
                let value = self.builder.use_var(Variable::from_u32(u32::from(*local)));
                self.push_value(h, value);
            }
            Opcode::StoreLocal(local) => {
                let value = self.top(h - 1);
                self.builder
                    .def_var(Variable::from_u32(u32::from(*local)), value);
            }
            Opcode::LoadGlobal(slot) => {
                let slot = self.word(u64::from(*slot));
                let value = self.call(Helper::LoadGlobal, &[slot]);
                let exit = self.error_exit(offset, h);
                self.check_error(value, exit);
                self.push_value(h, value);
            }
            Opcode::StoreGlobal(slot) => {
                let value = self.top(h - 1);
                let slot = self.word(u64::from(*slot));
                self.call(Helper::StoreGlobal, &[slot, value]);
            }
            Opcode::LoadCapture(index) => {
                let index = self.word(u64::from(*index));
                let value = self.call(Helper::LoadCapture, &[index]);
                self.push_value(h, value);
            }
            Opcode::StoreCapture(index) => {
                let value = self.top(h - 1);
                let index = self.word(u64::from(*index));
                self.call(Helper::StoreCapture, &[index, value]);
            }
            Opcode::Pop => {}
            Opcode::Dup => {
                let value = self.top(h - 1);
                self.push_value(h, value);
            }
            Opcode::Is => {
                let (a, b) = (self.top(h - 2), self.top(h - 1));
                let same = self.builder.ins().icmp(IntCC::Equal, a, b);
                let value = self.box_bool(same);
                self.push_value(h - 2, value);
            }
            Opcode::Neg => self.lower_negate(offset, h),
            Opcode::Not => {
                let value = self.top(h - 1);
                let truthy = self.truthy(value);
                let no = self.word(FALSE_BITS);
                let yes = self.word(TRUE_BITS);
                let result = self.builder.ins().select(truthy, no, yes);
                self.push_value(h - 1, result);
            }
            Opcode::Jump(target) => {
                let block = self.edge(*target as usize)?;
                self.builder.ins().jump(block, &[]);
                return Ok(true);
            }
            Opcode::JumpIfFalse(target) | Opcode::JumpIfFalseOrPop(target) => {
                let value = self.top(h - 1);
                let truthy = self.truthy(value);
                let taken = self.edge(*target as usize)?;
                let fall = self.edge(offset + 1)?;
                self.builder.ins().brif(truthy, fall, &[], taken, &[]);
                return Ok(true);
            }
            Opcode::JumpIfTrue(target) | Opcode::JumpIfTrueOrPop(target) => {
                let value = self.top(h - 1);
                let truthy = self.truthy(value);
                let taken = self.edge(*target as usize)?;
                let fall = self.edge(offset + 1)?;
                self.builder.ins().brif(truthy, taken, &[], fall, &[]);
                return Ok(true);
            }
            Opcode::BuildList(count) => {
                let count = u32::from(*count);
                self.store_operands(h - count, h);
                let top = self.word(u64::from(self.local_count + h));
                let n = self.word(u64::from(count));
                let list = self.call(Helper::BuildList, &[top, n]);
                self.push_value(h - count, list);
            }
            Opcode::BuildMap(count) => {
                let values = u32::from(*count) * 2;
                self.store_operands(h - values, h);
                let top = self.word(u64::from(self.local_count + h));
                let n = self.word(u64::from(values));
                let map = self.call(Helper::BuildMap, &[top, n]);
                let exit = self.error_exit(offset, h);
                self.check_error(map, exit);
                self.push_value(h - values, map);
            }
            Opcode::GetIndex => {
                let (container, key) = (self.top(h - 2), self.top(h - 1));
                let value = self.call(Helper::GetIndex, &[container, key]);
                let exit = self.error_exit(offset, h);
                self.check_error(value, exit);
                self.push_value(h - 2, value);
            }
            Opcode::SetIndex => {
                let container = self.top(h - 3);
                let (key, value) = (self.top(h - 2), self.top(h - 1));
                let status = self.call(Helper::SetIndex, &[container, key, value]);
                let exit = self.error_exit(offset, h);
                self.check_error(status, exit);
            }
            Opcode::GetField(_) => {
                let object = self.top(h - 1);
                let site = self.field_site(offset)?;
                let value = self.call(Helper::GetField, &[site, object]);
                let exit = self.error_exit(offset, h);
                self.check_error(value, exit);
                self.push_value(h - 1, value);
            }
            Opcode::SetField(_) => {
                let (object, value) = (self.top(h - 2), self.top(h - 1));
                let site = self.field_site(offset)?;
                let status = self.call(Helper::SetField, &[site, object, value]);
                let exit = self.error_exit(offset, h);
                self.check_error(status, exit);
            }
            Opcode::MakeClosure(_, sources) => {
                for source in sources {
                    if let CaptureSource::Local(local) = source {
                        let local = u32::from(*local);
                        let value = self.builder.use_var(Variable::from_u32(local));
                        self.store_slot(local, value);
                    }
                }
                let at = self.word(offset as u64);
                let closure = self.call(Helper::MakeClosure, &[at]);
                self.push_value(h, closure);
            }
            Opcode::Call(argc) => self.lower_call(offset, h, u32::from(*argc))?,
            Opcode::Return => {
                let value = self.top(h - 1);
                self.store_slot(0, value);
                let status = self.builder.ins().iconst(types::I32, 0);
                self.builder.ins().return_(&[status]);
                return Ok(true);
            }
            Opcode::Throw => {
                let value = self.top(h - 1);
                self.call(Helper::Throw, &[value]);
                let exit = self.error_exit(offset, h);
                let block = self.exit_block(exit);
                self.builder.ins().jump(block, &[]);
                return Ok(true);
            }
            other => match BinaryOp::from_opcode(other) {
                Some(op) => self.lower_binary(offset, h, op),
                None => {
                    return Err(CompileRefusal::Backend(format!(
                        "no lowering for {other:?} at offset {offset}"
                    )))
                }
            },
        }
        Ok(false)
    }

    fn lower_binary(&mut self, offset: usize, h: u32, op: BinaryOp) {
        let (a, b) = (self.top(h - 2), self.top(h - 1));
        let feedback = self.request.profile.site(offset);
        let specialization = specialize_binary(op, feedback, self.request.speculation);
        self.specializations.push((offset, specialization));

        let slow = self.builder.create_block();
        let merge = self.builder.create_block();
        self.builder.append_block_param(merge, types::I64);

        match specialization {
            Specialization::IntInt => {
                let ok = self.both(a, b, Self::is_int);
                self.guard(ok, GuardKind::IntOperands, offset, h);
                self.int_fast_path(op, a, b, slow, merge);
            }
            Specialization::FloatFloat => {
                let ok = self.both(a, b, Self::is_float);
                self.guard(ok, GuardKind::FloatOperands, offset, h);
                self.float_fast_path(op, a, b, slow, merge);
            }
            Specialization::Numeric => {
                let ints = self.builder.create_block();
                let other = self.builder.create_block();
                let floats = self.builder.create_block();
                let both_int = self.both(a, b, Self::is_int);
                self.builder.ins().brif(both_int, ints, &[], other, &[]);

                self.builder.switch_to_block(ints);
                self.int_fast_path(op, a, b, slow, merge);

                self.builder.switch_to_block(other);
                let both_float = self.both(a, b, Self::is_float);
                self.builder.ins().brif(both_float, floats, &[], slow, &[]);

                self.builder.switch_to_block(floats);
                self.float_fast_path(op, a, b, slow, merge);
            }
            Specialization::Generic => {
                self.builder.ins().jump(slow, &[]);
            }
        }

        self.builder.switch_to_block(slow);
        let code = self.word(u64::from(op.code()));
        let result = self.call(Helper::Binary, &[code, a, b]);
        let exit = self.error_exit(offset, h);
        self.check_error(result, exit);
        self.builder.ins().jump(merge, &[result]);

        self.builder.switch_to_block(merge);
        let result = self.builder.block_params(merge)[0];
        self.push_value(h - 2, result);
    }

    fn both(&mut self, a: Value, b: Value, test: fn(&mut Self, Value) -> Value) -> Value {
        let left = test(self, a);
        let right = test(self, b);
        self.builder.ins().band(left, right)
    }

    /// Integer lowering; fills the current block. Results that leave the
    /// 48-bit range and zero divisors take the helper.
    fn int_fast_path(&mut self, op: BinaryOp, a: Value, b: Value, slow: Block, merge: Block) {
        let x = self.unbox_int(a);
        let y = self.unbox_int(b);
        match op {
            BinaryOp::Add | BinaryOp::Sub => {
                let raw = if op == BinaryOp::Add {
                    self.builder.ins().iadd(x, y)
                } else {
                    self.builder.ins().isub(x, y)
                };
                let ok = self.fits_int(raw);
                let boxed = self.box_int(raw);
                self.builder.ins().brif(ok, merge, &[boxed], slow, &[]);
            }
            BinaryOp::Mul => {
                let raw = self.builder.ins().imul(x, y);
                let high = self.builder.ins().smulhi(x, y);
                let sign = self.builder.ins().sshr_imm(raw, 63);
                let no_wrap = self.builder.ins().icmp(IntCC::Equal, high, sign);
                let fits = self.fits_int(raw);
                let ok = self.builder.ins().band(no_wrap, fits);
                let boxed = self.box_int(raw);
                self.builder.ins().brif(ok, merge, &[boxed], slow, &[]);
            }
            BinaryOp::Div | BinaryOp::Mod => {
                let zero = self.builder.ins().icmp_imm(IntCC::Equal, y, 0);
                let compute = self.builder.create_block();
                self.builder.ins().brif(zero, slow, &[], compute, &[]);
                self.builder.switch_to_block(compute);
                let result = if op == BinaryOp::Div {
                    let fx = self.builder.ins().fcvt_from_sint(types::F64, x);
                    let fy = self.builder.ins().fcvt_from_sint(types::F64, y);
                    let quotient = self.builder.ins().fdiv(fx, fy);
                    self.box_float(quotient)
                } else {
                    let remainder = self.builder.ins().srem(x, y);
                    self.box_int(remainder)
                };
                self.builder.ins().jump(merge, &[result]);
            }
            BinaryOp::Pow | BinaryOp::Is => {
                self.builder.ins().jump(slow, &[]);
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let cc = match op {
                    BinaryOp::Eq => IntCC::Equal,
                    BinaryOp::Ne => IntCC::NotEqual,
                    BinaryOp::Lt => IntCC::SignedLessThan,
                    BinaryOp::Le => IntCC::SignedLessThanOrEqual,
                    BinaryOp::Gt => IntCC::SignedGreaterThan,
                    _ => IntCC::SignedGreaterThanOrEqual,
                };
                let flag = self.builder.ins().icmp(cc, x, y);
                let result = self.box_bool(flag);
                self.builder.ins().jump(merge, &[result]);
            }
        }
    }

    /// Float lowering; fills the current block. `%` and `^` take the helper.
    fn float_fast_path(&mut self, op: BinaryOp, a: Value, b: Value, slow: Block, merge: Block) {
        let x = self.unbox_float(a);
        let y = self.unbox_float(b);
        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
                let raw = match op {
                    BinaryOp::Add => self.builder.ins().fadd(x, y),
                    BinaryOp::Sub => self.builder.ins().fsub(x, y),
                    _ => self.builder.ins().fmul(x, y),
                };
                let result = self.box_float(raw);
                self.builder.ins().jump(merge, &[result]);
            }
            BinaryOp::Div => {
                // +0.0 and -0.0 are the only words with nothing below the sign bit
                let magnitude = self.builder.ins().ishl_imm(b, 1);
                let zero = self.builder.ins().icmp_imm(IntCC::Equal, magnitude, 0);
                let compute = self.builder.create_block();
                self.builder.ins().brif(zero, slow, &[], compute, &[]);
                self.builder.switch_to_block(compute);
                let quotient = self.builder.ins().fdiv(x, y);
                let result = self.box_float(quotient);
                self.builder.ins().jump(merge, &[result]);
            }
            BinaryOp::Mod | BinaryOp::Pow | BinaryOp::Is => {
                self.builder.ins().jump(slow, &[]);
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let cc = match op {
                    BinaryOp::Eq => FloatCC::Equal,
                    BinaryOp::Ne => FloatCC::NotEqual,
                    BinaryOp::Lt => FloatCC::LessThan,
                    BinaryOp::Le => FloatCC::LessThanOrEqual,
                    BinaryOp::Gt => FloatCC::GreaterThan,
                    _ => FloatCC::GreaterThanOrEqual,
                };
                let flag = self.builder.ins().fcmp(cc, x, y);
                let result = self.box_bool(flag);
                self.builder.ins().jump(merge, &[result]);
            }
        }
    }

    fn lower_negate(&mut self, offset: usize, h: u32) {
        let value = self.top(h - 1);
        let feedback = self.request.profile.site(offset);
        let slow = self.builder.create_block();
        let merge = self.builder.create_block();
        self.builder.append_block_param(merge, types::I64);

        match specialize_unary(feedback, self.request.speculation) {
            UnarySpecialization::Int => {
                let ok = self.is_int(value);
                self.guard(ok, GuardKind::IntOperand, offset, h);
                let x = self.unbox_int(value);
                let raw = self.builder.ins().ineg(x);
                let fits = self.fits_int(raw);
                let boxed = self.box_int(raw);
                self.builder.ins().brif(fits, merge, &[boxed], slow, &[]);
            }
            UnarySpecialization::Generic => {
                self.builder.ins().jump(slow, &[]);
            }
        }

        self.builder.switch_to_block(slow);
        let result = self.call(Helper::Negate, &[value]);
        let exit = self.error_exit(offset, h);
        self.check_error(result, exit);
        self.builder.ins().jump(merge, &[result]);

        self.builder.switch_to_block(merge);
        let result = self.builder.block_params(merge)[0];
        self.push_value(h - 1, result);
    }

    /// Address of the field cache for the access at `offset`, as an
    /// immediate.
    fn field_site(&mut self, offset: usize) -> Result<Value, CompileRefusal> {
        let sites = self.sites;
        let site = sites
            .fields
            .binary_search_by_key(&offset, FieldSite::offset)
            .ok()
            .map(|index| &sites.fields[index])
            .ok_or_else(|| CompileRefusal::Backend(format!("no field site at offset {offset}")))?;
        Ok(self.word(site as *const FieldSite as u64))
    }

    /// Calls go through the site's inline cache: a callee matching the
    /// cached key skips resolution.
    fn lower_call(&mut self, offset: usize, h: u32, argc: u32) -> Result<(), CompileRefusal> {
        let callee_position = h - argc - 1;
        self.store_operands(callee_position, h);

        let sites = self.sites;
        let site = sites
            .calls
            .binary_search_by_key(&offset, CallSite::offset)
            .ok()
            .map(|index| &sites.calls[index])
            .ok_or_else(|| CompileRefusal::Backend(format!("no call site at offset {offset}")))?;
        let site_addr = self.word(site as *const CallSite as u64);
        let exit = self.error_exit(offset, h);

        let top = self.word(u64::from(self.local_count + h));
        let n = self.word(u64::from(argc));
        let exit_arg = self.word(u64::from(exit));
        let callee = self.top(callee_position);
        let key = self.builder.ins().load(
            types::I64,
            MemFlags::trusted(),
            site_addr,
            CallSite::KEY_OFFSET,
        );
        let hit = self.builder.ins().icmp(IntCC::Equal, key, callee);

        let cached = self.builder.create_block();
        let generic = self.builder.create_block();
        let merge = self.builder.create_block();
        self.builder.append_block_param(merge, types::I64);
        self.builder.ins().brif(hit, cached, &[], generic, &[]);

        self.builder.switch_to_block(cached);
        let result = self.call(Helper::CallCached, &[site_addr, top, n, exit_arg]);
        self.builder.ins().jump(merge, &[result]);

        self.builder.switch_to_block(generic);
        let result = self.call(Helper::CallGeneric, &[site_addr, top, n, exit_arg]);
        self.builder.ins().jump(merge, &[result]);

        self.builder.switch_to_block(merge);
        let result = self.builder.block_params(merge)[0];
        self.check_error(result, exit);
        self.push_value(callee_position, result);
        Ok(())
    }
}
