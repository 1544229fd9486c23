//! Virtual Machine for bytecode execution
//!
//! Main entry point for executing Levython programs. The VM owns the
//! value stack, the call stack, globals and the heap, interprets bytecode
//! and hands hot regions to a [`JitBackend`]. Interpreted and native frames
//! share one value stack and one call stack, so exceptions unwind through
//! both the same way.

use std::cell::Cell;
use std::rc::Rc;

use bytecode_system::{
    CaptureSource, Constant, FunctionLayout, FunctionProto, Opcode, Program, ProgramError,
};
use core_types::{
    Arity, Closure, ErrorKind, FunctionId, Heap, HeapObject, NativeContext, ProfileRecord,
    RegionId, RegionKind, RuntimeError, TraceFrame, TypeTag, Value,
};
use tracing::{debug, trace};

use crate::backend::{
    CompileRefusal, CompileRequest, CompiledCode, ExitKind, JitBackend, NativeExit, UNSET_BITS,
};
use crate::builtins;
use crate::call_frame::{ActiveNative, CallFrame};
use crate::config::RuntimeConfig;
use crate::inline_cache::CallTarget;
use crate::ops::{self, BinaryOp};
use crate::tiering::{Tier, TierStats, TieringController};

/// Innermost frames kept in a traceback
const TRACE_LIMIT: usize = 64;

/// Where `say` writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Process standard output
    Stdout,
    /// Collected lines, for embedding and tests
    Captured(Vec<String>),
}

/// Virtual Machine for executing Levython bytecode
///
/// The VM manages the execution state including:
/// - Global slots, pre-bound with the builtin prelude
/// - A fixed-capacity value stack shared with native code
/// - Call stack for function invocations
/// - Profiles and the tiering controller
///
/// # Example
///
/// ```
/// use bytecode_system::{Assembler, Opcode, Program};
/// use interpreter::{RuntimeConfig, VM};
/// use core_types::Value;
///
/// let mut main = Assembler::new("<main>", 0, 0);
/// main.load_int(40);
/// main.load_int(2);
/// main.emit(Opcode::Add);
/// main.emit(Opcode::Return);
/// let program = Program::with_entry(main.finish().unwrap());
///
/// let mut vm = VM::new(program, RuntimeConfig::interpreted()).unwrap();
/// assert_eq!(vm.run().unwrap(), Value::int(42));
/// ```
pub struct VM {
    config: RuntimeConfig,
    program: Rc<Program>,
    layouts: Vec<FunctionLayout>,
    /// Constants per function, strings allocated once
    constants: Vec<Vec<Value>>,
    heap: Heap,
    globals: Vec<Value>,
    /// Never reallocated; native code addresses it directly
    stack: Box<[Cell<Value>]>,
    sp: usize,
    frames: Vec<CallFrame>,
    profiles: Vec<ProfileRecord>,
    tiering: TieringController,
    backend: Option<Box<dyn JitBackend>>,
    output: Output,
    native_depth: usize,
    native_entries: u64,
    pending_error: Option<RuntimeError>,
}

impl std::fmt::Debug for VM {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VM")
            .field("functions", &self.program.functions.len())
            .field("sp", &self.sp)
            .field("frames", &self.frames.len())
            .field("jit", &self.jit_enabled())
            .finish()
    }
}

impl VM {
    /// Create a VM for a program
    ///
    /// # Arguments
    ///
    /// * `program` - The program to execute
    /// * `config` - Thresholds and limits
    ///
    /// # Returns
    ///
    /// * `Err(ProgramError)` - If the program fails validation
    pub fn new(program: Program, config: RuntimeConfig) -> Result<Self, ProgramError> {
        let config = config.normalized();
        let layouts = program.validate()?;
        let mut heap = Heap::new();

        let mut constants = Vec::with_capacity(program.functions.len());
        for function in &program.functions {
            let prepared = function
                .constants
                .iter()
                .map(|c| match c {
                    Constant::Int(i) => Value::from_i64(*i),
                    Constant::Float(f) => Value::float(*f),
                    Constant::Str(s) => heap.string(s.as_str()),
                })
                .collect();
            constants.push(prepared);
        }

        let globals = program
            .globals
            .iter()
            .map(|name| builtins::bind(&mut heap, name).unwrap_or(Value::from_bits(UNSET_BITS)))
            .collect();
        let profiles = program
            .functions
            .iter()
            .map(|f| ProfileRecord::new(f.len()))
            .collect();
        let stack = (0..config.stack_slots)
            .map(|_| Cell::new(Value::NONE))
            .collect();

        Ok(Self {
            tiering: TieringController::new(&config),
            config,
            program: Rc::new(program),
            layouts,
            constants,
            heap,
            globals,
            stack,
            sp: 0,
            frames: Vec::with_capacity(64),
            profiles,
            backend: None,
            output: Output::Stdout,
            native_depth: 0,
            native_entries: 0,
            pending_error: None,
        })
    }

    /// Attach a native code generator
    pub fn with_backend(mut self, backend: Box<dyn JitBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Collect `say` output instead of printing it
    pub fn capture_output(&mut self) {
        self.output = Output::Captured(Vec::new());
    }

    /// Lines collected since [`capture_output`](Self::capture_output)
    pub fn output(&self) -> &[String] {
        match &self.output {
            Output::Captured(lines) => lines,
            Output::Stdout => &[],
        }
    }

    /// Whether hot regions are compiled
    pub fn jit_enabled(&self) -> bool {
        self.config.jit && self.backend.is_some()
    }

    /// Effective configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The program being executed
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Heap access
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Render a value the way `say` prints it
    pub fn display(&self, value: Value) -> String {
        self.heap.display(value)
    }

    /// Current value of a global by name
    pub fn global(&self, name: &str) -> Option<Value> {
        let slot = self.program.globals.iter().position(|g| g == name)?;
        let value = self.globals[slot];
        (value.to_bits() != UNSET_BITS).then_some(value)
    }

    /// Profile of a function
    pub fn profile(&self, function: FunctionId) -> &ProfileRecord {
        &self.profiles[function.index()]
    }

    /// Tier of a region
    pub fn tier(&self, region: RegionId) -> Tier {
        self.tiering.tier(region)
    }

    /// Guard failures of a region so far
    pub fn deopt_count(&self, region: RegionId) -> u32 {
        self.tiering.deopt_count(region)
    }

    /// Whether the back end refused a region
    pub fn is_refused(&self, region: RegionId) -> bool {
        self.tiering.is_refused(region)
    }

    /// Tier transition counts
    pub fn tier_stats(&self) -> TierStats {
        self.tiering.stats()
    }

    /// Number of times native code was entered
    pub fn native_entries(&self) -> u64 {
        self.native_entries
    }

    /// Installed code of a region
    pub fn compiled_code(&self, region: RegionId) -> Option<Rc<dyn CompiledCode>> {
        self.tiering.compiled(region)
    }

    /// Run the entry function
    ///
    /// # Returns
    ///
    /// * `Ok(Value)` - The value returned by the entry function
    /// * `Err(RuntimeError)` - An uncaught error with location and traceback
    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        self.frames.clear();
        self.sp = 0;
        self.native_depth = 0;
        let entry = self.program.entry;
        let main = self.heap.alloc_value(HeapObject::Closure(Closure {
            function: entry,
            captures: Vec::new(),
        }));
        let result = self.call(main, &[]);
        self.reclaim_code();
        debug!(
            native_entries = self.native_entries,
            compilations = self.tiering.stats().compilations,
            deopts = self.tiering.stats().deopts,
            "run finished"
        );
        result
    }

    /// Call a function value from the host
    ///
    /// # Arguments
    ///
    /// * `callee` - Closure or builtin
    /// * `args` - Arguments
    pub fn call(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let stop = self.frames.len();
        let callee_slot = self.sp;
        if callee_slot + args.len() + 1 > self.stack.len() {
            return Err(stack_exhausted());
        }
        self.push(callee);
        for arg in args {
            self.push(*arg);
        }
        let result = self
            .resolve_call_target(callee, args.len())
            .and_then(|target| self.complete_call(target, callee_slot, args.len(), stop));
        if result.is_err() {
            self.sp = callee_slot;
        }
        result
    }

    /// Replace a compiled region's code with a freshly compiled equivalent.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - New code installed
    /// * `Ok(false)` - The region is not compiled, nothing to do
    pub fn recompile(&mut self, region: RegionId) -> Result<bool, CompileRefusal> {
        if self.tiering.tier(region) != Tier::Compiled {
            return Ok(false);
        }
        let entry = self.compile(region)?;
        self.tiering.install(region, entry);
        Ok(true)
    }

    // ----- value stack -----

    #[inline]
    fn slot(&self, index: usize) -> Value {
        self.stack[index].get()
    }

    #[inline]
    fn set_slot(&self, index: usize, value: Value) {
        self.stack[index].set(value);
    }

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack[self.sp].set(value);
        self.sp += 1;
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.sp -= 1;
        self.stack[self.sp].get()
    }

    #[inline]
    fn peek(&self) -> Value {
        self.stack[self.sp - 1].get()
    }

    fn top_frame(&self) -> &CallFrame {
        match self.frames.last() {
            Some(frame) => frame,
            None => panic!("no active frame"),
        }
    }

    fn top_frame_mut(&mut self) -> &mut CallFrame {
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => panic!("no active frame"),
        }
    }

    // ----- interpreter loop -----

    /// Interpret until the call stack is back to `stop_depth` frames.
    fn run_frames(&mut self, stop_depth: usize) -> Result<(), RuntimeError> {
        let program = Rc::clone(&self.program);
        while self.frames.len() > stop_depth {
            if let Err(err) = self.step(&program) {
                self.raise(err, stop_depth)?;
            }
        }
        Ok(())
    }

    fn step(&mut self, program: &Program) -> Result<(), RuntimeError> {
        let frame = self.top_frame_mut();
        let fid = frame.function;
        let offset = frame.ip;
        let base = frame.base;
        frame.ip += 1;

        let index = fid.index();
        let function = &program.functions[index];
        let opcode = &function.code[offset].opcode;

        match opcode {
            Opcode::LoadConst(i) => {
                let value = self.constants[index][*i as usize];
                self.push(value);
            }
            Opcode::LoadNone => self.push(Value::NONE),
            Opcode::LoadTrue => self.push(Value::TRUE),
            Opcode::LoadFalse => self.push(Value::FALSE),
            Opcode::LoadLocal(i) => {
                let value = self.slot(base + *i as usize);
                self.push(value);
            }
            Opcode::StoreLocal(i) => {
                let value = self.pop();
                self.set_slot(base + *i as usize, value);
            }
            Opcode::LoadGlobal(i) => {
                let value = self.load_global(*i)?;
                self.push(value);
            }
            Opcode::StoreGlobal(i) => {
                let value = self.pop();
                self.store_global(*i, value);
            }
            Opcode::LoadCapture(i) => {
                let value = self.load_capture(*i);
                self.push(value);
            }
            Opcode::StoreCapture(i) => {
                let value = self.pop();
                self.store_capture(*i, value);
            }
            Opcode::Pop => {
                self.pop();
            }
            Opcode::Dup => {
                let value = self.peek();
                self.push(value);
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Is => {
                let b = self.pop();
                let a = self.pop();
                if opcode.is_profiled_site() {
                    self.record_binary(index, offset, a, b);
                }
                let op = match BinaryOp::from_opcode(opcode) {
                    Some(op) => op,
                    None => unreachable!("binary opcode without operator"),
                };
                let result = ops::binary(&mut self.heap, op, a, b)?;
                self.push(result);
            }
            Opcode::Neg => {
                let value = self.pop();
                let tag = TypeTag::of(value, &self.heap);
                self.profiles[index].record_unary(offset, tag);
                let result = ops::negate(&self.heap, value)?;
                self.push(result);
            }
            Opcode::Not => {
                let value = self.pop();
                self.push(ops::not(&self.heap, value));
            }
            Opcode::Jump(target) => self.jump(index, offset, *target)?,
            Opcode::JumpIfFalse(target) => {
                let value = self.pop();
                if !self.heap.is_truthy(value) {
                    self.jump(index, offset, *target)?;
                }
            }
            Opcode::JumpIfTrue(target) => {
                let value = self.pop();
                if self.heap.is_truthy(value) {
                    self.jump(index, offset, *target)?;
                }
            }
            Opcode::JumpIfFalseOrPop(target) => {
                if self.heap.is_truthy(self.peek()) {
                    self.pop();
                } else {
                    self.jump(index, offset, *target)?;
                }
            }
            Opcode::JumpIfTrueOrPop(target) => {
                if self.heap.is_truthy(self.peek()) {
                    self.jump(index, offset, *target)?;
                } else {
                    self.pop();
                }
            }
            Opcode::BuildList(n) => {
                let start = self.sp - *n as usize;
                let items = (start..self.sp).map(|i| self.slot(i)).collect();
                self.sp = start;
                let list = self.heap.list(items);
                self.push(list);
            }
            Opcode::BuildMap(n) => {
                let start = self.sp - 2 * *n as usize;
                let pairs: Vec<Value> = (start..self.sp).map(|i| self.slot(i)).collect();
                self.sp = start;
                let map = ops::build_map(&mut self.heap, &pairs)?;
                self.push(map);
            }
            Opcode::GetIndex => {
                let key = self.pop();
                let container = self.pop();
                self.record_binary(index, offset, container, key);
                let value = ops::get_index(&mut self.heap, container, key)?;
                self.push(value);
            }
            Opcode::SetIndex => {
                let value = self.pop();
                let key = self.pop();
                let container = self.pop();
                self.record_binary(index, offset, container, key);
                ops::set_index(&mut self.heap, container, key, value)?;
            }
            Opcode::GetField(name) => {
                let object = self.pop();
                let value = ops::get_field(&self.heap, object, field_name(function, *name))?;
                self.push(value);
            }
            Opcode::SetField(name) => {
                let value = self.pop();
                let object = self.pop();
                ops::set_field(&mut self.heap, object, field_name(function, *name), value)?;
            }
            Opcode::MakeClosure(target, sources) => {
                let closure = self.make_closure(*target, sources);
                self.push(closure);
            }
            Opcode::Call(argc) => {
                let argc = *argc as usize;
                let callee_slot = self.sp - argc - 1;
                let target = self.resolve_call_target(self.slot(callee_slot), argc)?;
                self.call_target(target, callee_slot, argc)?;
            }
            Opcode::Return => {
                let value = self.pop();
                self.return_from_frame(value);
            }
            Opcode::Throw => {
                let value = self.pop();
                return Err(self.throw_value(value));
            }
        }
        Ok(())
    }

    fn jump(&mut self, function: usize, from: usize, target: u32) -> Result<(), RuntimeError> {
        self.top_frame_mut().ip = target as usize;
        if !self.layouts[function].is_back_edge(from, target as usize) {
            return Ok(());
        }
        let count = self.profiles[function].record_iteration(target);
        let kind = RegionKind::Loop { header: target };
        self.record_region_entry(function, kind);
        let region = RegionId::loop_at(FunctionId(function as u32), target);
        if let Some(entry) = self.dispatch_target(region, count) {
            self.run_native(entry)?;
        }
        Ok(())
    }

    fn record_binary(&mut self, function: usize, offset: usize, a: Value, b: Value) {
        let lhs = TypeTag::of(a, &self.heap);
        let rhs = TypeTag::of(b, &self.heap);
        self.profiles[function].record_binary(offset, lhs, rhs);
    }

    fn record_region_entry(&mut self, function: usize, kind: RegionKind) {
        let base = self.top_frame().base;
        let locals = self.program.functions[function].local_count as usize;
        let heap = &self.heap;
        let stack = &self.stack;
        let tags = (base..base + locals).map(|i| TypeTag::of(stack[i].get(), heap));
        self.profiles[function].record_entry_tags(kind, tags);
    }

    // ----- calls -----

    /// Check that a value can be called with `argc` arguments.
    pub fn resolve_call_target(&self, callee: Value, argc: usize) -> Result<CallTarget, RuntimeError> {
        match self.heap.object(callee) {
            Some(HeapObject::Closure(closure)) => {
                let function = &self.program.functions[closure.function.index()];
                builtins::check_arity(&function.name, Arity::Exact(function.arity as usize), argc)?;
                Ok(CallTarget::Closure(closure.function))
            }
            Some(HeapObject::NativeFunction(native)) => {
                builtins::check_arity(native.name, native.arity, argc)?;
                Ok(CallTarget::Native)
            }
            _ => Err(RuntimeError::type_error(format!(
                "Cannot call type: {}",
                self.heap.type_name(callee)
            ))),
        }
    }

    /// Start a resolved call. A builtin's result is pushed immediately; a
    /// closure gets a new frame, which runs natively if its code is hot.
    fn call_target(&mut self, target: CallTarget, callee_slot: usize, argc: usize) -> Result<(), RuntimeError> {
        match target {
            CallTarget::Native => self.call_native(callee_slot, argc),
            CallTarget::Closure(function) => {
                self.push_frame(function, callee_slot, argc)?;
                self.enter_function(function)
            }
        }
    }

    /// Run a call to completion, unwinding to `stop` frames on error.
    fn complete_call(
        &mut self,
        target: CallTarget,
        callee_slot: usize,
        argc: usize,
        stop: usize,
    ) -> Result<Value, RuntimeError> {
        if let Err(err) = self.call_target(target, callee_slot, argc) {
            if self.frames.len() == stop {
                return Err(err);
            }
            self.raise(err, stop)?;
        }
        if self.frames.len() > stop {
            self.run_frames(stop)?;
        }
        Ok(self.pop())
    }

    fn call_native(&mut self, callee_slot: usize, argc: usize) -> Result<(), RuntimeError> {
        let callee = self.slot(callee_slot);
        let func = match self.heap.object(callee) {
            Some(HeapObject::NativeFunction(native)) => native.func,
            _ => {
                return Err(RuntimeError::type_error(format!(
                    "Cannot call type: {}",
                    self.heap.type_name(callee)
                )))
            }
        };
        let args: Vec<Value> = (callee_slot + 1..=callee_slot + argc)
            .map(|i| self.slot(i))
            .collect();
        let result = func(self, &args)?;
        self.sp = callee_slot;
        self.push(result);
        Ok(())
    }

    fn push_frame(&mut self, function: FunctionId, callee_slot: usize, argc: usize) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(RuntimeError::new(
                ErrorKind::RecursionError,
                "Maximum recursion depth exceeded",
            ));
        }
        let local_count = self.program.functions[function.index()].local_count as usize;
        let max_stack = self.layouts[function.index()].max_stack as usize;
        let base = callee_slot + 1;
        if base + local_count + max_stack > self.stack.len() {
            return Err(stack_exhausted());
        }
        for slot in base + argc..base + local_count {
            self.set_slot(slot, Value::NONE);
        }
        self.sp = base + local_count;
        let closure = self.slot(callee_slot).as_handle();
        self.frames.push(CallFrame::new(function, closure, base));
        Ok(())
    }

    fn enter_function(&mut self, function: FunctionId) -> Result<(), RuntimeError> {
        let index = function.index();
        let count = self.profiles[index].record_invocation();
        self.record_region_entry(index, RegionKind::Function);
        if let Some(entry) = self.dispatch_target(RegionId::function(function), count) {
            self.run_native(entry)?;
        }
        Ok(())
    }

    fn return_from_frame(&mut self, value: Value) {
        if let Some(frame) = self.frames.pop() {
            self.sp = frame.base - 1;
            self.push(value);
        }
    }

    // ----- tiering and native dispatch -----

    /// Consult the region state; compiles when the region just got hot.
    fn dispatch_target(&mut self, region: RegionId, count: u64) -> Option<Rc<dyn CompiledCode>> {
        if !self.jit_enabled() {
            return None;
        }
        if self.tiering.observe(region, count) {
            match self.compile(region) {
                Ok(entry) => self.tiering.install(region, entry),
                Err(refusal) => self.tiering.refuse(region, &refusal),
            }
        }
        if self.native_depth >= self.config.max_native_depth {
            return None;
        }
        self.tiering.compiled(region)
    }

    fn compile(&mut self, region: RegionId) -> Result<Rc<dyn CompiledCode>, CompileRefusal> {
        let index = region.function.index();
        let speculation = self.tiering.speculation(region);
        let Some(backend) = self.backend.as_mut() else {
            return Err(CompileRefusal::Backend("no back end attached".to_string()));
        };
        let request = CompileRequest {
            region,
            function: &self.program.functions[index],
            layout: &self.layouts[index],
            profile: &self.profiles[index],
            constants: &self.constants[index],
            speculation,
            max_region_size: self.config.max_region_size,
            ic_polymorphic_limit: self.config.ic_polymorphic_limit,
        };
        backend.compile(&request)
    }

    /// Run the top frame natively and translate how the code left.
    fn run_native(&mut self, entry: Rc<dyn CompiledCode>) -> Result<(), RuntimeError> {
        let result = self.invoke_native(&entry);
        let retired = !self.tiering.is_installed(&entry);
        drop(entry);
        if retired {
            self.reclaim_code();
        }
        result
    }

    fn reclaim_code(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            let released = backend.reclaim();
            if released > 0 {
                trace!(released, "released retired native code");
            }
        }
    }

    fn invoke_native(&mut self, entry: &Rc<dyn CompiledCode>) -> Result<(), RuntimeError> {
        let index = self.frames.len() - 1;
        let base = self.frames[index].base;
        self.frames[index].native = Some(ActiveNative {
            entry: Rc::clone(entry),
            exit_hint: None,
        });
        self.native_depth += 1;
        self.native_entries += 1;
        trace!(region = %entry.region(), depth = self.native_depth, "entering native code");
        let exit = entry.invoke(self, base);
        self.native_depth -= 1;

        let id = match exit {
            NativeExit::Return(value) => {
                self.frames[index].native = None;
                self.return_from_frame(value);
                return Ok(());
            }
            NativeExit::Exit(id) => id,
        };
        let Some(point) = entry.exit_point(id) else {
            panic!("native code for {} left through unknown exit {id}", entry.region());
        };
        let local_count = self.program.functions[self.frames[index].function.index()].local_count;
        self.sp = base + local_count as usize + point.stack_depth as usize;

        match point.kind {
            ExitKind::Guard => {
                let frame = &mut self.frames[index];
                frame.native = None;
                frame.ip = point.offset;
                trace!(region = %entry.region(), offset = point.offset, "guard failed");
                self.deoptimize(entry);
                Ok(())
            }
            ExitKind::LoopExit => {
                let frame = &mut self.frames[index];
                frame.native = None;
                frame.ip = point.offset;
                Ok(())
            }
            ExitKind::Error => {
                if let Some(active) = self.frames[index].native.as_mut() {
                    active.exit_hint = Some(id);
                }
                let Some(mut err) = self.pending_error.take() else {
                    panic!("native code for {} took error exit {id} without an error", entry.region());
                };
                self.locate(&mut err);
                let frame = &mut self.frames[index];
                frame.native = None;
                frame.ip = point.offset + 1;
                Err(err)
            }
        }
    }

    fn deoptimize(&mut self, failing: &Rc<dyn CompiledCode>) {
        let region = failing.region();
        if self.tiering.deoptimize(region, failing).is_none() {
            return;
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.retire(region);
        }
        self.profiles[region.function.index()].reset(region.kind);
    }

    // ----- exceptions -----

    /// Unwind to the innermost handler at or above `stop_depth` frames.
    ///
    /// Returns the error when no such handler exists; the frames above
    /// `stop_depth` are gone by then.
    fn raise(&mut self, mut err: RuntimeError, stop_depth: usize) -> Result<(), RuntimeError> {
        self.locate(&mut err);
        while self.frames.len() > stop_depth {
            let frame = self.top_frame();
            let offset = frame.current_offset();
            let base = frame.base;
            let function = &self.program.functions[frame.function.index()];
            if let Some(handler) = function.handler_for(offset) {
                let depth = base + function.local_count as usize + handler.stack_depth as usize;
                let target = handler.target as usize;
                trace!(function = %function.name, offset, target, "exception caught");
                let caught = self.caught_value(&err);
                self.sp = depth;
                self.push(caught);
                self.top_frame_mut().ip = target;
                return Ok(());
            }
            if let Some(frame) = self.frames.pop() {
                self.sp = frame.base - 1;
            }
        }
        Err(err)
    }

    fn locate(&self, err: &mut RuntimeError) {
        if err.is_located() {
            return;
        }
        let Some(top) = self.frames.last() else {
            return;
        };
        err.offset = Some(top.current_offset());
        err.trace = self
            .frames
            .iter()
            .rev()
            .take(TRACE_LIMIT)
            .map(|frame| TraceFrame {
                function: self.program.functions[frame.function.index()].name.clone(),
                offset: frame.current_offset(),
                compiled: frame.is_native(),
            })
            .collect();
    }

    /// Value a handler receives: the thrown value, or a map describing a
    /// runtime error.
    fn caught_value(&mut self, err: &RuntimeError) -> Value {
        if let Some(payload) = err.payload {
            return payload;
        }
        let kind = self.heap.string(err.kind.name());
        let message = self.heap.string(err.message.as_str());
        self.heap
            .map([("kind".to_string(), kind), ("message".to_string(), message)])
    }

    // ----- operations shared with native code helpers -----

    /// Stack slot `base` as a raw word pointer for native code
    pub fn slots_ptr(&self, base: usize) -> *mut u64 {
        assert!(base < self.stack.len(), "frame base {base} outside the value stack");
        self.stack.as_ptr().wrapping_add(base).cast::<u64>().cast_mut()
    }

    /// Park an error raised inside a helper until the native code exits
    pub fn set_pending_error(&mut self, err: RuntimeError) {
        self.pending_error = Some(err);
    }

    /// Apply a binary operator
    pub fn binary_op(&mut self, op: BinaryOp, a: Value, b: Value) -> Result<Value, RuntimeError> {
        ops::binary(&mut self.heap, op, a, b)
    }

    /// Unary minus
    pub fn negate(&self, value: Value) -> Result<Value, RuntimeError> {
        ops::negate(&self.heap, value)
    }

    /// Truthiness
    pub fn is_truthy(&self, value: Value) -> bool {
        self.heap.is_truthy(value)
    }

    /// `container[key]`
    pub fn get_index(&mut self, container: Value, key: Value) -> Result<Value, RuntimeError> {
        ops::get_index(&mut self.heap, container, key)
    }

    /// `container[key] = value`
    pub fn set_index(&mut self, container: Value, key: Value, value: Value) -> Result<(), RuntimeError> {
        ops::set_index(&mut self.heap, container, key, value)
    }

    /// `object.name` with the name taken from the running function's constants
    pub fn get_field(&self, object: Value, name: u32) -> Result<Value, RuntimeError> {
        let function = &self.program.functions[self.top_frame().function.index()];
        ops::get_field(&self.heap, object, field_name(function, name))
    }

    /// Overwrite slot `slot` of a map; false if the map has no such slot.
    pub fn set_field_slot(&mut self, object: Value, slot: u32, value: Value) -> bool {
        self.heap.set_map_slot(object, slot, value)
    }

    /// `object.name = value`
    pub fn set_field(&mut self, object: Value, name: u32, value: Value) -> Result<(), RuntimeError> {
        let program = Rc::clone(&self.program);
        let function = &program.functions[self.top_frame().function.index()];
        ops::set_field(&mut self.heap, object, field_name(function, name), value)
    }

    /// Read a global slot
    pub fn load_global(&self, slot: u32) -> Result<Value, RuntimeError> {
        let value = self.globals[slot as usize];
        if value.to_bits() == UNSET_BITS {
            return Err(RuntimeError::new(
                ErrorKind::NameError,
                format!("Undefined variable: {}", self.program.globals[slot as usize]),
            ));
        }
        Ok(value)
    }

    /// Write a global slot
    pub fn store_global(&mut self, slot: u32, value: Value) {
        self.globals[slot as usize] = value;
    }

    /// Read a capture of the running closure
    pub fn load_capture(&self, index: u16) -> Value {
        let closure = self.top_frame().closure;
        match closure.map(|h| self.heap.get(h)) {
            Some(HeapObject::Closure(c)) => c.captures.get(index as usize).copied().unwrap_or(Value::NONE),
            _ => Value::NONE,
        }
    }

    /// Write a capture of the running closure
    pub fn store_capture(&mut self, index: u16, value: Value) {
        let Some(handle) = self.top_frame().closure else {
            return;
        };
        if let HeapObject::Closure(c) = self.heap.get_mut(handle) {
            if let Some(slot) = c.captures.get_mut(index as usize) {
                *slot = value;
            }
        }
    }

    fn make_closure(&mut self, function: FunctionId, sources: &[CaptureSource]) -> Value {
        let base = self.top_frame().base;
        let captures = sources
            .iter()
            .map(|source| match *source {
                CaptureSource::Local(i) => self.slot(base + i as usize),
                CaptureSource::Capture(i) => self.load_capture(i),
            })
            .collect();
        self.heap
            .alloc_value(HeapObject::Closure(Closure { function, captures }))
    }

    /// Execute the `MakeClosure` at `offset` of the running function,
    /// reading captured locals from the frame's slots
    pub fn make_closure_at(&mut self, offset: usize) -> Value {
        let program = Rc::clone(&self.program);
        let function = &program.functions[self.top_frame().function.index()];
        match &function.code[offset].opcode {
            Opcode::MakeClosure(target, sources) => self.make_closure(*target, sources),
            other => panic!("{}@{offset} is {other:?}, not a closure", function.name),
        }
    }

    /// Build a list from the `count` operands below frame slot `top`
    pub fn build_list_at(&mut self, top: usize, count: usize) -> Value {
        let end = self.top_frame().base + top;
        let items = (end - count..end).map(|i| self.slot(i)).collect();
        self.heap.list(items)
    }

    /// Build a map from the `2 * count` operands below frame slot `top`
    pub fn build_map_at(&mut self, top: usize, count: usize) -> Result<Value, RuntimeError> {
        let end = self.top_frame().base + top;
        let pairs: Vec<Value> = (end - 2 * count..end).map(|i| self.slot(i)).collect();
        ops::build_map(&mut self.heap, &pairs)
    }

    /// Error raised by `throw value`
    pub fn throw_value(&self, value: Value) -> RuntimeError {
        RuntimeError::thrown(value, self.heap.display(value))
    }

    /// Callee of a call whose arguments end below frame slot `top`
    pub fn callee_at(&self, top: usize, argc: usize) -> Value {
        self.slot(self.top_frame().base + top - argc - 1)
    }

    /// Perform a call on behalf of native code.
    ///
    /// The callee and arguments occupy the frame slots just below `top`;
    /// `exit` is the call's exit point, reported in tracebacks while the
    /// callee runs.
    pub fn call_from_native(
        &mut self,
        target: CallTarget,
        top: usize,
        argc: usize,
        exit: u32,
    ) -> Result<Value, RuntimeError> {
        let frame = self.top_frame_mut();
        if let Some(active) = frame.native.as_mut() {
            active.exit_hint = Some(exit);
        }
        let callee_slot = frame.base + top - argc - 1;
        let stop = self.frames.len();
        self.sp = callee_slot + argc + 1;
        self.complete_call(target, callee_slot, argc, stop)
    }
}

fn field_name(function: &FunctionProto, index: u32) -> &str {
    match &function.constants[index as usize] {
        Constant::Str(name) => name,
        other => panic!("{}: field name constant is {other:?}", function.name),
    }
}

fn stack_exhausted() -> RuntimeError {
    RuntimeError::new(
        ErrorKind::RecursionError,
        "Maximum recursion depth exceeded (value stack exhausted)",
    )
}

impl NativeContext for VM {
    fn heap(&self) -> &Heap {
        &self.heap
    }

    fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    fn write_line(&mut self, line: &str) {
        match &mut self.output {
            Output::Stdout => println!("{line}"),
            Output::Captured(lines) => lines.push(line.to_string()),
        }
    }
}
