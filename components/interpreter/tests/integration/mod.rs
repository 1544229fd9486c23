//! Integration tests for interpreter
//!
//! Drives the VM's tiering through a scripted back end, so promotion,
//! deoptimization and native exits are checked without machine code.

use std::cell::RefCell;
use std::rc::Rc;

use bytecode_system::{Assembler, FunctionProto, Opcode, Program};
use core_types::{ErrorKind, FunctionId, RegionId, RuntimeError, Value};
use interpreter::{
    CompileRefusal, CompileRequest, CompiledCode, ExitKind, ExitPoint, JitBackend, NativeExit,
    RuntimeConfig, SpeculationLevel, Tier, VM,
};
use pretty_assertions::assert_eq;

#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Return a value
    Return(Value),
    /// Fail the guard at function entry
    Guard,
    /// Raise a type error at offset 0
    Fail,
}

#[derive(Debug)]
struct ScriptedCode {
    region: RegionId,
    speculation: SpeculationLevel,
    behavior: Behavior,
    exits: Vec<ExitPoint>,
}

impl CompiledCode for ScriptedCode {
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
        16
    }

    fn invoke(&self, vm: &mut VM, _base: usize) -> NativeExit {
        match self.behavior {
            Behavior::Return(value) => NativeExit::Return(value),
            Behavior::Guard => NativeExit::Exit(0),
            Behavior::Fail => {
                vm.set_pending_error(RuntimeError::type_error("native failure"));
                NativeExit::Exit(0)
            }
        }
    }
}

type Plan = fn(&CompileRequest<'_>) -> Result<Behavior, CompileRefusal>;

#[derive(Default)]
struct Log {
    compiled: Vec<(RegionId, SpeculationLevel)>,
    retired: Vec<RegionId>,
    released: usize,
}

struct ScriptedBackend {
    plan: Plan,
    log: Rc<RefCell<Log>>,
    live: Vec<Rc<dyn CompiledCode>>,
    pending: Vec<Rc<dyn CompiledCode>>,
}

impl JitBackend for ScriptedBackend {
    fn compile(
        &mut self,
        request: &CompileRequest<'_>,
    ) -> Result<Rc<dyn CompiledCode>, CompileRefusal> {
        let behavior = (self.plan)(request)?;
        self.log
            .borrow_mut()
            .compiled
            .push((request.region, request.speculation));
        let kind = match behavior {
            Behavior::Fail => ExitKind::Error,
            _ => ExitKind::Guard,
        };
        let code: Rc<dyn CompiledCode> = Rc::new(ScriptedCode {
            region: request.region,
            speculation: request.speculation,
            behavior,
            exits: vec![ExitPoint {
                kind,
                offset: 0,
                stack_depth: 0,
                written: Vec::new(),
            }],
        });
        self.retire_quietly(request.region);
        self.live.push(Rc::clone(&code));
        Ok(code)
    }

    fn retire(&mut self, region: RegionId) {
        self.log.borrow_mut().retired.push(region);
        self.retire_quietly(region);
    }

    fn reclaim(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|code| Rc::strong_count(code) > 1);
        let released = before - self.pending.len();
        self.log.borrow_mut().released += released;
        released
    }
}

impl ScriptedBackend {
    fn retire_quietly(&mut self, region: RegionId) {
        let (retired, live): (Vec<_>, Vec<_>) =
            self.live.drain(..).partition(|code| code.region() == region);
        self.live = live;
        self.pending.extend(retired);
    }
}

fn jit_vm(program: Program, config: RuntimeConfig, plan: Plan) -> (VM, Rc<RefCell<Log>>) {
    let log = Rc::new(RefCell::new(Log::default()));
    let backend = ScriptedBackend {
        plan,
        log: Rc::clone(&log),
        live: Vec::new(),
        pending: Vec::new(),
    };
    let vm = VM::new(program, config)
        .unwrap()
        .with_backend(Box::new(backend));
    (vm, log)
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        call_threshold: 2,
        loop_threshold: 100_000,
        max_deopts: 2,
        ..RuntimeConfig::default()
    }
}

/// `seven() { return 7 }`, called `n` times from a loop in main and summed.
fn seven_loop(n: i64) -> Program {
    let mut program = Program::with_entry(FunctionProto::new("<main>", 0, 0));
    let slot = program.global("seven");
    let mut seven = Assembler::new("seven", 0, 0);
    seven.load_int(7);
    seven.emit(Opcode::Return);
    let seven = program.add_function(seven.finish().unwrap());

    let mut main = Assembler::new("<main>", 0, 2);
    main.emit(Opcode::MakeClosure(seven, vec![]));
    main.emit(Opcode::StoreGlobal(slot));
    main.load_int(0);
    main.emit(Opcode::StoreLocal(0));
    main.load_int(0);
    main.emit(Opcode::StoreLocal(1));
    let header = main.here();
    let done = main.label();
    main.emit(Opcode::LoadLocal(1));
    main.load_int(n);
    main.emit(Opcode::Lt);
    main.jump_if_false(done);
    main.emit(Opcode::LoadLocal(0));
    main.emit(Opcode::LoadGlobal(slot));
    main.emit(Opcode::Call(0));
    main.emit(Opcode::Add);
    main.emit(Opcode::StoreLocal(0));
    main.emit(Opcode::LoadLocal(1));
    main.load_int(1);
    main.emit(Opcode::Add);
    main.emit(Opcode::StoreLocal(1));
    main.jump(header);
    main.bind(done);
    main.emit(Opcode::LoadLocal(0));
    main.emit(Opcode::Return);
    program.functions[0] = main.finish().unwrap();
    program
}

fn seven_region() -> RegionId {
    RegionId::function(FunctionId(1))
}

#[test]
fn test_promotion_after_call_threshold() {
    let (mut vm, log) = jit_vm(seven_loop(10), config(), |_| {
        Ok(Behavior::Return(Value::int(7)))
    });
    assert_eq!(vm.run().unwrap(), Value::int(70));
    assert_eq!(vm.tier(seven_region()), Tier::Compiled);
    // Calls 1 and 2 are interpreted, 3 compiles and every call from then on
    // runs natively
    assert_eq!(vm.native_entries(), 8);
    assert_eq!(
        log.borrow().compiled,
        vec![(seven_region(), SpeculationLevel::Speculative)]
    );
}

#[test]
fn test_guard_failures_are_bounded() {
    let (mut vm, log) = jit_vm(seven_loop(20), config(), |request| {
        Ok(match request.speculation {
            SpeculationLevel::Speculative => Behavior::Guard,
            SpeculationLevel::Generic => Behavior::Return(Value::int(7)),
        })
    });
    assert_eq!(vm.run().unwrap(), Value::int(140));
    assert_eq!(vm.deopt_count(seven_region()), 2);
    assert_eq!(vm.tier(seven_region()), Tier::Compiled);

    let log = log.borrow();
    let levels: Vec<_> = log.compiled.iter().map(|(_, level)| *level).collect();
    assert_eq!(
        levels,
        vec![
            SpeculationLevel::Speculative,
            SpeculationLevel::Speculative,
            SpeculationLevel::Generic,
        ]
    );
    assert_eq!(log.retired, vec![seven_region(), seven_region()]);
    let stats = vm.tier_stats();
    assert_eq!((stats.compilations, stats.deopts), (3, 2));
}

#[test]
fn test_retired_code_is_released_after_its_native_exit() {
    let (mut vm, log) = jit_vm(seven_loop(1), config(), |request| {
        Ok(match request.speculation {
            SpeculationLevel::Speculative => Behavior::Guard,
            SpeculationLevel::Generic => Behavior::Return(Value::int(7)),
        })
    });
    assert_eq!(vm.run().unwrap(), Value::int(7));
    let seven = vm.global("seven").unwrap();
    assert_eq!(vm.call(seven, &[]).unwrap(), Value::int(7));
    assert_eq!(log.borrow().released, 0);

    // Compiles, fails its guard and resumes in the interpreter
    assert_eq!(vm.call(seven, &[]).unwrap(), Value::int(7));
    assert_eq!(vm.tier(seven_region()), Tier::Deoptimized);
    assert_eq!(log.borrow().retired, vec![seven_region()]);
    assert_eq!(log.borrow().released, 1);
}

#[test]
fn test_run_releases_replaced_code() {
    let (mut vm, log) = jit_vm(seven_loop(5), config(), |_| {
        Ok(Behavior::Return(Value::int(7)))
    });
    vm.run().unwrap();
    assert!(vm.recompile(seven_region()).unwrap());
    assert_eq!(log.borrow().released, 0);

    assert_eq!(vm.run().unwrap(), Value::int(35));
    assert_eq!(log.borrow().released, 1);
}

#[test]
fn test_refused_region_stays_interpreted() {
    let (mut vm, log) = jit_vm(seven_loop(10), config(), |request| {
        Err(CompileRefusal::RegionTooLarge {
            size: request.function.len(),
            limit: 0,
        })
    });
    assert_eq!(vm.run().unwrap(), Value::int(70));
    assert!(vm.is_refused(seven_region()));
    assert_eq!(vm.tier(seven_region()), Tier::Profiling);
    assert_eq!(vm.native_entries(), 0);
    assert_eq!(vm.tier_stats().refusals, 1);
    assert!(log.borrow().compiled.is_empty());
}

#[test]
fn test_jit_disabled_never_compiles() {
    let config = RuntimeConfig {
        jit: false,
        ..config()
    };
    let (mut vm, log) = jit_vm(seven_loop(10), config, |_| Ok(Behavior::Guard));
    assert_eq!(vm.run().unwrap(), Value::int(70));
    assert!(!vm.jit_enabled());
    assert!(log.borrow().compiled.is_empty());
}

#[test]
fn test_native_error_is_located_in_compiled_frame() {
    let (mut vm, _log) = jit_vm(seven_loop(1), config(), |_| Ok(Behavior::Fail));
    assert_eq!(vm.run().unwrap(), Value::int(7));
    let seven = vm.global("seven").unwrap();
    // One interpreted call so far; the next one crosses the threshold
    assert_eq!(vm.call(seven, &[]).unwrap(), Value::int(7));
    let err = vm.call(seven, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeError);
    assert_eq!(err.message, "native failure");
    assert_eq!(err.offset, Some(0));
    assert_eq!(err.trace.len(), 1);
    assert_eq!(err.trace[0].function, "seven");
    assert!(err.trace[0].compiled);
    // Errors are not speculation failures
    assert_eq!(vm.tier(seven_region()), Tier::Compiled);
    assert_eq!(vm.deopt_count(seven_region()), 0);
}

#[test]
fn test_recompile_replaces_code() {
    let (mut vm, log) = jit_vm(seven_loop(5), config(), |_| {
        Ok(Behavior::Return(Value::int(7)))
    });
    vm.run().unwrap();
    let before = vm.compiled_code(seven_region()).unwrap();
    assert!(vm.recompile(seven_region()).unwrap());
    let after = vm.compiled_code(seven_region()).unwrap();
    assert!(!Rc::ptr_eq(&before, &after));
    assert_eq!(log.borrow().compiled.len(), 2);

    let main_region = RegionId::function(FunctionId(0));
    assert!(!vm.recompile(main_region).unwrap());
}
