//! Integration test suite for the Levython VM
//!
//! Shared program builders and runners used by the tests under `tests/`.
//! Every builder produces a validated [`Program`]; the runners execute it
//! once interpreted and once with the Cranelift JIT attached.

use bytecode_system::{Assembler, Constant, FunctionProto, Opcode, Program};
use core_types::{FunctionId, RuntimeError};
use interpreter::{RuntimeConfig, TierStats, VM};
use jit_compiler::JitCompiler;

/// Re-export components for test convenience
pub mod components {
    pub use bytecode_system;
    pub use core_types;
    pub use interpreter;
    pub use jit_compiler;
    pub use lev_cli;
}

/// Thresholds low enough that every hot path here gets compiled
pub fn eager_jit() -> RuntimeConfig {
    RuntimeConfig {
        call_threshold: 2,
        loop_threshold: 10,
        ..RuntimeConfig::default()
    }
}

/// VM with captured output, with the JIT attached when `config.jit` is set
pub fn vm_for(program: Program, config: RuntimeConfig) -> VM {
    let jit = config.jit;
    let mut vm = VM::new(program, config).expect("program validates");
    if jit {
        let backend = JitCompiler::new().expect("host supported by Cranelift");
        vm = vm.with_backend(Box::new(backend));
    }
    vm.capture_output();
    vm
}

/// What a run left behind, comparable across tiers
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Rendered result, or the error's `kind: message`
    pub result: Result<String, String>,
    /// Captured `say` lines
    pub output: Vec<String>,
}

/// Run to completion and also report tier counters
pub fn run_with_stats(program: Program, config: RuntimeConfig) -> (Outcome, TierStats) {
    let mut vm = vm_for(program, config);
    let result = vm
        .run()
        .map(|value| vm.display(value))
        .map_err(|err: RuntimeError| err.to_string());
    let outcome = Outcome {
        result,
        output: vm.output().to_vec(),
    };
    (outcome, vm.tier_stats())
}

/// Run to completion
pub fn run(program: Program, config: RuntimeConfig) -> Outcome {
    run_with_stats(program, config).0
}

/// Entry placeholder so globals and functions can be registered first
pub fn skeleton() -> Program {
    Program::with_entry(FunctionProto::new("<main>", 0, 0))
}

/// Install `main` as the entry function
pub fn with_main(mut program: Program, main: Assembler) -> Program {
    program.functions[0] = main.finish().expect("labels bound");
    program
}

/// `for counter in 0..n { body }`
pub fn counted_loop(asm: &mut Assembler, counter: u16, n: i64, body: impl FnOnce(&mut Assembler)) {
    asm.load_int(0);
    asm.emit(Opcode::StoreLocal(counter));
    let header = asm.here();
    let done = asm.label();
    asm.emit(Opcode::LoadLocal(counter));
    asm.load_int(n);
    asm.emit(Opcode::Lt);
    asm.jump_if_false(done);
    body(asm);
    asm.emit(Opcode::LoadLocal(counter));
    asm.load_int(1);
    asm.emit(Opcode::Add);
    asm.emit(Opcode::StoreLocal(counter));
    asm.jump(header);
    asm.bind(done);
}

/// `fib(n) = n if n < 2 else fib(n - 1) + fib(n - 2)`; returns `fib(n)`
pub fn fib_program(n: i64) -> Program {
    fib_calls(&[], Constant::Int(n))
}

/// Calls `fib` once per argument in `warm`, discarding the results, then
/// returns `fib(last)`
pub fn fib_calls(warm: &[i64], last: Constant) -> Program {
    let mut program = skeleton();
    let slot = program.global("fib");

    let mut f = Assembler::new("fib", 1, 1);
    let recurse = f.label();
    f.emit(Opcode::LoadLocal(0));
    f.load_int(2);
    f.emit(Opcode::Lt);
    f.jump_if_false(recurse);
    f.emit(Opcode::LoadLocal(0));
    f.emit(Opcode::Return);
    f.bind(recurse);
    for k in [1, 2] {
        f.emit(Opcode::LoadGlobal(slot));
        f.emit(Opcode::LoadLocal(0));
        f.load_int(k);
        f.emit(Opcode::Sub);
        f.emit(Opcode::Call(1));
    }
    f.emit(Opcode::Add);
    f.emit(Opcode::Return);
    let fib = program.add_function(f.finish().expect("labels bound"));

    let mut main = Assembler::new("<main>", 0, 0);
    main.emit(Opcode::MakeClosure(fib, vec![]));
    main.emit(Opcode::StoreGlobal(slot));
    for &n in warm {
        main.emit(Opcode::LoadGlobal(slot));
        main.load_int(n);
        main.emit(Opcode::Call(1));
        main.emit(Opcode::Pop);
    }
    main.emit(Opcode::LoadGlobal(slot));
    let k = main.constant(last);
    main.emit(Opcode::LoadConst(k));
    main.emit(Opcode::Call(1));
    main.emit(Opcode::Return);
    with_main(program, main)
}

/// `add(a, b) { return a + b }` bound to the global `add`; returns the
/// global slot and the function id.
pub fn define_add(program: &mut Program) -> (u32, FunctionId) {
    let slot = program.global("add");
    let mut f = Assembler::new("add", 2, 2);
    f.emit(Opcode::LoadLocal(0));
    f.emit(Opcode::LoadLocal(1));
    f.emit(Opcode::Add);
    f.emit(Opcode::Return);
    (slot, program.add_function(f.finish().expect("labels bound")))
}

/// `total = 0; step = 1; for i in 0..n { total += step; if i == switch_at { step = 0.5 } }`
///
/// The accumulator is an integer until `switch_at`, then a float.
pub fn float_creep_loop(n: i64, switch_at: i64) -> Program {
    // locals: 0 total, 1 step, 2 i
    let mut main = Assembler::new("<main>", 0, 3);
    main.load_int(0);
    main.emit(Opcode::StoreLocal(0));
    main.load_int(1);
    main.emit(Opcode::StoreLocal(1));
    counted_loop(&mut main, 2, n, |body| {
        let keep = body.label();
        body.emit(Opcode::LoadLocal(0));
        body.emit(Opcode::LoadLocal(1));
        body.emit(Opcode::Add);
        body.emit(Opcode::StoreLocal(0));
        body.emit(Opcode::LoadLocal(2));
        body.load_int(switch_at);
        body.emit(Opcode::Eq);
        body.jump_if_false(keep);
        body.load_float(0.5);
        body.emit(Opcode::StoreLocal(1));
        body.bind(keep);
    });
    main.emit(Opcode::LoadLocal(0));
    main.emit(Opcode::Return);
    Program::with_entry(main.finish().expect("labels bound"))
}

/// `mix(a, b, c) = (a + 1) + (b + 1) + (c + 1)`, five guarded sites when
/// warmed with integers. Each of `phases` phases makes `rounds` integer
/// calls, then one call with a float in position `phase % 3`. Returns the
/// sum of every result.
pub fn rotating_floats(phases: usize, rounds: i64) -> Program {
    let mut program = skeleton();
    let slot = program.global("mix");
    let mut f = Assembler::new("mix", 3, 3);
    f.emit(Opcode::LoadLocal(0));
    f.load_int(1);
    f.emit(Opcode::Add);
    for local in [1, 2] {
        f.emit(Opcode::LoadLocal(local));
        f.load_int(1);
        f.emit(Opcode::Add);
        f.emit(Opcode::Add);
    }
    f.emit(Opcode::Return);
    let mix = program.add_function(f.finish().expect("labels bound"));

    // locals: 0 total, 1 i
    let mut main = Assembler::new("<main>", 0, 2);
    main.emit(Opcode::MakeClosure(mix, vec![]));
    main.emit(Opcode::StoreGlobal(slot));
    main.load_int(0);
    main.emit(Opcode::StoreLocal(0));
    for phase in 0..phases {
        counted_loop(&mut main, 1, rounds, |body| {
            body.emit(Opcode::LoadLocal(0));
            body.emit(Opcode::LoadGlobal(slot));
            for _ in 0..3 {
                body.emit(Opcode::LoadLocal(1));
            }
            body.emit(Opcode::Call(3));
            body.emit(Opcode::Add);
            body.emit(Opcode::StoreLocal(0));
        });
        main.emit(Opcode::LoadLocal(0));
        main.emit(Opcode::LoadGlobal(slot));
        for position in 0..3 {
            if position == phase % 3 {
                main.load_float(0.5);
            } else {
                main.load_int(1);
            }
        }
        main.emit(Opcode::Call(3));
        main.emit(Opcode::Add);
        main.emit(Opcode::StoreLocal(0));
    }
    main.emit(Opcode::LoadLocal(0));
    main.emit(Opcode::Return);
    with_main(program, main)
}

/// `add` warmed `rounds` times with integers, then `add(1, 2.5)`
pub fn add_then_float(rounds: i64) -> Program {
    let mut program = skeleton();
    let (slot, add) = define_add(&mut program);
    let say = program.global("say");

    let mut main = Assembler::new("<main>", 0, 1);
    main.emit(Opcode::MakeClosure(add, vec![]));
    main.emit(Opcode::StoreGlobal(slot));
    counted_loop(&mut main, 0, rounds, |body| {
        body.emit(Opcode::LoadGlobal(slot));
        body.emit(Opcode::LoadLocal(0));
        body.load_int(1);
        body.emit(Opcode::Call(2));
        body.emit(Opcode::Pop);
    });
    main.emit(Opcode::LoadGlobal(say));
    main.emit(Opcode::LoadGlobal(slot));
    main.load_int(1);
    main.load_int(2);
    main.emit(Opcode::Call(2));
    main.emit(Opcode::Call(1));
    main.emit(Opcode::Pop);
    main.emit(Opcode::LoadGlobal(slot));
    main.load_int(1);
    main.load_float(2.5);
    main.emit(Opcode::Call(2));
    main.emit(Opcode::Return);
    with_main(program, main)
}

/// Builds `[0, 1, 4, ...]` with `append` and a string with `+`, then
/// reports both through `say`; returns `len(s)`.
pub fn containers_program(n: i64) -> Program {
    let mut program = skeleton();
    let append = program.global("append");
    let say = program.global("say");
    let len = program.global("len");

    // locals: 0 xs, 1 s, 2 i
    let mut main = Assembler::new("<main>", 0, 3);
    main.emit(Opcode::BuildList(0));
    main.emit(Opcode::StoreLocal(0));
    main.load_str("");
    main.emit(Opcode::StoreLocal(1));
    counted_loop(&mut main, 2, n, |body| {
        body.emit(Opcode::LoadGlobal(append));
        body.emit(Opcode::LoadLocal(0));
        body.emit(Opcode::LoadLocal(2));
        body.emit(Opcode::LoadLocal(2));
        body.emit(Opcode::Mul);
        body.emit(Opcode::Call(2));
        body.emit(Opcode::Pop);
        body.emit(Opcode::LoadLocal(1));
        body.load_str("ab");
        body.emit(Opcode::Add);
        body.emit(Opcode::StoreLocal(1));
    });
    for local in [0, 1] {
        main.emit(Opcode::LoadGlobal(say));
        main.emit(Opcode::LoadLocal(local));
        main.emit(Opcode::Call(1));
        main.emit(Opcode::Pop);
    }
    main.emit(Opcode::LoadGlobal(len));
    main.emit(Opcode::LoadLocal(1));
    main.emit(Opcode::Call(1));
    main.emit(Opcode::Return);
    with_main(program, main)
}

/// Aliased and copied lists mutated through a hot `poke(list, i, v)`.
///
/// Prints `a` after a write through the alias `b`, then `a` and `c` after
/// a write to the copy `c`.
pub fn aliasing_program(rounds: i64) -> Program {
    let mut program = skeleton();
    let poke_slot = program.global("poke");
    let copy = program.global("copy");
    let say = program.global("say");

    let mut poke = Assembler::new("poke", 3, 3);
    poke.emit(Opcode::LoadLocal(0));
    poke.emit(Opcode::LoadLocal(1));
    poke.emit(Opcode::LoadLocal(2));
    poke.emit(Opcode::SetIndex);
    poke.emit(Opcode::LoadNone);
    poke.emit(Opcode::Return);
    let poke = program.add_function(poke.finish().expect("labels bound"));

    // locals: 0 a, 1 b, 2 c, 3 i
    let mut main = Assembler::new("<main>", 0, 4);
    main.emit(Opcode::MakeClosure(poke, vec![]));
    main.emit(Opcode::StoreGlobal(poke_slot));
    main.load_int(1);
    main.load_int(2);
    main.emit(Opcode::BuildList(2));
    main.emit(Opcode::StoreLocal(0));
    main.emit(Opcode::LoadLocal(0));
    main.emit(Opcode::StoreLocal(1));
    counted_loop(&mut main, 3, rounds, |body| {
        body.emit(Opcode::LoadGlobal(poke_slot));
        body.emit(Opcode::LoadLocal(1));
        body.load_int(0);
        body.emit(Opcode::LoadLocal(3));
        body.emit(Opcode::Call(3));
        body.emit(Opcode::Pop);
    });
    let print = |main: &mut Assembler, local: u16| {
        main.emit(Opcode::LoadGlobal(say));
        main.emit(Opcode::LoadLocal(local));
        main.emit(Opcode::Call(1));
        main.emit(Opcode::Pop);
    };
    print(&mut main, 0);
    main.emit(Opcode::LoadGlobal(copy));
    main.emit(Opcode::LoadLocal(0));
    main.emit(Opcode::Call(1));
    main.emit(Opcode::StoreLocal(2));
    main.emit(Opcode::LoadGlobal(poke_slot));
    main.emit(Opcode::LoadLocal(2));
    main.load_int(1);
    main.load_int(7);
    main.emit(Opcode::Call(3));
    main.emit(Opcode::Pop);
    print(&mut main, 0);
    print(&mut main, 2);
    main.emit(Opcode::LoadNone);
    main.emit(Opcode::Return);
    with_main(program, main)
}

/// Identity function `id`, called `rounds` times with integers
pub fn identity_program(rounds: i64) -> Program {
    let mut program = skeleton();
    let slot = program.global("id");
    let mut f = Assembler::new("id", 1, 1);
    f.emit(Opcode::LoadLocal(0));
    f.emit(Opcode::Return);
    let id = program.add_function(f.finish().expect("labels bound"));

    let mut main = Assembler::new("<main>", 0, 1);
    main.emit(Opcode::MakeClosure(id, vec![]));
    main.emit(Opcode::StoreGlobal(slot));
    counted_loop(&mut main, 0, rounds, |body| {
        body.emit(Opcode::LoadGlobal(slot));
        body.emit(Opcode::LoadLocal(0));
        body.emit(Opcode::Call(1));
        body.emit(Opcode::Pop);
    });
    main.emit(Opcode::LoadNone);
    main.emit(Opcode::Return);
    with_main(program, main)
}

fn load_str(asm: &mut Assembler, text: &str) {
    let k = asm.constant(Constant::Str(text.to_string()));
    asm.emit(Opcode::LoadConst(k));
}

fn field(asm: &mut Assembler, name: &str) -> u32 {
    asm.constant(Constant::Str(name.to_string()))
}

/// Method `name` of the object in local `object`, looked up through its
/// class map, followed by the object itself as the first argument
fn method_of(asm: &mut Assembler, object: u16, name: &str) {
    let class = field(asm, "__class__");
    let method = field(asm, name);
    asm.emit(Opcode::LoadLocal(object));
    asm.emit(Opcode::GetField(class));
    asm.emit(Opcode::GetField(method));
    asm.emit(Opcode::LoadLocal(object));
}

/// Function ids in [`class_program`], after `<main>`
pub mod class_functions {
    use core_types::FunctionId;

    /// `Rect.area(self)`
    pub const RECT_AREA: FunctionId = FunctionId(4);
    /// `Rect(name, w, h)`, the constructor
    pub const NEW_RECT: FunctionId = FunctionId(5);
}

/// Two classes lowered onto maps:
///
/// ```text
/// class Shape { init(name) { self.name = name }  act label() { return self.name } }
/// class Rect is a Shape { init(name, w, h) { self.w = w; self.h = h }
///                         act area() { return self.w * self.h } }
/// total = 0
/// for i in 0..n { r = Rect("r", i, 2); total = total + r.area() }
/// return [total, r.label()]
/// ```
///
/// A class is a map of closures taking `self` first; a subclass starts as
/// a `copy` of its parent's map. An instance is a map holding its class
/// under `__class__`. The constructor runs the parent's `init` with the
/// leading arguments it declares, then the class's own `init`.
pub fn class_program(n: i64) -> Program {
    let mut program = skeleton();
    let shape_class = program.global("Shape");
    let rect_class = program.global("Rect");
    let new_rect_slot = program.global("new_Rect");
    let copy = program.global("copy");

    let mut shape_init = Assembler::new("Shape.init", 2, 2);
    let name = field(&mut shape_init, "name");
    shape_init.emit(Opcode::LoadLocal(0));
    shape_init.emit(Opcode::LoadLocal(1));
    shape_init.emit(Opcode::SetField(name));
    shape_init.emit(Opcode::LoadNone);
    shape_init.emit(Opcode::Return);
    let shape_init = program.add_function(shape_init.finish().expect("labels bound"));

    let mut label = Assembler::new("Shape.label", 1, 1);
    let name = field(&mut label, "name");
    label.emit(Opcode::LoadLocal(0));
    label.emit(Opcode::GetField(name));
    label.emit(Opcode::Return);
    let label = program.add_function(label.finish().expect("labels bound"));

    let mut rect_init = Assembler::new("Rect.init", 4, 4);
    for (local, key) in [(2, "w"), (3, "h")] {
        let key = field(&mut rect_init, key);
        rect_init.emit(Opcode::LoadLocal(0));
        rect_init.emit(Opcode::LoadLocal(local));
        rect_init.emit(Opcode::SetField(key));
    }
    rect_init.emit(Opcode::LoadNone);
    rect_init.emit(Opcode::Return);
    let rect_init = program.add_function(rect_init.finish().expect("labels bound"));

    let mut area = Assembler::new("Rect.area", 1, 1);
    let (w, h) = (field(&mut area, "w"), field(&mut area, "h"));
    area.emit(Opcode::LoadLocal(0));
    area.emit(Opcode::GetField(w));
    area.emit(Opcode::LoadLocal(0));
    area.emit(Opcode::GetField(h));
    area.emit(Opcode::Mul);
    area.emit(Opcode::Return);
    let area = program.add_function(area.finish().expect("labels bound"));

    // new_Rect(name, w, h) with `self` in local 3
    let mut ctor = Assembler::new("Rect", 3, 4);
    let init = field(&mut ctor, "init");
    load_str(&mut ctor, "__class__");
    ctor.emit(Opcode::LoadGlobal(rect_class));
    ctor.emit(Opcode::BuildMap(1));
    ctor.emit(Opcode::StoreLocal(3));
    ctor.emit(Opcode::LoadGlobal(shape_class));
    ctor.emit(Opcode::GetField(init));
    ctor.emit(Opcode::LoadLocal(3));
    ctor.emit(Opcode::LoadLocal(0));
    ctor.emit(Opcode::Call(2));
    ctor.emit(Opcode::Pop);
    ctor.emit(Opcode::LoadGlobal(rect_class));
    ctor.emit(Opcode::GetField(init));
    for local in [3, 0, 1, 2] {
        ctor.emit(Opcode::LoadLocal(local));
    }
    ctor.emit(Opcode::Call(4));
    ctor.emit(Opcode::Pop);
    ctor.emit(Opcode::LoadLocal(3));
    ctor.emit(Opcode::Return);
    let ctor = program.add_function(ctor.finish().expect("labels bound"));

    // locals: 0 counter, 1 total, 2 r
    let mut main = Assembler::new("<main>", 0, 3);
    load_str(&mut main, "init");
    main.emit(Opcode::MakeClosure(shape_init, vec![]));
    load_str(&mut main, "label");
    main.emit(Opcode::MakeClosure(label, vec![]));
    main.emit(Opcode::BuildMap(2));
    main.emit(Opcode::StoreGlobal(shape_class));

    main.emit(Opcode::LoadGlobal(copy));
    main.emit(Opcode::LoadGlobal(shape_class));
    main.emit(Opcode::Call(1));
    main.emit(Opcode::StoreGlobal(rect_class));
    for (key, function) in [("init", rect_init), ("area", area)] {
        let key = field(&mut main, key);
        main.emit(Opcode::LoadGlobal(rect_class));
        main.emit(Opcode::MakeClosure(function, vec![]));
        main.emit(Opcode::SetField(key));
    }
    main.emit(Opcode::MakeClosure(ctor, vec![]));
    main.emit(Opcode::StoreGlobal(new_rect_slot));

    main.load_int(0);
    main.emit(Opcode::StoreLocal(1));
    counted_loop(&mut main, 0, n, |body| {
        body.emit(Opcode::LoadGlobal(new_rect_slot));
        load_str(body, "r");
        body.emit(Opcode::LoadLocal(0));
        body.load_int(2);
        body.emit(Opcode::Call(3));
        body.emit(Opcode::StoreLocal(2));
        body.emit(Opcode::LoadLocal(1));
        method_of(body, 2, "area");
        body.emit(Opcode::Call(1));
        body.emit(Opcode::Add);
        body.emit(Opcode::StoreLocal(1));
    });
    main.emit(Opcode::LoadLocal(1));
    method_of(&mut main, 2, "label");
    main.emit(Opcode::Call(1));
    main.emit(Opcode::BuildList(2));
    main.emit(Opcode::Return);
    with_main(program, main)
}
