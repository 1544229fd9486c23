//! Unit tests for interpreter semantics

use bytecode_system::{Assembler, CaptureSource, Constant, FunctionProto, Opcode, Program};
use core_types::{ErrorKind, FunctionId, RegionId, RegionKind, TypeTag, Value};
use interpreter::{RuntimeConfig, Tier, VM};
use pretty_assertions::assert_eq;

fn vm_for(program: Program) -> VM {
    let mut vm = VM::new(program, RuntimeConfig::interpreted()).unwrap();
    vm.capture_output();
    vm
}

/// Program with a placeholder entry so globals and functions can be
/// registered before the entry body is assembled.
fn skeleton() -> Program {
    Program::with_entry(FunctionProto::new("<main>", 0, 0))
}

/// fib(n) = n if n < 2 else fib(n - 1) + fib(n - 2)
fn fib_proto(fib_slot: u32) -> FunctionProto {
    let mut f = Assembler::new("fib", 1, 1);
    let recurse = f.label();
    f.emit(Opcode::LoadLocal(0));
    f.load_int(2);
    f.emit(Opcode::Lt);
    f.jump_if_false(recurse);
    f.emit(Opcode::LoadLocal(0));
    f.emit(Opcode::Return);
    f.bind(recurse);
    f.emit(Opcode::LoadGlobal(fib_slot));
    f.emit(Opcode::LoadLocal(0));
    f.load_int(1);
    f.emit(Opcode::Sub);
    f.emit(Opcode::Call(1));
    f.emit(Opcode::LoadGlobal(fib_slot));
    f.emit(Opcode::LoadLocal(0));
    f.load_int(2);
    f.emit(Opcode::Sub);
    f.emit(Opcode::Call(1));
    f.emit(Opcode::Add);
    f.emit(Opcode::Return);
    f.finish().unwrap()
}

fn fib_program(n: i64) -> Program {
    let mut program = skeleton();
    let slot = program.global("fib");
    let fib = program.add_function(fib_proto(slot));
    let mut main = Assembler::new("<main>", 0, 0);
    main.emit(Opcode::MakeClosure(fib, vec![]));
    main.emit(Opcode::StoreGlobal(slot));
    main.emit(Opcode::LoadGlobal(slot));
    main.load_int(n);
    main.emit(Opcode::Call(1));
    main.emit(Opcode::Return);
    program.functions[0] = main.finish().unwrap();
    program
}

/// total = 0; i = 0; while i < n { total = total + step; i = i + 1 }
fn sum_loop(n: i64, step: Constant) -> Program {
    let mut main = Assembler::new("<main>", 0, 2);
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
    let step = main.constant(step);
    main.emit(Opcode::LoadConst(step));
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
    Program::with_entry(main.finish().unwrap())
}

// ============================================================================
// Arithmetic and control flow
// ============================================================================

#[test]
fn test_recursive_fib() {
    let mut vm = vm_for(fib_program(10));
    assert_eq!(vm.run().unwrap(), Value::int(55));
    assert_eq!(vm.profile(FunctionId(1)).invocations, 177);
}

#[test]
fn test_loop_counts_back_edges() {
    let mut vm = vm_for(sum_loop(50, Constant::Int(2)));
    assert_eq!(vm.run().unwrap(), Value::int(100));
    let profile = vm.profile(FunctionId(0));
    assert_eq!(profile.count(RegionKind::Loop { header: 4 }), 50);
    // Without a back end nothing ever leaves the interpreter
    assert_eq!(vm.tier(RegionId::loop_at(FunctionId(0), 4)), Tier::Cold);
    assert_eq!(vm.native_entries(), 0);
}

#[test]
fn test_mixed_numeric_addition_widens() {
    let mut vm = vm_for(sum_loop(4, Constant::Float(0.5)));
    assert_eq!(vm.run().unwrap(), Value::float(2.0));
    let site = vm.profile(FunctionId(0)).site(10);
    assert!(site.lhs.contains(TypeTag::Int));
    assert!(site.lhs.contains(TypeTag::Float));
}

#[test]
fn test_integer_overflow_promotes_to_float() {
    let mut main = Assembler::new("<main>", 0, 0);
    main.load_int((1 << 47) - 1);
    main.load_int(1);
    main.emit(Opcode::Add);
    main.emit(Opcode::Return);
    let mut vm = vm_for(Program::with_entry(main.finish().unwrap()));
    assert_eq!(vm.run().unwrap(), Value::float(140_737_488_355_328.0));
}

#[test]
fn test_string_concatenation() {
    let mut main = Assembler::new("<main>", 0, 0);
    main.load_str("n=");
    main.load_int(3);
    main.emit(Opcode::Add);
    main.emit(Opcode::Return);
    let mut vm = vm_for(Program::with_entry(main.finish().unwrap()));
    let result = vm.run().unwrap();
    assert_eq!(vm.display(result), "n=3");
}

#[test]
fn test_and_short_circuits() {
    // 0 and crash()  ->  0, crash never called
    let mut program = skeleton();
    let crash = program.global("crash");
    let mut main = Assembler::new("<main>", 0, 0);
    let done = main.label();
    main.load_int(0);
    main.branch(Opcode::JumpIfFalseOrPop, done);
    main.emit(Opcode::LoadGlobal(crash));
    main.emit(Opcode::Call(0));
    main.bind(done);
    main.emit(Opcode::Return);
    program.functions[0] = main.finish().unwrap();
    assert_eq!(vm_for(program).run().unwrap(), Value::int(0));
}

// ============================================================================
// Functions and closures
// ============================================================================

#[test]
fn test_host_call_into_program_function() {
    let mut vm = vm_for(fib_program(1));
    vm.run().unwrap();
    let fib = vm.global("fib").unwrap();
    assert_eq!(vm.call(fib, &[Value::int(12)]).unwrap(), Value::int(144));
}

#[test]
fn test_closure_updates_its_own_capture() {
    // make_counter() { n = 0; return () => { n = n + 1; return n } }
    let mut program = skeleton();
    let mut inc = Assembler::new("inc", 0, 0);
    inc.captures(1);
    inc.emit(Opcode::LoadCapture(0));
    inc.load_int(1);
    inc.emit(Opcode::Add);
    inc.emit(Opcode::StoreCapture(0));
    inc.emit(Opcode::LoadCapture(0));
    inc.emit(Opcode::Return);
    let inc = program.add_function(inc.finish().unwrap());

    let mut main = Assembler::new("<main>", 0, 2);
    main.load_int(0);
    main.emit(Opcode::StoreLocal(0));
    main.emit(Opcode::MakeClosure(inc, vec![CaptureSource::Local(0)]));
    main.emit(Opcode::StoreLocal(1));
    main.emit(Opcode::LoadLocal(1));
    main.emit(Opcode::Call(0));
    main.emit(Opcode::Pop);
    main.emit(Opcode::LoadLocal(1));
    main.emit(Opcode::Call(0));
    main.emit(Opcode::Return);
    program.functions[0] = main.finish().unwrap();

    assert_eq!(vm_for(program).run().unwrap(), Value::int(2));
}

#[test]
fn test_list_aliasing_and_copy() {
    // a = [1]; b = a; append(b, 2); c = copy(a); append(c, 3); say(a); say(c)
    let mut program = skeleton();
    let append = program.global("append");
    let copy = program.global("copy");
    let say = program.global("say");
    let mut main = Assembler::new("<main>", 0, 3);
    main.load_int(1);
    main.emit(Opcode::BuildList(1));
    main.emit(Opcode::StoreLocal(0));
    main.emit(Opcode::LoadLocal(0));
    main.emit(Opcode::StoreLocal(1));
    main.emit(Opcode::LoadGlobal(append));
    main.emit(Opcode::LoadLocal(1));
    main.load_int(2);
    main.emit(Opcode::Call(2));
    main.emit(Opcode::Pop);
    main.emit(Opcode::LoadGlobal(copy));
    main.emit(Opcode::LoadLocal(0));
    main.emit(Opcode::Call(1));
    main.emit(Opcode::StoreLocal(2));
    main.emit(Opcode::LoadGlobal(append));
    main.emit(Opcode::LoadLocal(2));
    main.load_int(3);
    main.emit(Opcode::Call(2));
    main.emit(Opcode::Pop);
    for local in [0, 2] {
        main.emit(Opcode::LoadGlobal(say));
        main.emit(Opcode::LoadLocal(local));
        main.emit(Opcode::Call(1));
        main.emit(Opcode::Pop);
    }
    main.emit(Opcode::LoadNone);
    main.emit(Opcode::Return);
    program.functions[0] = main.finish().unwrap();

    let mut vm = vm_for(program);
    vm.run().unwrap();
    assert_eq!(vm.output(), &["[1, 2]".to_string(), "[1, 2, 3]".to_string()]);
}

#[test]
fn test_map_fields() {
    // m = {"x": 1}; m.y = 2; return m.x + m.y
    let mut main = Assembler::new("<main>", 0, 1);
    main.load_str("x");
    main.load_int(1);
    main.emit(Opcode::BuildMap(1));
    main.emit(Opcode::StoreLocal(0));
    let x = main.constant(Constant::Str("x".into()));
    let y = main.constant(Constant::Str("y".into()));
    main.emit(Opcode::LoadLocal(0));
    main.load_int(2);
    main.emit(Opcode::SetField(y));
    main.emit(Opcode::LoadLocal(0));
    main.emit(Opcode::GetField(x));
    main.emit(Opcode::LoadLocal(0));
    main.emit(Opcode::GetField(y));
    main.emit(Opcode::Add);
    main.emit(Opcode::Return);
    let mut vm = vm_for(Program::with_entry(main.finish().unwrap()));
    assert_eq!(vm.run().unwrap(), Value::int(3));
}

// ============================================================================
// Errors and handlers
// ============================================================================

#[test]
fn test_uncaught_error_location_and_trace() {
    // boom() { return 1 + none }
    let mut program = skeleton();
    let mut boom = Assembler::new("boom", 0, 0);
    boom.load_int(1);
    boom.emit(Opcode::LoadNone);
    boom.emit(Opcode::Add);
    boom.emit(Opcode::Return);
    let boom = program.add_function(boom.finish().unwrap());
    let mut main = Assembler::new("<main>", 0, 0);
    main.emit(Opcode::MakeClosure(boom, vec![]));
    main.emit(Opcode::Call(0));
    main.emit(Opcode::Return);
    program.functions[0] = main.finish().unwrap();

    let err = vm_for(program).run().unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeError);
    assert_eq!(err.message, "Unsupported operand types for '+': integer, none");
    assert_eq!(err.offset, Some(2));
    let trace: Vec<_> = err.trace.iter().map(|f| (f.function.as_str(), f.offset)).collect();
    assert_eq!(trace, vec![("boom", 2), ("<main>", 1)]);
}

#[test]
fn test_throw_caught_by_caller_handler() {
    // thrower() { throw "bad" }
    // main: try { thrower() } catch e { return e }
    let mut program = skeleton();
    let mut thrower = Assembler::new("thrower", 0, 0);
    thrower.load_str("bad");
    thrower.emit(Opcode::Throw);
    let thrower = program.add_function(thrower.finish().unwrap());

    let mut main = Assembler::new("<main>", 0, 0);
    let start = main.here();
    main.emit(Opcode::MakeClosure(thrower, vec![]));
    main.emit(Opcode::Call(0));
    main.emit(Opcode::Return);
    let end = main.here();
    main.emit(Opcode::Return);
    main.handler(start, end, end, 0);
    program.functions[0] = main.finish().unwrap();

    let mut vm = vm_for(program);
    let caught = vm.run().unwrap();
    assert_eq!(vm.display(caught), "bad");
}

#[test]
fn test_handler_restores_operand_depth() {
    // 10 + (try { 1 / 0 } catch _ { 5 })
    let mut main = Assembler::new("<main>", 0, 0);
    let resume = main.label();
    main.load_int(10);
    let start = main.here();
    main.load_int(1);
    main.load_int(0);
    main.emit(Opcode::Div);
    let end = main.here();
    main.jump(resume);
    let catch = main.here();
    main.emit(Opcode::Pop);
    main.load_int(5);
    main.bind(resume);
    main.emit(Opcode::Add);
    main.emit(Opcode::Return);
    main.handler(start, end, catch, 1);
    let mut vm = vm_for(Program::with_entry(main.finish().unwrap()));
    assert_eq!(vm.run().unwrap(), Value::int(15));
}

#[test]
fn test_call_arity_error() {
    let mut program = fib_program(1);
    let fib = program.global("fib");
    let mut main = Assembler::new("<main>", 0, 0);
    main.emit(Opcode::MakeClosure(FunctionId(1), vec![]));
    main.emit(Opcode::StoreGlobal(fib));
    main.emit(Opcode::LoadGlobal(fib));
    main.load_int(1);
    main.load_int(2);
    main.emit(Opcode::Call(2));
    main.emit(Opcode::Return);
    program.functions[0] = main.finish().unwrap();

    let err = vm_for(program).run().unwrap_err();
    assert_eq!(err.kind, ErrorKind::ArityError);
    assert_eq!(err.message, "fib() expects 1 arguments, got 2");
}

#[test]
fn test_calling_non_function() {
    let mut main = Assembler::new("<main>", 0, 0);
    main.load_int(3);
    main.emit(Opcode::Call(0));
    main.emit(Opcode::Return);
    let err = vm_for(Program::with_entry(main.finish().unwrap()))
        .run()
        .unwrap_err();
    assert_eq!(err.to_string(), "TypeError: Cannot call type: integer");
}

#[test]
fn test_runaway_recursion() {
    // f() { return f() }
    let mut program = skeleton();
    let slot = program.global("f");
    let mut f = Assembler::new("f", 0, 0);
    f.emit(Opcode::LoadGlobal(slot));
    f.emit(Opcode::Call(0));
    f.emit(Opcode::Return);
    let f = program.add_function(f.finish().unwrap());
    let mut main = Assembler::new("<main>", 0, 0);
    main.emit(Opcode::MakeClosure(f, vec![]));
    main.emit(Opcode::StoreGlobal(slot));
    main.emit(Opcode::LoadGlobal(slot));
    main.emit(Opcode::Call(0));
    main.emit(Opcode::Return);
    program.functions[0] = main.finish().unwrap();

    let config = RuntimeConfig {
        max_call_depth: 200,
        ..RuntimeConfig::interpreted()
    };
    let err = VM::new(program, config).unwrap().run().unwrap_err();
    assert_eq!(err.kind, ErrorKind::RecursionError);
    assert_eq!(err.trace.len(), 64);
}

#[test]
fn test_invalid_program_rejected() {
    let mut main = FunctionProto::new("<main>", 0, 0);
    main.emit(Opcode::Add);
    main.emit(Opcode::Return);
    assert!(VM::new(Program::with_entry(main), RuntimeConfig::default()).is_err());
}
