//! Exceptions crossing native frames
//!
//! Errors raised inside compiled code unwind through compiled and
//! interpreted frames alike and land in the innermost handler, with the
//! same caught value and traceback the interpreter would produce.

use bytecode_system::{Assembler, Opcode, Program};
use core_types::{FunctionId, RegionId, Value};
use integration_tests::{counted_loop, eager_jit, run, skeleton, vm_for, with_main};
use interpreter::{RuntimeConfig, Tier};
use pretty_assertions::assert_eq;

/// inner(x) throws "negative" for x < 0; outer(x) returns inner(x) + 1.
/// Both are warmed with `rounds` non-negative calls before `outer(-1)`,
/// which is guarded by a handler in main when `caught` is set.
fn nested_throw(rounds: i64, caught: bool) -> Program {
    let mut program = skeleton();
    let inner_slot = program.global("inner");
    let outer_slot = program.global("outer");

    let mut inner = Assembler::new("inner", 1, 1);
    let ok = inner.label();
    inner.emit(Opcode::LoadLocal(0));
    inner.load_int(0);
    inner.emit(Opcode::Lt);
    inner.jump_if_false(ok);
    inner.load_str("negative");
    inner.emit(Opcode::Throw);
    inner.bind(ok);
    inner.emit(Opcode::LoadLocal(0));
    inner.emit(Opcode::Return);
    let inner = program.add_function(inner.finish().unwrap());

    let mut outer = Assembler::new("outer", 1, 1);
    outer.emit(Opcode::LoadGlobal(inner_slot));
    outer.emit(Opcode::LoadLocal(0));
    outer.emit(Opcode::Call(1));
    outer.load_int(1);
    outer.emit(Opcode::Add);
    outer.emit(Opcode::Return);
    let outer = program.add_function(outer.finish().unwrap());

    let mut main = Assembler::new("<main>", 0, 1);
    main.emit(Opcode::MakeClosure(inner, vec![]));
    main.emit(Opcode::StoreGlobal(inner_slot));
    main.emit(Opcode::MakeClosure(outer, vec![]));
    main.emit(Opcode::StoreGlobal(outer_slot));
    counted_loop(&mut main, 0, rounds, |body| {
        body.emit(Opcode::LoadGlobal(outer_slot));
        body.emit(Opcode::LoadLocal(0));
        body.emit(Opcode::Call(1));
        body.emit(Opcode::Pop);
    });
    let start = main.here();
    main.emit(Opcode::LoadGlobal(outer_slot));
    main.load_int(-1);
    main.emit(Opcode::Call(1));
    main.emit(Opcode::Return);
    let end = main.here();
    main.emit(Opcode::Return);
    if caught {
        main.handler(start, end, end, 0);
    }
    with_main(program, main)
}

/// safe(x) { try { return 10 / x } catch { return -1 } }, warmed with
/// x in 1..=rounds, then safe(0)
fn safe_division(rounds: i64) -> Program {
    let mut program = skeleton();
    let slot = program.global("safe");

    let mut safe = Assembler::new("safe", 1, 1);
    let start = safe.here();
    safe.load_int(10);
    safe.emit(Opcode::LoadLocal(0));
    safe.emit(Opcode::Div);
    safe.emit(Opcode::Return);
    let end = safe.here();
    safe.emit(Opcode::Pop);
    safe.load_int(-1);
    safe.emit(Opcode::Return);
    safe.handler(start, end, end, 0);
    let safe = program.add_function(safe.finish().unwrap());

    let mut main = Assembler::new("<main>", 0, 1);
    main.emit(Opcode::MakeClosure(safe, vec![]));
    main.emit(Opcode::StoreGlobal(slot));
    counted_loop(&mut main, 0, rounds, |body| {
        body.emit(Opcode::LoadGlobal(slot));
        body.emit(Opcode::LoadLocal(0));
        body.load_int(1);
        body.emit(Opcode::Add);
        body.emit(Opcode::Call(1));
        body.emit(Opcode::Pop);
    });
    main.emit(Opcode::LoadGlobal(slot));
    main.load_int(0);
    main.emit(Opcode::Call(1));
    main.emit(Opcode::Return);
    with_main(program, main)
}

#[test]
fn test_throw_unwinds_two_compiled_frames_to_main_handler() {
    let mut vm = vm_for(nested_throw(20, true), eager_jit());
    let caught = vm.run().unwrap();
    assert_eq!(vm.display(caught), "negative");

    for function in [1, 2] {
        let region = RegionId::function(FunctionId(function));
        assert_eq!(vm.tier(region), Tier::Compiled);
        assert_eq!(vm.deopt_count(region), 0);
    }
}

#[test]
fn test_uncaught_throw_reports_every_frame() {
    let interpreted = vm_for(nested_throw(20, false), RuntimeConfig::interpreted())
        .run()
        .unwrap_err();
    let compiled = vm_for(nested_throw(20, false), eager_jit())
        .run()
        .unwrap_err();

    assert_eq!(compiled.kind, interpreted.kind);
    assert_eq!(compiled.message, interpreted.message);
    assert_eq!(compiled.offset, interpreted.offset);
    let names: Vec<_> = compiled.trace.iter().map(|f| f.function.as_str()).collect();
    assert_eq!(names, vec!["inner", "outer", "<main>"]);
    let offsets: Vec<_> = compiled.trace.iter().map(|f| f.offset).collect();
    let expected: Vec<_> = interpreted.trace.iter().map(|f| f.offset).collect();
    assert_eq!(offsets, expected);
    assert!(compiled.trace[0].compiled);
    assert!(compiled.trace[1].compiled);
    assert!(interpreted.trace.iter().all(|f| !f.compiled));
}

#[test]
fn test_handler_inside_compiled_function() {
    let mut vm = vm_for(safe_division(30), eager_jit());
    assert_eq!(vm.run().unwrap(), Value::int(-1));
    let safe = RegionId::function(FunctionId(1));
    assert_eq!(vm.tier(safe), Tier::Compiled);

    let interpreted = run(safe_division(30), RuntimeConfig::interpreted());
    assert_eq!(interpreted.result, Ok("-1".to_string()));
}

#[test]
fn test_compiled_handler_catches_type_errors_too() {
    let mut vm = vm_for(safe_division(30), eager_jit());
    vm.run().unwrap();
    let callee = vm.global("safe").unwrap();
    assert_eq!(vm.call(callee, &[Value::int(4)]).unwrap(), Value::float(2.5));
    // The operand guard fails first; the interpreter raises and catches
    assert_eq!(vm.call(callee, &[Value::NONE]).unwrap(), Value::int(-1));
}
