//! Unit tests for the bytecode program model

use bytecode_system::{
    Assembler, CaptureSource, Constant, FunctionProto, Opcode, Program, ProgramError,
};
use core_types::FunctionId;
use pretty_assertions::assert_eq;

fn fib_program() -> Program {
    let mut program = Program::with_entry(FunctionProto::new("<main>", 0, 0));
    let fib_slot = program.global("fib");

    let mut fib = Assembler::new("fib", 1, 1);
    let recurse = fib.label();
    fib.emit(Opcode::LoadLocal(0));
    fib.load_int(2);
    fib.emit(Opcode::Lt);
    fib.jump_if_false(recurse);
    fib.emit(Opcode::LoadLocal(0));
    fib.emit(Opcode::Return);
    fib.bind(recurse);
    fib.emit(Opcode::LoadGlobal(fib_slot));
    fib.emit(Opcode::LoadLocal(0));
    fib.load_int(1);
    fib.emit(Opcode::Sub);
    fib.emit(Opcode::Call(1));
    fib.emit(Opcode::LoadGlobal(fib_slot));
    fib.emit(Opcode::LoadLocal(0));
    fib.load_int(2);
    fib.emit(Opcode::Sub);
    fib.emit(Opcode::Call(1));
    fib.emit(Opcode::Add);
    fib.emit(Opcode::Return);
    let fib_id = program.add_function(fib.finish().unwrap());

    let mut main = Assembler::new("<main>", 0, 0);
    main.emit(Opcode::MakeClosure(fib_id, vec![]));
    main.emit(Opcode::StoreGlobal(fib_slot));
    main.emit(Opcode::LoadGlobal(fib_slot));
    main.load_int(10);
    main.emit(Opcode::Call(1));
    main.emit(Opcode::Return);
    program.functions[0] = main.finish().unwrap();
    program
}

#[test]
fn test_fib_program_validates() {
    let program = fib_program();
    let layouts = program.validate().unwrap();
    assert_eq!(layouts.len(), 2);
    // callee, argument and the pending left operand of the final add
    assert_eq!(layouts[1].max_stack, 4);
    assert!(layouts[1].loops.is_empty());
}

#[test]
fn test_program_survives_json() {
    let program = fib_program();
    let text = program.to_json().unwrap();
    let restored = Program::from_json(&text).unwrap();
    assert_eq!(restored, program);
    restored.validate().unwrap();
}

#[test]
fn test_closure_capture_count_must_match() {
    let mut program = Program::with_entry(FunctionProto::new("<main>", 0, 1));
    let mut inner = Assembler::new("inner", 0, 0);
    inner.captures(1);
    inner.emit(Opcode::LoadCapture(0));
    inner.emit(Opcode::Return);
    let inner_id = program.add_function(inner.finish().unwrap());

    let mut main = Assembler::new("<main>", 0, 1);
    main.emit(Opcode::MakeClosure(inner_id, vec![]));
    main.emit(Opcode::Return);
    program.functions[0] = main.finish().unwrap();
    assert!(matches!(
        program.validate(),
        Err(ProgramError::BadOperand { what: "capture list of function", .. })
    ));

    program.functions[0].code[0].opcode =
        Opcode::MakeClosure(inner_id, vec![CaptureSource::Local(0)]);
    program.validate().unwrap();
}

#[test]
fn test_field_name_must_be_string() {
    let mut main = FunctionProto::new("<main>", 0, 0);
    let idx = main.add_constant(Constant::Int(1));
    main.emit(Opcode::LoadNone);
    main.emit(Opcode::GetField(idx));
    main.emit(Opcode::Return);
    let program = Program::with_entry(main);
    assert!(matches!(
        program.validate(),
        Err(ProgramError::FieldName { index: 0, .. })
    ));
}

#[test]
fn test_missing_entry() {
    let mut program = Program::with_entry(FunctionProto::new("<main>", 0, 0));
    program.entry = FunctionId(5);
    assert_eq!(program.validate(), Err(ProgramError::MissingEntry(5)));
}
