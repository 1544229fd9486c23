//! Interpreted and compiled runs must be indistinguishable
//!
//! Each program runs once with the JIT off and once with thresholds low
//! enough that its hot functions and loops are compiled; results, output
//! and errors have to match.

use bytecode_system::Program;
use core_types::{FunctionId, RegionId, Value};
use integration_tests::{
    aliasing_program, containers_program, eager_jit, fib_program, float_creep_loop, identity_program,
    run, run_with_stats, vm_for, Outcome,
};
use interpreter::{RuntimeConfig, Tier};
use pretty_assertions::assert_eq;

fn assert_same_in_both_tiers(program: Program) -> Outcome {
    let interpreted = run(program.clone(), RuntimeConfig::interpreted());
    let (compiled, stats) = run_with_stats(program, eager_jit());
    assert!(stats.compilations > 0, "nothing was compiled");
    assert_eq!(compiled, interpreted);
    compiled
}

#[test]
fn test_fib_matches_across_tiers() {
    let outcome = assert_same_in_both_tiers(fib_program(18));
    assert_eq!(outcome.result, Ok("2584".to_string()));
}

#[test]
fn test_float_creep_loop_matches_across_tiers() {
    assert_same_in_both_tiers(float_creep_loop(600, 299));
}

#[test]
fn test_containers_match_across_tiers() {
    let outcome = assert_same_in_both_tiers(containers_program(40));
    assert_eq!(outcome.result, Ok("80".to_string()));
    assert!(outcome.output[0].starts_with("[0, 1, 4, 9, 16, "));
    assert!(outcome.output[0].ends_with(", 1521]"));
    assert_eq!(outcome.output[1], "ab".repeat(40));
}

#[test]
fn test_aliasing_and_copy_across_tiers() {
    let outcome = assert_same_in_both_tiers(aliasing_program(25));
    assert_eq!(outcome.output, vec!["[24, 2]", "[24, 2]", "[24, 7]"]);
}

#[test]
fn test_fib_10_cold_and_after_promotion() {
    let fib = RegionId::function(FunctionId(1));

    let cold = RuntimeConfig {
        call_threshold: 1_000_000,
        ..RuntimeConfig::default()
    };
    let mut vm = vm_for(fib_program(10), cold);
    assert_eq!(vm.run().unwrap(), Value::int(55));
    assert_ne!(vm.tier(fib), Tier::Compiled);
    assert_eq!(vm.native_entries(), 0);

    let mut vm = vm_for(fib_program(10), eager_jit());
    assert_eq!(vm.run().unwrap(), Value::int(55));
    assert_eq!(vm.tier(fib), Tier::Compiled);
    assert!(vm.native_entries() > 0);

    // Called again on the already promoted code
    let callee = vm.global("fib").unwrap();
    assert_eq!(vm.call(callee, &[Value::int(10)]).unwrap(), Value::int(55));
}

#[test]
fn test_promotion_is_idempotent() {
    let fib = RegionId::function(FunctionId(1));
    let mut vm = vm_for(fib_program(12), eager_jit());
    assert_eq!(vm.run().unwrap(), Value::int(144));
    assert_eq!(vm.tier(fib), Tier::Compiled);
    let compilations = vm.tier_stats().compilations;

    assert!(vm.recompile(fib).unwrap());
    assert!(vm.recompile(fib).unwrap());
    assert_eq!(vm.tier(fib), Tier::Compiled);
    assert_eq!(vm.tier_stats().compilations, compilations + 2);

    let callee = vm.global("fib").unwrap();
    assert_eq!(vm.call(callee, &[Value::int(12)]).unwrap(), Value::int(144));
    assert_eq!(vm.deopt_count(fib), 0);
}

#[test]
fn test_values_pass_through_native_code_unchanged() {
    let id = RegionId::function(FunctionId(1));
    let mut vm = vm_for(identity_program(20), eager_jit());
    vm.run().unwrap();
    assert_eq!(vm.tier(id), Tier::Compiled);

    let callee = vm.global("id").unwrap();
    let values = [
        Value::int(0),
        Value::int(core_types::value::INT_MAX),
        Value::int(core_types::value::INT_MIN),
        Value::float(-0.0),
        Value::float(f64::INFINITY),
        Value::float(f64::NAN),
        Value::float(1.5e300),
        Value::TRUE,
        Value::FALSE,
        Value::NONE,
        callee,
    ];
    for value in values {
        let back = vm.call(callee, &[value]).unwrap();
        assert_eq!(back.to_bits(), value.to_bits(), "{value:?}");
    }
    assert_eq!(vm.deopt_count(id), 0);
}
