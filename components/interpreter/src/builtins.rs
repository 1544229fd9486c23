//! Builtin prelude
//!
//! Builtins are bound to the program's global slots by name when a VM is
//! created; a program that never names a builtin never sees it.

use core_types::{
    Arity, ErrorKind, Heap, HeapObject, NativeContext, NativeFunction, RuntimeError, Value,
    ValueKind,
};

const PRELUDE: &[NativeFunction] = &[
    NativeFunction {
        name: "say",
        arity: Arity::Exact(1),
        func: say,
    },
    NativeFunction {
        name: "len",
        arity: Arity::Exact(1),
        func: len,
    },
    NativeFunction {
        name: "append",
        arity: Arity::Exact(2),
        func: append,
    },
    NativeFunction {
        name: "str",
        arity: Arity::Exact(1),
        func: to_str,
    },
    NativeFunction {
        name: "int",
        arity: Arity::Exact(1),
        func: to_int,
    },
    NativeFunction {
        name: "float",
        arity: Arity::Exact(1),
        func: to_float,
    },
    NativeFunction {
        name: "type",
        arity: Arity::Exact(1),
        func: type_of,
    },
    NativeFunction {
        name: "range",
        arity: Arity::Range(1, 3),
        func: range,
    },
    NativeFunction {
        name: "copy",
        arity: Arity::Exact(1),
        func: copy,
    },
];

const MATH: &[NativeFunction] = &[
    NativeFunction {
        name: "sin",
        arity: Arity::Exact(1),
        func: sin,
    },
    NativeFunction {
        name: "cos",
        arity: Arity::Exact(1),
        func: cos,
    },
    NativeFunction {
        name: "sqrt",
        arity: Arity::Exact(1),
        func: sqrt,
    },
];

/// Names the prelude can bind
pub fn names() -> impl Iterator<Item = &'static str> {
    PRELUDE.iter().map(|f| f.name).chain(std::iter::once("math"))
}

/// Allocate the builtin bound to `name`, if there is one.
pub fn bind(heap: &mut Heap, name: &str) -> Option<Value> {
    if name == "math" {
        let mut members = vec![
            ("pi".to_string(), Value::float(std::f64::consts::PI)),
            ("e".to_string(), Value::float(std::f64::consts::E)),
        ];
        for f in MATH {
            members.push((
                f.name.to_string(),
                heap.alloc_value(HeapObject::NativeFunction(f.clone())),
            ));
        }
        return Some(heap.map(members));
    }
    PRELUDE
        .iter()
        .find(|f| f.name == name)
        .map(|f| heap.alloc_value(HeapObject::NativeFunction(f.clone())))
}

/// Argument-count check shared by native and bytecode calls
pub fn check_arity(name: &str, arity: Arity, got: usize) -> Result<(), RuntimeError> {
    if arity.accepts(got) {
        return Ok(());
    }
    let expected = match arity {
        Arity::Exact(n) => n.to_string(),
        Arity::Range(lo, hi) => format!("{lo} to {hi}"),
    };
    Err(RuntimeError::new(
        ErrorKind::ArityError,
        format!("{name}() expects {expected} arguments, got {got}"),
    ))
}

fn say(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    let line = ctx.heap().display(args[0]);
    ctx.write_line(&line);
    Ok(Value::NONE)
}

fn len(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    let heap = ctx.heap();
    let n = match heap.object(args[0]) {
        Some(HeapObject::String(s)) => s.chars().count(),
        Some(HeapObject::List(items)) => items.len(),
        Some(HeapObject::Map(entries)) => entries.len(),
        _ => {
            return Err(RuntimeError::type_error(format!(
                "len() not supported for type {}",
                heap.type_name(args[0])
            )))
        }
    };
    Ok(Value::from_i64(n as i64))
}

fn append(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    if let Some(handle) = args[0].as_handle() {
        if let HeapObject::List(items) = ctx.heap_mut().get_mut(handle) {
            items.push(args[1]);
            return Ok(args[0]);
        }
    }
    Err(RuntimeError::type_error(
        "First argument to append() must be a list.",
    ))
}

fn to_str(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    if ctx.heap().as_str(args[0]).is_some() {
        return Ok(args[0]);
    }
    let text = ctx.heap().display(args[0]);
    Ok(ctx.heap_mut().string(text))
}

fn conversion_error(heap: &Heap, value: Value, target: &str) -> RuntimeError {
    match heap.as_str(value) {
        Some(text) => RuntimeError::type_error(format!("Cannot convert '{text}' to {target}.")),
        None => RuntimeError::type_error(format!(
            "Cannot convert type {} to {target}.",
            heap.type_name(value)
        )),
    }
}

fn to_int(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    let heap = ctx.heap();
    let value = args[0];
    let converted = match value.kind() {
        ValueKind::Int(_) => Some(value),
        ValueKind::Float(f) if f.is_finite() => Some(Value::from_i64(f.trunc() as i64)),
        ValueKind::Bool(b) => Some(Value::int(i64::from(b))),
        ValueKind::Heap(_) => heap
            .as_str(value)
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(Value::from_i64),
        _ => None,
    };
    converted.ok_or_else(|| conversion_error(heap, value, "integer"))
}

fn to_float(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    let heap = ctx.heap();
    let value = args[0];
    let converted = match value.kind() {
        ValueKind::Int(i) => Some(Value::float(i as f64)),
        ValueKind::Float(_) => Some(value),
        ValueKind::Bool(b) => Some(Value::float(if b { 1.0 } else { 0.0 })),
        ValueKind::Heap(_) => heap
            .as_str(value)
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(Value::float),
        ValueKind::None => None,
    };
    converted.ok_or_else(|| conversion_error(heap, value, "float"))
}

fn type_of(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    let name = ctx.heap().type_name(args[0]);
    Ok(ctx.heap_mut().string(name))
}

fn range(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut bounds = [0i64, 0, 1];
    let ints: Option<Vec<i64>> = args.iter().map(|v| v.as_int()).collect();
    let ints = ints.ok_or_else(|| RuntimeError::type_error("range() requires integer arguments."))?;
    match ints.as_slice() {
        [stop] => bounds[1] = *stop,
        [start, stop] => {
            bounds[0] = *start;
            bounds[1] = *stop;
        }
        _ => bounds.copy_from_slice(&ints[..3]),
    }
    let [start, stop, step] = bounds;
    if step == 0 {
        return Err(RuntimeError::type_error("range() step cannot be zero."));
    }
    let mut items = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        items.push(Value::int(i));
        i += step;
    }
    Ok(ctx.heap_mut().list(items))
}

fn copy(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    let heap = ctx.heap_mut();
    let object = match heap.object(args[0]) {
        Some(HeapObject::List(items)) => HeapObject::List(items.clone()),
        Some(HeapObject::Map(entries)) => HeapObject::Map(entries.clone()),
        _ => return Ok(args[0]),
    };
    Ok(heap.alloc_value(object))
}

fn number_arg(ctx: &dyn NativeContext, name: &str, value: Value) -> Result<f64, RuntimeError> {
    value.as_number().ok_or_else(|| {
        RuntimeError::type_error(format!(
            "math.{name}() argument must be a number, not {}",
            ctx.heap().type_name(value)
        ))
    })
}

fn sin(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::float(number_arg(ctx, "sin", args[0])?.sin()))
}

fn cos(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::float(number_arg(ctx, "cos", args[0])?.cos()))
}

fn sqrt(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::float(number_arg(ctx, "sqrt", args[0])?.sqrt()))
}
