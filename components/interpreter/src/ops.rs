//! Operator semantics
//!
//! One implementation serves both tiers: the interpreter loop calls these
//! directly and the JIT's runtime helpers call them for every operation its
//! fast paths do not cover, so results and error messages never depend on
//! which tier ran the code.

use bytecode_system::Opcode;
use core_types::{ErrorKind, Heap, HeapObject, RuntimeError, Value, ValueKind};

/// Binary operators, in the order of their helper codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `^`
    Pow,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `is`
    Is,
}

const ALL_BINARY: [BinaryOp; 13] = [
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::Div,
    BinaryOp::Mod,
    BinaryOp::Pow,
    BinaryOp::Eq,
    BinaryOp::Ne,
    BinaryOp::Lt,
    BinaryOp::Le,
    BinaryOp::Gt,
    BinaryOp::Ge,
    BinaryOp::Is,
];

impl BinaryOp {
    /// Operator of a binary opcode
    pub fn from_opcode(opcode: &Opcode) -> Option<Self> {
        Some(match opcode {
            Opcode::Add => BinaryOp::Add,
            Opcode::Sub => BinaryOp::Sub,
            Opcode::Mul => BinaryOp::Mul,
            Opcode::Div => BinaryOp::Div,
            Opcode::Mod => BinaryOp::Mod,
            Opcode::Pow => BinaryOp::Pow,
            Opcode::Eq => BinaryOp::Eq,
            Opcode::Ne => BinaryOp::Ne,
            Opcode::Lt => BinaryOp::Lt,
            Opcode::Le => BinaryOp::Le,
            Opcode::Gt => BinaryOp::Gt,
            Opcode::Ge => BinaryOp::Ge,
            Opcode::Is => BinaryOp::Is,
            _ => return None,
        })
    }

    /// Numeric code passed across the native helper boundary
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Inverse of [`BinaryOp::code`]
    pub fn from_code(code: u32) -> Option<Self> {
        ALL_BINARY.get(code as usize).copied()
    }

    /// Source-level spelling
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Is => "is",
        }
    }

    /// Whether the result is always a boolean
    pub fn is_comparison(self) -> bool {
        !matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::Mod
                | BinaryOp::Pow
        )
    }
}

fn unsupported(heap: &Heap, op: BinaryOp, a: Value, b: Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "Unsupported operand types for '{}': {}, {}",
        op.symbol(),
        heap.type_name(a),
        heap.type_name(b)
    ))
}

/// Apply a binary operator.
///
/// # Examples
///
/// ```
/// use core_types::{Heap, Value};
/// use interpreter::ops::{binary, BinaryOp};
///
/// let mut heap = Heap::new();
/// let sum = binary(&mut heap, BinaryOp::Add, Value::int(2), Value::float(0.5)).unwrap();
/// assert_eq!(sum, Value::float(2.5));
/// ```
pub fn binary(heap: &mut Heap, op: BinaryOp, a: Value, b: Value) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Eq => Ok(Value::bool(equals(heap, a, b))),
        BinaryOp::Ne => Ok(Value::bool(!equals(heap, a, b))),
        BinaryOp::Is => Ok(Value::bool(a.same(b))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(heap, op, a, b),
        BinaryOp::Add if heap.as_str(a).is_some() || heap.as_str(b).is_some() => {
            let text = heap.display(a) + &heap.display(b);
            Ok(heap.string(text))
        }
        _ => arithmetic(heap, op, a, b),
    }
}

fn arithmetic(heap: &Heap, op: BinaryOp, a: Value, b: Value) -> Result<Value, RuntimeError> {
    if let (ValueKind::Int(x), ValueKind::Int(y)) = (a.kind(), b.kind()) {
        return int_arithmetic(op, x, y);
    }
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => float_arithmetic(op, x, y),
        _ => Err(unsupported(heap, op, a, b)),
    }
}

fn division_by_zero() -> RuntimeError {
    RuntimeError::new(ErrorKind::ZeroDivisionError, "Division by zero.")
}

fn modulo_by_zero() -> RuntimeError {
    RuntimeError::new(ErrorKind::ZeroDivisionError, "Modulo by zero.")
}

/// Integer arithmetic; results leaving the 48-bit range become floats.
pub fn int_arithmetic(op: BinaryOp, x: i64, y: i64) -> Result<Value, RuntimeError> {
    Ok(match op {
        BinaryOp::Add => Value::from_i64(x + y),
        BinaryOp::Sub => Value::from_i64(x - y),
        BinaryOp::Mul => match x.checked_mul(y) {
            Some(product) => Value::from_i64(product),
            None => Value::float(x as f64 * y as f64),
        },
        BinaryOp::Div => {
            if y == 0 {
                return Err(division_by_zero());
            }
            Value::float(x as f64 / y as f64)
        }
        BinaryOp::Mod => {
            if y == 0 {
                return Err(modulo_by_zero());
            }
            Value::int(x % y)
        }
        BinaryOp::Pow => Value::float((x as f64).powf(y as f64)),
        _ => return float_arithmetic(op, x as f64, y as f64),
    })
}

/// Float arithmetic, also used for mixed operands.
pub fn float_arithmetic(op: BinaryOp, x: f64, y: f64) -> Result<Value, RuntimeError> {
    Ok(match op {
        BinaryOp::Add => Value::float(x + y),
        BinaryOp::Sub => Value::float(x - y),
        BinaryOp::Mul => Value::float(x * y),
        BinaryOp::Div => {
            if y == 0.0 {
                return Err(division_by_zero());
            }
            Value::float(x / y)
        }
        BinaryOp::Mod => {
            if y == 0.0 {
                return Err(modulo_by_zero());
            }
            Value::float(x % y)
        }
        BinaryOp::Pow => Value::float(x.powf(y)),
        BinaryOp::Eq => Value::bool(x == y),
        BinaryOp::Ne => Value::bool(x != y),
        BinaryOp::Lt => Value::bool(x < y),
        BinaryOp::Le => Value::bool(x <= y),
        BinaryOp::Gt => Value::bool(x > y),
        BinaryOp::Ge => Value::bool(x >= y),
        BinaryOp::Is => Value::bool(x.to_bits() == y.to_bits()),
    })
}

/// Language-level equality: numbers across kinds, strings by content,
/// other heap objects by identity.
pub fn equals(heap: &Heap, a: Value, b: Value) -> bool {
    match (a.kind(), b.kind()) {
        (ValueKind::Int(x), ValueKind::Int(y)) => x == y,
        (ValueKind::Bool(x), ValueKind::Bool(y)) => x == y,
        (ValueKind::None, ValueKind::None) => true,
        (ValueKind::Heap(x), ValueKind::Heap(y)) => {
            x == y
                || matches!(
                    (heap.get(x), heap.get(y)),
                    (HeapObject::String(s), HeapObject::String(t)) if s == t
                )
        }
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn compare(heap: &Heap, op: BinaryOp, a: Value, b: Value) -> Result<Value, RuntimeError> {
    let ordering = match (a.kind(), b.kind()) {
        (ValueKind::Int(x), ValueKind::Int(y)) => Some(x.cmp(&y)),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => match (heap.as_str(a), heap.as_str(b)) {
                (Some(s), Some(t)) => Some(s.cmp(t)),
                _ => return Err(unsupported(heap, op, a, b)),
            },
        },
    };
    // NaN compares false under every ordering operator
    let result = ordering.is_some_and(|o| match op {
        BinaryOp::Lt => o.is_lt(),
        BinaryOp::Le => o.is_le(),
        BinaryOp::Gt => o.is_gt(),
        _ => o.is_ge(),
    });
    Ok(Value::bool(result))
}

/// Unary minus
pub fn negate(heap: &Heap, value: Value) -> Result<Value, RuntimeError> {
    match value.kind() {
        ValueKind::Int(i) => Ok(Value::from_i64(-i)),
        ValueKind::Float(f) => Ok(Value::float(-f)),
        _ => Err(RuntimeError::type_error(format!(
            "Unsupported operand type for unary '-': {}",
            heap.type_name(value)
        ))),
    }
}

/// Logical not
pub fn not(heap: &Heap, value: Value) -> Value {
    Value::bool(!heap.is_truthy(value))
}

fn list_position(index: i64, len: usize) -> Option<usize> {
    usize::try_from(index).ok().filter(|&i| i < len)
}

fn index_out_of_range() -> RuntimeError {
    RuntimeError::new(ErrorKind::IndexError, "Index out of range.")
}

fn invalid_index() -> RuntimeError {
    RuntimeError::type_error("Invalid index operation.")
}

/// `container[index]`
pub fn get_index(heap: &mut Heap, container: Value, index: Value) -> Result<Value, RuntimeError> {
    let Some(handle) = container.as_handle() else {
        return Err(invalid_index());
    };
    match (heap.get(handle), index.kind()) {
        (HeapObject::List(items), ValueKind::Int(i)) => list_position(i, items.len())
            .map(|i| items[i])
            .ok_or_else(index_out_of_range),
        (HeapObject::String(text), ValueKind::Int(i)) => {
            let ch = usize::try_from(i)
                .ok()
                .and_then(|i| text.chars().nth(i))
                .ok_or_else(index_out_of_range)?;
            Ok(heap.string(ch.to_string()))
        }
        (HeapObject::Map(_), ValueKind::Heap(_)) => {
            let key = heap.as_str(index).ok_or_else(invalid_index)?;
            heap.map_get(container, key).ok_or_else(|| {
                RuntimeError::new(ErrorKind::KeyError, format!("Key not found: {key}"))
            })
        }
        _ => Err(invalid_index()),
    }
}

/// `container[index] = value`; the store is visible through every alias.
pub fn set_index(
    heap: &mut Heap,
    container: Value,
    index: Value,
    value: Value,
) -> Result<(), RuntimeError> {
    let invalid = || RuntimeError::type_error("Invalid index type for assignment.");
    let Some(handle) = container.as_handle() else {
        return Err(invalid());
    };
    if let Some(key) = heap.as_str(index).map(str::to_owned) {
        if heap.map_insert(container, &key, value) {
            return Ok(());
        }
    }
    match (heap.get_mut(handle), index.kind()) {
        (HeapObject::List(items), ValueKind::Int(i)) => {
            let slot = list_position(i, items.len())
                .ok_or_else(|| RuntimeError::new(ErrorKind::IndexError, "List index out of range."))?;
            items[slot] = value;
            Ok(())
        }
        _ => Err(invalid()),
    }
}

/// `object.name`
pub fn get_field(heap: &Heap, object: Value, name: &str) -> Result<Value, RuntimeError> {
    match heap.object(object) {
        Some(HeapObject::Map(_)) => heap.map_get(object, name).ok_or_else(|| {
            RuntimeError::new(ErrorKind::KeyError, format!("Map has no key '{name}'"))
        }),
        _ => Err(RuntimeError::type_error(format!(
            "Cannot get attribute '{name}' from type {}",
            heap.type_name(object)
        ))),
    }
}

/// `object.name = value`
pub fn set_field(heap: &mut Heap, object: Value, name: &str, value: Value) -> Result<(), RuntimeError> {
    if heap.map_insert(object, name, value) {
        return Ok(());
    }
    Err(RuntimeError::type_error(format!(
        "Cannot set attribute '{name}' on type {}",
        heap.type_name(object)
    )))
}

/// Build a map from alternating key/value operands
pub fn build_map(heap: &mut Heap, pairs: &[Value]) -> Result<Value, RuntimeError> {
    let entries = pairs
        .chunks_exact(2)
        .map(|pair| {
            heap.as_str(pair[0])
                .map(|key| (key.to_string(), pair[1]))
                .ok_or_else(|| RuntimeError::type_error("Map keys must be strings."))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(heap.map(entries))
}
