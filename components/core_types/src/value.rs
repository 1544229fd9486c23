//! NaN-boxed value representation.
//!
//! Every dynamic value fits in one 64-bit word. Floats are stored as their
//! raw IEEE-754 bits; everything else lives in negative quiet-NaN patterns
//! that no float constructor ever produces.
//!
//! | high 16 bits | kind           | payload                          |
//! |--------------|----------------|----------------------------------|
//! | `0xFFF9`     | integer        | 48-bit two's complement          |
//! | `0xFFFA`     | boolean        | bit 0                            |
//! | `0xFFFB`     | none           | ignored                          |
//! | `0xFFFC`     | heap reference | 32-bit arena handle              |
//! | other        | float          | raw bits                         |

use std::fmt;

use crate::heap::Handle;

/// Tag bits for integers.
pub const TAG_INT: u64 = 0xFFF9_0000_0000_0000;
/// Tag bits for booleans.
pub const TAG_BOOL: u64 = 0xFFFA_0000_0000_0000;
/// Tag bits for none.
pub const TAG_NONE: u64 = 0xFFFB_0000_0000_0000;
/// Tag bits for heap references.
pub const TAG_HEAP: u64 = 0xFFFC_0000_0000_0000;
/// Mask selecting the tag bits.
pub const TAG_MASK: u64 = 0xFFFF_0000_0000_0000;
/// Mask selecting the 48 payload bits.
pub const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
/// The only NaN a float value ever carries.
pub const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

/// Smallest representable integer.
pub const INT_MIN: i64 = -(1 << 47);
/// Largest representable integer.
pub const INT_MAX: i64 = (1 << 47) - 1;

/// Bits of `yes`.
pub const TRUE_BITS: u64 = TAG_BOOL | 1;
/// Bits of `no`.
pub const FALSE_BITS: u64 = TAG_BOOL;
/// Bits of `none`.
pub const NONE_BITS: u64 = TAG_NONE;

const TAG_INT_HI: u64 = TAG_INT >> 48;
const TAG_BOOL_HI: u64 = TAG_BOOL >> 48;
const TAG_NONE_HI: u64 = TAG_NONE >> 48;
const TAG_HEAP_HI: u64 = TAG_HEAP >> 48;

/// The closed set of value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueTag {
    /// 48-bit signed integer
    Int,
    /// IEEE-754 double
    Float,
    /// `yes` / `no`
    Bool,
    /// `none`
    None,
    /// Reference into the heap arena
    Heap,
}

/// A decoded value, for exhaustive matching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueKind {
    /// Integer payload
    Int(i64),
    /// Float payload
    Float(f64),
    /// Boolean payload
    Bool(bool),
    /// The none value
    None,
    /// Heap handle
    Heap(Handle),
}

/// One dynamic value.
///
/// `Value` is `Copy`; heap variants share the referenced object, so
/// mutation through one copy is visible through all of them.
///
/// Equality follows IEEE rules for floats, so `Value` is only
/// `PartialEq`. Use [`Value::same`] or [`Value::to_bits`] where a total,
/// hashable identity is needed.
///
/// # Examples
///
/// ```
/// use core_types::{Value, ValueKind};
///
/// let n = Value::int(42);
/// assert_eq!(n.kind(), ValueKind::Int(42));
///
/// let x = Value::float(3.5);
/// assert_eq!(x.as_float(), Some(3.5));
///
/// // Overflowing the integer range promotes to float.
/// let big = Value::from_i64(1 << 50);
/// assert!(big.is_float());
/// ```
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// The none value.
    pub const NONE: Value = Value(NONE_BITS);
    /// Boolean true.
    pub const TRUE: Value = Value(TRUE_BITS);
    /// Boolean false.
    pub const FALSE: Value = Value(FALSE_BITS);

    /// Encode a tag and payload.
    ///
    /// For `Int` the payload is the integer's two's complement bits (only
    /// the low 48 are kept), for `Float` the IEEE bits, for `Bool` zero or
    /// one, for `Heap` the handle index. Decoding yields the same pair for
    /// every legal payload.
    pub fn encode(tag: ValueTag, payload: u64) -> Value {
        match tag {
            ValueTag::Int => Value(TAG_INT | (payload & PAYLOAD_MASK)),
            ValueTag::Float => Value::float(f64::from_bits(payload)),
            ValueTag::Bool => Value(TAG_BOOL | (payload & 1)),
            ValueTag::None => Value::NONE,
            ValueTag::Heap => Value(TAG_HEAP | (payload & 0xFFFF_FFFF)),
        }
    }

    /// Decode into tag and payload. Total: any bit pattern decodes.
    pub fn decode(self) -> (ValueTag, u64) {
        match self.kind() {
            ValueKind::Int(i) => (ValueTag::Int, (i as u64) & PAYLOAD_MASK),
            ValueKind::Float(f) => (ValueTag::Float, f.to_bits()),
            ValueKind::Bool(b) => (ValueTag::Bool, b as u64),
            ValueKind::None => (ValueTag::None, 0),
            ValueKind::Heap(h) => (ValueTag::Heap, h.index() as u64),
        }
    }

    /// Integer value. The caller guarantees `INT_MIN..=INT_MAX`; use
    /// [`Value::from_i64`] when the result may overflow.
    #[inline]
    pub const fn int(i: i64) -> Value {
        Value(TAG_INT | ((i as u64) & PAYLOAD_MASK))
    }

    /// Integer when it fits, float otherwise.
    #[inline]
    pub fn from_i64(i: i64) -> Value {
        if fits_int(i) {
            Value::int(i)
        } else {
            Value::float(i as f64)
        }
    }

    /// Float value. NaNs are canonicalized.
    #[inline]
    pub fn float(f: f64) -> Value {
        if f.is_nan() {
            Value(CANONICAL_NAN)
        } else {
            Value(f.to_bits())
        }
    }

    /// Boolean value.
    #[inline]
    pub const fn bool(b: bool) -> Value {
        if b {
            Value::TRUE
        } else {
            Value::FALSE
        }
    }

    /// Reference to a heap object.
    #[inline]
    pub const fn heap(handle: Handle) -> Value {
        Value(TAG_HEAP | handle.index() as u64)
    }

    /// Raw bits.
    #[inline]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Reinterpret raw bits. Every pattern is a valid value.
    #[inline]
    pub const fn from_bits(bits: u64) -> Value {
        Value(bits)
    }

    /// Decoded view for exhaustive matching.
    #[inline]
    pub fn kind(self) -> ValueKind {
        match self.0 >> 48 {
            TAG_INT_HI => ValueKind::Int(((self.0 << 16) as i64) >> 16),
            TAG_BOOL_HI => ValueKind::Bool(self.0 & 1 != 0),
            TAG_NONE_HI => ValueKind::None,
            TAG_HEAP_HI => ValueKind::Heap(Handle::new((self.0 & 0xFFFF_FFFF) as u32)),
            _ => ValueKind::Float(f64::from_bits(self.0)),
        }
    }

    /// The value's tag.
    #[inline]
    pub fn tag(self) -> ValueTag {
        match self.0 >> 48 {
            TAG_INT_HI => ValueTag::Int,
            TAG_BOOL_HI => ValueTag::Bool,
            TAG_NONE_HI => ValueTag::None,
            TAG_HEAP_HI => ValueTag::Heap,
            _ => ValueTag::Float,
        }
    }

    #[inline]
    pub fn is_int(self) -> bool {
        self.0 >> 48 == TAG_INT_HI
    }

    #[inline]
    pub fn is_float(self) -> bool {
        self.tag() == ValueTag::Float
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 >> 48 == TAG_NONE_HI
    }

    #[inline]
    pub fn is_heap(self) -> bool {
        self.0 >> 48 == TAG_HEAP_HI
    }

    /// Integer payload, if this is an integer.
    #[inline]
    pub fn as_int(self) -> Option<i64> {
        match self.kind() {
            ValueKind::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Float payload, if this is a float.
    #[inline]
    pub fn as_float(self) -> Option<f64> {
        match self.kind() {
            ValueKind::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Numeric value as a double, for integers and floats.
    #[inline]
    pub fn as_number(self) -> Option<f64> {
        match self.kind() {
            ValueKind::Int(i) => Some(i as f64),
            ValueKind::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Boolean payload, if this is a boolean.
    #[inline]
    pub fn as_bool(self) -> Option<bool> {
        match self.kind() {
            ValueKind::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Heap handle, if this is a heap reference.
    #[inline]
    pub fn as_handle(self) -> Option<Handle> {
        match self.kind() {
            ValueKind::Heap(h) => Some(h),
            _ => None,
        }
    }

    /// Identity comparison: identical bits.
    #[inline]
    pub fn same(self, other: Value) -> bool {
        self.0 == other.0
    }
}

/// Whether an `i64` is inside the integer range.
#[inline]
pub const fn fits_int(i: i64) -> bool {
    i >= INT_MIN && i <= INT_MAX
}

impl PartialEq for Value {
    /// By value for numbers, booleans and none (IEEE rules for floats),
    /// by identity for heap references. No cross-kind numeric coercion.
    fn eq(&self, other: &Value) -> bool {
        match (self.kind(), other.kind()) {
            (ValueKind::Float(a), ValueKind::Float(b)) => a == b,
            _ => self.0 == other.0,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NONE
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ValueKind::Int(i) => f.debug_tuple("Int").field(&i).finish(),
            ValueKind::Float(x) => f.debug_tuple("Float").field(&x).finish(),
            ValueKind::Bool(b) => f.debug_tuple("Bool").field(&b).finish(),
            ValueKind::None => write!(f, "None"),
            ValueKind::Heap(h) => f.debug_tuple("Heap").field(&h.index()).finish(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::float(f)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::from_i64(i)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::heap(h)
    }
}
