//! Heap arena for strings, lists, maps and callables.
//!
//! Objects are addressed by [`Handle`] and live as long as the heap that
//! allocated them. Every [`Value`] holding a handle shares the object, so
//! mutation through one alias is visible through all of them.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::value::{Value, ValueKind};

/// Index of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Wrap a raw arena index.
    pub const fn new(index: u32) -> Self {
        Handle(index)
    }

    /// The arena index.
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Index of a function prototype inside a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(pub u32);

impl FunctionId {
    /// Position in the program's function table.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A bytecode function paired with its captured values.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    /// Prototype to execute
    pub function: FunctionId,
    /// Values captured when the closure was created
    pub captures: Vec<Value>,
}

/// Accepted argument counts of a native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly this many
    Exact(usize),
    /// Anywhere in the inclusive range
    Range(usize, usize),
}

impl Arity {
    /// Whether `n` arguments are accepted.
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::Range(lo, hi) => (lo..=hi).contains(&n),
        }
    }
}

/// What a native function sees of the runtime.
pub trait NativeContext {
    /// Shared heap access.
    fn heap(&self) -> &Heap;
    /// Mutable heap access.
    fn heap_mut(&mut self) -> &mut Heap;
    /// Write one line to the program's output sink.
    fn write_line(&mut self, line: &str);
}

/// Native calling convention: a value list in, a value or a catchable
/// error out.
pub type NativeFn = fn(&mut dyn NativeContext, &[Value]) -> Result<Value, RuntimeError>;

/// A function implemented in Rust.
#[derive(Clone)]
pub struct NativeFunction {
    /// Name used in messages
    pub name: &'static str,
    /// Accepted argument counts
    pub arity: Arity,
    /// Implementation
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Maps with more keys than this leave the shape tree and index their
/// keys themselves.
pub const MAX_SHAPED_KEYS: usize = 32;

/// Layout of a map: its keys in insertion order.
///
/// Maps that gained the same keys in the same order share a shape, and a
/// key keeps its slot for the life of the map, so a slot resolved for a
/// shape stays valid for every map of that shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(u32);

impl ShapeId {
    /// Shape of a map without keys
    pub const EMPTY: ShapeId = ShapeId(0);

    /// Position in the shape table.
    pub const fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Default)]
struct Shape {
    keys: Vec<String>,
    slots: HashMap<String, u32>,
    transitions: HashMap<String, ShapeId>,
}

/// Every shape created so far, linked by key-addition transitions.
#[derive(Debug)]
pub struct ShapeTable {
    shapes: Vec<Shape>,
}

impl Default for ShapeTable {
    fn default() -> Self {
        Self {
            shapes: vec![Shape::default()],
        }
    }
}

impl ShapeTable {
    /// Slot of `key` in maps of `shape`.
    pub fn slot(&self, shape: ShapeId, key: &str) -> Option<u32> {
        self.shapes[shape.0 as usize].slots.get(key).copied()
    }

    /// Keys of `shape` in slot order.
    pub fn keys(&self, shape: ShapeId) -> &[String] {
        &self.shapes[shape.0 as usize].keys
    }

    /// Number of shapes, the empty one included.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Always false; the empty shape exists from the start.
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Shape reached from `shape` by adding `key`.
    fn with_key(&mut self, shape: ShapeId, key: &str) -> ShapeId {
        let from = shape.0 as usize;
        if let Some(&next) = self.shapes[from].transitions.get(key) {
            return next;
        }
        let next = ShapeId(self.shapes.len() as u32);
        let mut keys = self.shapes[from].keys.clone();
        let mut slots = self.shapes[from].slots.clone();
        slots.insert(key.to_string(), keys.len() as u32);
        keys.push(key.to_string());
        self.shapes.push(Shape {
            keys,
            slots,
            transitions: HashMap::new(),
        });
        self.shapes[from].transitions.insert(key.to_string(), next);
        next
    }
}

#[derive(Debug, Clone)]
enum MapKeys {
    Shaped(ShapeId),
    Dictionary {
        keys: Vec<String>,
        slots: HashMap<String, u32>,
    },
}

/// String-keyed mapping.
///
/// Values live in slots; which key owns which slot is described by the
/// map's shape, or by its own index once it has more than
/// [`MAX_SHAPED_KEYS`] keys. Keys are never removed.
#[derive(Debug, Clone)]
pub struct MapObject {
    keys: MapKeys,
    values: Vec<Value>,
}

impl Default for MapObject {
    fn default() -> Self {
        Self {
            keys: MapKeys::Shaped(ShapeId::EMPTY),
            values: Vec::new(),
        }
    }
}

impl MapObject {
    /// Number of entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the map has no entries
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Shape, unless the map indexes its own keys
    pub fn shape(&self) -> Option<ShapeId> {
        match &self.keys {
            MapKeys::Shaped(shape) => Some(*shape),
            MapKeys::Dictionary { .. } => None,
        }
    }

    /// Value in `slot`
    pub fn slot_value(&self, slot: u32) -> Option<Value> {
        self.values.get(slot as usize).copied()
    }

    fn slot(&self, shapes: &ShapeTable, key: &str) -> Option<u32> {
        match &self.keys {
            MapKeys::Shaped(shape) => shapes.slot(*shape, key),
            MapKeys::Dictionary { slots, .. } => slots.get(key).copied(),
        }
    }

    fn keys<'a>(&'a self, shapes: &'a ShapeTable) -> &'a [String] {
        match &self.keys {
            MapKeys::Shaped(shape) => shapes.keys(*shape),
            MapKeys::Dictionary { keys, .. } => keys,
        }
    }

    fn get(&self, shapes: &ShapeTable, key: &str) -> Option<Value> {
        self.slot(shapes, key).and_then(|slot| self.slot_value(slot))
    }

    fn insert(&mut self, shapes: &mut ShapeTable, key: &str, value: Value) {
        if let Some(slot) = self.slot(shapes, key) {
            self.values[slot as usize] = value;
            return;
        }
        let full = self.values.len() >= MAX_SHAPED_KEYS;
        let outgrown = match &mut self.keys {
            MapKeys::Shaped(shape) if !full => {
                *shape = shapes.with_key(*shape, key);
                None
            }
            MapKeys::Shaped(shape) => Some(shapes.keys(*shape).to_vec()),
            MapKeys::Dictionary { keys, slots } => {
                slots.insert(key.to_string(), keys.len() as u32);
                keys.push(key.to_string());
                None
            }
        };
        if let Some(mut keys) = outgrown {
            keys.push(key.to_string());
            let slots = keys
                .iter()
                .enumerate()
                .map(|(slot, key)| (key.clone(), slot as u32))
                .collect();
            self.keys = MapKeys::Dictionary { keys, slots };
        }
        self.values.push(value);
    }
}

/// Object stored in the heap.
#[derive(Debug, Clone)]
pub enum HeapObject {
    /// Immutable text
    String(String),
    /// Growable, mutable sequence
    List(Vec<Value>),
    /// String-keyed mapping, displayed in key order
    Map(MapObject),
    /// Bytecode function with captures
    Closure(Closure),
    /// Builtin
    NativeFunction(NativeFunction),
}

impl HeapObject {
    /// Type name shown to programs.
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapObject::String(_) => "string",
            HeapObject::List(_) => "list",
            HeapObject::Map(_) => "map",
            HeapObject::Closure(_) | HeapObject::NativeFunction(_) => "function",
        }
    }
}

/// Arena of heap objects.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    shapes: ShapeTable,
}

impl Heap {
    /// Empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object and return its handle.
    pub fn alloc(&mut self, object: HeapObject) -> Handle {
        let index = self.objects.len() as u32;
        self.objects.push(object);
        Handle::new(index)
    }

    /// Allocate and wrap in a value.
    pub fn alloc_value(&mut self, object: HeapObject) -> Value {
        Value::heap(self.alloc(object))
    }

    /// Allocate a string value.
    pub fn string(&mut self, text: impl Into<String>) -> Value {
        self.alloc_value(HeapObject::String(text.into()))
    }

    /// Allocate a list value.
    pub fn list(&mut self, items: Vec<Value>) -> Value {
        self.alloc_value(HeapObject::List(items))
    }

    /// Allocate a map; a repeated key keeps its last value.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_types::{Heap, Value};
    ///
    /// let mut heap = Heap::new();
    /// let a = heap.map([("x".to_string(), Value::int(1)), ("y".to_string(), Value::int(2))]);
    /// let b = heap.map([("x".to_string(), Value::int(3)), ("y".to_string(), Value::int(4))]);
    /// assert_eq!(heap.shape_of(a), heap.shape_of(b));
    /// assert_eq!(heap.map_get(b, "y"), Some(Value::int(4)));
    /// ```
    pub fn map(&mut self, entries: impl IntoIterator<Item = (String, Value)>) -> Value {
        let mut map = MapObject::default();
        for (key, value) in entries {
            map.insert(&mut self.shapes, &key, value);
        }
        self.alloc_value(HeapObject::Map(map))
    }

    /// Value of `key` in a map; `None` for a missing key or a non-map.
    pub fn map_get(&self, map: Value, key: &str) -> Option<Value> {
        match self.object(map) {
            Some(HeapObject::Map(entries)) => entries.get(&self.shapes, key),
            _ => None,
        }
    }

    /// Store `key` in a map; returns false if `map` is not a map.
    pub fn map_insert(&mut self, map: Value, key: &str, value: Value) -> bool {
        let Some(handle) = map.as_handle() else {
            return false;
        };
        match &mut self.objects[handle.index() as usize] {
            HeapObject::Map(entries) => {
                entries.insert(&mut self.shapes, key, value);
                true
            }
            _ => false,
        }
    }

    /// Entries of a map in key order.
    pub fn map_entries<'a>(&'a self, map: &'a MapObject) -> Vec<(&'a str, Value)> {
        let mut entries: Vec<_> = map
            .keys(&self.shapes)
            .iter()
            .map(String::as_str)
            .zip(map.values.iter().copied())
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Shape of a shaped map
    pub fn shape_of(&self, value: Value) -> Option<ShapeId> {
        match self.object(value) {
            Some(HeapObject::Map(map)) => map.shape(),
            _ => None,
        }
    }

    /// Value in `slot` of a map
    pub fn map_slot(&self, map: Value, slot: u32) -> Option<Value> {
        match self.object(map) {
            Some(HeapObject::Map(entries)) => entries.slot_value(slot),
            _ => None,
        }
    }

    /// Overwrite an existing slot of a map; returns false if there is none.
    pub fn set_map_slot(&mut self, map: Value, slot: u32, value: Value) -> bool {
        let Some(handle) = map.as_handle() else {
            return false;
        };
        match self.get_mut(handle) {
            HeapObject::Map(entries) => match entries.values.get_mut(slot as usize) {
                Some(stored) => {
                    *stored = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    /// Shapes created so far
    pub fn shapes(&self) -> &ShapeTable {
        &self.shapes
    }

    /// Object behind a handle.
    ///
    /// # Panics
    ///
    /// A handle is only produced by this heap, so an unknown handle is a
    /// corrupted value and aborts.
    pub fn get(&self, handle: Handle) -> &HeapObject {
        &self.objects[handle.index() as usize]
    }

    /// Mutable object behind a handle.
    pub fn get_mut(&mut self, handle: Handle) -> &mut HeapObject {
        &mut self.objects[handle.index() as usize]
    }

    /// Object referenced by a value, if it is a heap reference.
    pub fn object(&self, value: Value) -> Option<&HeapObject> {
        value.as_handle().map(|h| self.get(h))
    }

    /// String contents, if the value references a string.
    pub fn as_str(&self, value: Value) -> Option<&str> {
        match self.object(value) {
            Some(HeapObject::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing was allocated yet.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Type name shown to programs.
    pub fn type_name(&self, value: Value) -> &'static str {
        match value.kind() {
            ValueKind::Int(_) => "integer",
            ValueKind::Float(_) => "float",
            ValueKind::Bool(_) => "boolean",
            ValueKind::None => "none",
            ValueKind::Heap(h) => self.get(h).type_name(),
        }
    }

    /// Truthiness: zero, empty containers, `no` and `none` are false.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_types::{Heap, Value};
    ///
    /// let mut heap = Heap::new();
    /// let empty = heap.list(vec![]);
    /// assert!(!heap.is_truthy(empty));
    /// assert!(heap.is_truthy(Value::int(7)));
    /// assert!(!heap.is_truthy(Value::float(0.0)));
    /// ```
    pub fn is_truthy(&self, value: Value) -> bool {
        match value.kind() {
            ValueKind::Int(i) => i != 0,
            ValueKind::Float(f) => f != 0.0,
            ValueKind::Bool(b) => b,
            ValueKind::None => false,
            ValueKind::Heap(h) => match self.get(h) {
                HeapObject::String(s) => !s.is_empty(),
                HeapObject::List(items) => !items.is_empty(),
                HeapObject::Map(entries) => !entries.is_empty(),
                HeapObject::Closure(_) | HeapObject::NativeFunction(_) => true,
            },
        }
    }

    /// Render a value the way `say` prints it.
    pub fn display(&self, value: Value) -> String {
        let mut out = String::new();
        let mut visiting = Vec::new();
        self.render(value, &mut out, &mut visiting);
        out
    }

    fn render(&self, value: Value, out: &mut String, visiting: &mut Vec<Handle>) {
        match value.kind() {
            ValueKind::Int(i) => {
                let _ = write!(out, "{i}");
            }
            ValueKind::Float(f) => out.push_str(&format_float(f)),
            ValueKind::Bool(b) => out.push_str(if b { "yes" } else { "no" }),
            ValueKind::None => out.push_str("none"),
            ValueKind::Heap(h) => {
                if visiting.contains(&h) {
                    out.push_str(match self.get(h) {
                        HeapObject::Map(_) => "{...}",
                        _ => "[...]",
                    });
                    return;
                }
                match self.get(h) {
                    HeapObject::String(s) => out.push_str(s),
                    HeapObject::List(items) => {
                        visiting.push(h);
                        out.push('[');
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                out.push_str(", ");
                            }
                            self.render(*item, out, visiting);
                        }
                        out.push(']');
                        visiting.pop();
                    }
                    HeapObject::Map(map) => {
                        visiting.push(h);
                        out.push('{');
                        for (i, (key, item)) in self.map_entries(map).into_iter().enumerate() {
                            if i > 0 {
                                out.push_str(", ");
                            }
                            let _ = write!(out, "\"{key}\": ");
                            self.render(item, out, visiting);
                        }
                        out.push('}');
                        visiting.pop();
                    }
                    HeapObject::Closure(_) => out.push_str("<function>"),
                    HeapObject::NativeFunction(n) => {
                        let _ = write!(out, "<function {}>", n.name);
                    }
                }
            }
        }
    }
}

/// Six fractional digits, like C's `%f`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        format!("{f:.6}")
    }
}
