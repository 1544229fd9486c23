//! Core value types shared by every part of the Levython engine.
//!
//! # Overview
//!
//! - [`Value`] - NaN-boxed dynamic value, one machine word
//! - [`Heap`] / [`HeapObject`] - arena of strings, lists, maps and callables
//! - [`ShapeId`] - shared key layout of maps, the key of field caches
//! - [`RuntimeError`] / [`ErrorKind`] - catchable runtime errors
//! - [`TraceFrame`] - one line of a traceback
//! - [`ProfileRecord`] - type feedback and counters for tiering
//!
//! # Examples
//!
//! ```
//! use core_types::{Heap, HeapObject, Value, ValueKind, ValueTag};
//!
//! let mut heap = Heap::new();
//! let list = heap.list(vec![Value::int(1), Value::float(2.5)]);
//! assert_eq!(list.tag(), ValueTag::Heap);
//! assert_eq!(heap.display(list), "[1, 2.500000]");
//!
//! let (tag, payload) = Value::int(-5).decode();
//! assert_eq!(Value::encode(tag, payload).kind(), ValueKind::Int(-5));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod error;
mod heap;
mod profile;
mod source;
pub mod value;

pub use error::{ErrorKind, RuntimeError};
pub use heap::{
    format_float, Arity, Closure, FunctionId, Handle, Heap, HeapObject, MapObject, NativeContext,
    NativeFn, NativeFunction, ShapeId, ShapeTable, MAX_SHAPED_KEYS,
};
pub use profile::{ProfileRecord, RegionId, RegionKind, SiteFeedback, TagSet, TypeTag};
pub use source::TraceFrame;
pub use value::{Value, ValueKind, ValueTag};
