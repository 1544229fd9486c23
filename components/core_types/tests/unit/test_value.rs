//! Unit tests for the NaN-boxed value encoding

use core_types::value::{INT_MAX, INT_MIN};
use core_types::{Handle, Value, ValueKind, ValueTag};
use proptest::prelude::*;

proptest! {
    #[test]
    fn test_int_round_trip(i in INT_MIN..=INT_MAX) {
        let (tag, payload) = Value::int(i).decode();
        prop_assert_eq!(tag, ValueTag::Int);
        prop_assert_eq!(Value::encode(tag, payload).kind(), ValueKind::Int(i));
        prop_assert_eq!(Value::encode(tag, payload).decode(), (tag, payload));
    }

    #[test]
    fn test_float_round_trip(f in any::<f64>().prop_filter("canonical", |f| !f.is_nan())) {
        let v = Value::float(f);
        let (tag, payload) = v.decode();
        prop_assert_eq!(tag, ValueTag::Float);
        prop_assert_eq!(payload, f.to_bits());
        prop_assert_eq!(Value::encode(tag, payload).to_bits(), v.to_bits());
    }

    #[test]
    fn test_handle_round_trip(index in any::<u32>()) {
        let v = Value::heap(Handle::new(index));
        prop_assert_eq!(v.decode(), (ValueTag::Heap, index as u64));
        prop_assert_eq!(v.as_handle(), Some(Handle::new(index)));
    }

    #[test]
    fn test_decoding_is_total(bits in any::<u64>()) {
        // Every pattern lands in exactly one kind and re-encodes to a
        // value of that kind.
        let v = Value::from_bits(bits);
        let (tag, payload) = v.decode();
        prop_assert_eq!(Value::encode(tag, payload).tag(), tag);
    }

    #[test]
    fn test_from_i64_never_loses_magnitude(i in any::<i64>()) {
        let v = Value::from_i64(i);
        match v.kind() {
            ValueKind::Int(n) => prop_assert_eq!(n, i),
            ValueKind::Float(f) => prop_assert_eq!(f, i as f64),
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }
}

#[test]
fn test_bool_and_none_round_trip() {
    for b in [false, true] {
        let (tag, payload) = Value::bool(b).decode();
        assert_eq!(tag, ValueTag::Bool);
        assert_eq!(Value::encode(tag, payload), Value::bool(b));
    }
    assert_eq!(Value::NONE.decode(), (ValueTag::None, 0));
    assert!(Value::encode(ValueTag::None, 0).is_none());
}

#[test]
fn test_nan_never_collides_with_tags() {
    let v = Value::float(f64::NAN);
    assert_eq!(v.tag(), ValueTag::Float);
    let negative_nan = Value::float(-f64::NAN);
    assert_eq!(negative_nan.tag(), ValueTag::Float);
}
