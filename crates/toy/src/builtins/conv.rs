//! Explicit conversions: type values are callable and construct/convert.
//!
//! A conversion that is *absent* (the type pair has no defined conversion)
//! is a type error; a conversion that is *defined but fails* (`int("abc")`)
//! is a conversion error. Callers can tell the two apart by kind.

use super::{ArgList, take1, take_between};
use crate::{
    error::{ErrorKind, RunError, RunResult},
    heap::{DropWithHeap, Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    types::{Array, Bytes, Str, Table, ToyIter, Tuple, Type},
    value::{self, Value},
};

/// Dispatches a call on a type value.
pub(crate) fn call_type<T: ResourceTracker>(
    ty: Type,
    heap: &mut Heap<T>,
    args: ArgList,
    interns: &Interns,
) -> RunResult<Value> {
    match ty {
        Type::Int => to_int(heap, args, interns),
        Type::Float => to_float(heap, args, interns),
        Type::Bool => to_bool(heap, args, interns),
        Type::Char => to_char(heap, args, interns),
        Type::String => to_string(heap, args, interns),
        Type::Bytes => to_bytes(heap, args, interns),
        Type::Tuple => to_tuple(heap, args),
        Type::Array => to_array(heap, args, interns),
        Type::Table => to_table(heap, args),
        other => {
            args.drop_with_heap(heap);
            Err(RunError::type_error(format!("type {other} is not constructible")))
        }
    }
}

fn conversion_absent<T: ResourceTracker>(heap: &mut Heap<T>, value: Value, target: Type) -> RunError {
    let from = value.type_of(heap);
    value.drop_with_heap(heap);
    RunError::type_error(format!("cannot convert {from} to {target}"))
}

fn to_int<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let value = take1(args, "int", heap)?;
    match &value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Char(c) => Ok(Value::Int(i64::from(u32::from(*c)))),
        Value::Float(f) => {
            if f.is_finite() && *f >= -(2f64.powi(63)) && *f < 2f64.powi(63) {
                Ok(Value::Int(f.trunc() as i64))
            } else {
                Err(RunError::conversion(format!("float {f} has no int representation")))
            }
        }
        _ => {
            if let Some(s) = value.as_str(heap, interns) {
                let parsed = parse_int(s.trim());
                value.drop_with_heap(heap);
                return parsed
                    .map(Value::Int)
                    .ok_or_else(|| RunError::conversion("invalid int literal"));
            }
            Err(conversion_absent(heap, value, Type::Int))
        }
    }
}

/// Parses an int with optional sign and radix prefix, `_` separators
/// allowed, matching source-literal syntax.
fn parse_int(s: &str) -> Option<i64> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let cleaned = body.replace('_', "");
    let (digits, radix) = if let Some(rest) = cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        (rest, 16)
    } else if let Some(rest) = cleaned.strip_prefix("0o").or_else(|| cleaned.strip_prefix("0O")) {
        (rest, 8)
    } else if let Some(rest) = cleaned.strip_prefix("0b").or_else(|| cleaned.strip_prefix("0B")) {
        (rest, 2)
    } else {
        (cleaned.as_str(), 10)
    };
    if digits.is_empty() {
        return None;
    }
    let magnitude = i64::from_str_radix(digits, radix).ok()?;
    if negative { magnitude.checked_neg() } else { Some(magnitude) }
}

fn to_float<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let value = take1(args, "float", heap)?;
    match &value {
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Bool(b) => Ok(Value::Float(f64::from(u8::from(*b)))),
        _ => {
            if let Some(s) = value.as_str(heap, interns) {
                let parsed = s.trim().replace('_', "").parse::<f64>().ok();
                value.drop_with_heap(heap);
                return parsed
                    .map(Value::Float)
                    .ok_or_else(|| RunError::conversion("invalid float literal"));
            }
            Err(conversion_absent(heap, value, Type::Float))
        }
    }
}

fn to_bool<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let value = take1(args, "bool", heap)?;
    let truthy = value.truthy(heap, interns);
    value.drop_with_heap(heap);
    Ok(Value::Bool(truthy))
}

fn to_char<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let value = take1(args, "char", heap)?;
    match &value {
        Value::Char(c) => Ok(Value::Char(*c)),
        Value::Int(i) => u32::try_from(*i)
            .ok()
            .and_then(char::from_u32)
            .map(Value::Char)
            .ok_or_else(|| RunError::conversion(format!("{i} is not a valid code point"))),
        _ => {
            if let Some(s) = value.as_str(heap, interns) {
                let mut chars = s.chars();
                let result = match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(Value::Char(c)),
                    _ => Err(RunError::conversion("char conversion needs a 1-char string")),
                };
                value.drop_with_heap(heap);
                return result;
            }
            Err(conversion_absent(heap, value, Type::Char))
        }
    }
}

fn to_string<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let value = take1(args, "string", heap)?;
    if matches!(value.type_of(heap), Type::String) {
        return Ok(value);
    }
    let rendered = value::fmt_display(&value, heap, interns);
    value.drop_with_heap(heap);
    let id = heap.allocate(HeapData::Str(Str::new(rendered)))?;
    Ok(Value::Ref(id))
}

fn to_bytes<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let value = take1(args, "bytes", heap)?;
    if let Some(s) = value.as_str(heap, interns) {
        let data = s.as_bytes().to_vec();
        value.drop_with_heap(heap);
        let id = heap.allocate(HeapData::Bytes(Bytes::new(data)))?;
        return Ok(Value::Ref(id));
    }
    match &value {
        Value::Int(n) => {
            let n = usize::try_from(*n).map_err(|_| RunError::conversion("bytes size must be non-negative"))?;
            let id = heap.allocate(HeapData::Bytes(Bytes::new(vec![0; n])))?;
            Ok(Value::Ref(id))
        }
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Bytes(b) => {
                let data = b.as_slice().to_vec();
                value.drop_with_heap(heap);
                let id = heap.allocate(HeapData::Bytes(Bytes::new(data)))?;
                Ok(Value::Ref(id))
            }
            HeapData::Array(a) => {
                let mut data = Vec::with_capacity(a.len());
                for elem in a.as_slice() {
                    match elem.as_int().and_then(|i| u8::try_from(i).ok()) {
                        Some(byte) => data.push(byte),
                        None => {
                            value.drop_with_heap(heap);
                            return Err(RunError::conversion("bytes elements must be ints in 0..=255"));
                        }
                    }
                }
                value.drop_with_heap(heap);
                let id = heap.allocate(HeapData::Bytes(Bytes::new(data)))?;
                Ok(Value::Ref(id))
            }
            _ => Err(conversion_absent(heap, value, Type::Bytes)),
        },
        _ => Err(conversion_absent(heap, value, Type::Bytes)),
    }
}

fn to_tuple<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "tuple", heap)?;
    match &value {
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Tuple(_) => Ok(value),
            HeapData::Array(a) => {
                let elems: Vec<Value> = a.as_slice().iter().map(Value::raw_copy).collect();
                let ids: Vec<_> = elems
                    .iter()
                    .filter_map(|v| match v {
                        Value::Ref(id) => Some(*id),
                        _ => None,
                    })
                    .collect();
                for id in ids {
                    heap.inc_ref(id);
                }
                let tuple = heap.allocate(HeapData::Tuple(Tuple::new(elems)))?;
                value.drop_with_heap(heap);
                Ok(Value::Ref(tuple))
            }
            _ => Err(conversion_absent(heap, value, Type::Tuple)),
        },
        _ => Err(conversion_absent(heap, value, Type::Tuple)),
    }
}

fn to_array<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let mut args = take_between(args, "array", 0, 1, heap)?;
    let Some(value) = args.pop() else {
        let id = heap.allocate(HeapData::Array(Array::new(Vec::new())))?;
        return Ok(Value::Ref(id));
    };
    // Any iterable collects into a fresh array.
    let mut iter = ToyIter::new(value, heap, interns)?;
    let mut elems = Vec::new();
    while let Some(elem) = iter.next_single(heap) {
        if let Err(err) = heap.tracker_mut().on_container_insert() {
            elem.drop_with_heap(heap);
            elems.drop_with_heap(heap);
            release_iter(heap, iter);
            return Err(err.into());
        }
        elems.push(elem);
    }
    release_iter(heap, iter);
    let id = heap.allocate(HeapData::Array(Array::new(elems)))?;
    Ok(Value::Ref(id))
}

/// Parks a transient iterator on the heap so the standard free path
/// releases its lock and target reference.
fn release_iter<T: ResourceTracker>(heap: &mut Heap<T>, iter: ToyIter) {
    if let Ok(id) = heap.allocate(HeapData::Iter(iter)) {
        heap.dec_ref(id);
    }
}

fn to_table<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let args = take_between(args, "table", 0, 0, heap)?;
    debug_assert!(args.is_empty());
    let id = heap.allocate(HeapData::Table(Table::new()))?;
    Ok(Value::Ref(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker)
    }

    fn one(v: Value) -> ArgList {
        [v].into_iter().collect()
    }

    #[test]
    fn int_conversions() {
        let mut heap = heap();
        let interns = Interns::default();
        assert_eq!(to_int(&mut heap, one(Value::Float(3.9)), &interns).unwrap(), Value::Int(3));
        assert_eq!(to_int(&mut heap, one(Value::Char('A')), &interns).unwrap(), Value::Int(65));
        assert_eq!(to_int(&mut heap, one(Value::Bool(true)), &interns).unwrap(), Value::Int(1));
    }

    #[test]
    fn int_parse_failure_is_conversion_error() {
        let mut heap = heap();
        let mut builder = crate::intern::InternerBuilder::new();
        let s = builder.intern("abc");
        let interns = builder.build();
        let err = to_int(&mut heap, one(Value::InternString(s)), &interns).unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::ConversionError);
    }

    #[test]
    fn absent_conversion_is_type_error() {
        let mut heap = heap();
        let interns = Interns::default();
        let err = to_int(&mut heap, one(Value::Nil), &interns).unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::TypeError);
    }

    #[test]
    fn string_conversion_renders_display() {
        let mut heap = heap();
        let interns = Interns::default();
        let result = to_string(&mut heap, one(Value::Int(42)), &interns).unwrap();
        assert_eq!(result.as_str(&heap, &interns), Some("42"));
        result.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn parse_int_radixes() {
        assert_eq!(parse_int("0x10"), Some(16));
        assert_eq!(parse_int("-0b101"), Some(-5));
        assert_eq!(parse_int("1_000"), Some(1000));
        assert_eq!(parse_int(""), None);
        assert_eq!(parse_int("0x"), None);
    }
}
