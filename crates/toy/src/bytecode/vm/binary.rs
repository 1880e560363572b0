//! Binary and unary operator dispatch over the value model.
//!
//! The VM does not special-case operand pairs beyond the int/int and
//! float/float fast paths at the top of each arm; everything else reads
//! the tags and dispatches. Integer arithmetic wraps on overflow;
//! division and remainder by integer zero are errors; float division
//! follows IEEE.

use std::cmp::Ordering;

use crate::{
    bytecode::Opcode,
    error::{ErrorKind, RunError, RunResult},
    heap::{Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    types::{Array, Bytes, Str},
    value::{self, Value},
};

/// Applies a binary opcode to owned operands, producing an owned result.
pub(super) fn binary<T: ResourceTracker>(
    op: Opcode,
    left: Value,
    right: Value,
    heap: &mut Heap<T>,
    interns: &Interns,
) -> RunResult<Value> {
    match op {
        Opcode::CompareEq | Opcode::CompareNe => {
            let equal = value::value_eq(&left, &right, heap, interns);
            left.drop_with_heap(heap);
            right.drop_with_heap(heap);
            Ok(Value::Bool(if op == Opcode::CompareEq { equal } else { !equal }))
        }
        Opcode::CompareLt | Opcode::CompareLe | Opcode::CompareGt | Opcode::CompareGe => {
            let ordering = value::value_cmp(&left, &right, heap, interns);
            let result = ordering.map(|ord| match op {
                Opcode::CompareLt => ord == Ordering::Less,
                Opcode::CompareLe => ord != Ordering::Greater,
                Opcode::CompareGt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            });
            let outcome = match result {
                Some(b) => Ok(Value::Bool(b)),
                None => Err(unsupported(op, &left, &right, heap)),
            };
            left.drop_with_heap(heap);
            right.drop_with_heap(heap);
            outcome
        }
        Opcode::Contains => {
            let contained = value::value_contains(&right, &left, heap, interns);
            left.drop_with_heap(heap);
            right.drop_with_heap(heap);
            contained.map(Value::Bool)
        }
        Opcode::Add => add(left, right, heap, interns),
        Opcode::Sub => sub(left, right, heap),
        Opcode::Mul => numeric(op, left, right, heap, i64::wrapping_mul, |a, b| a * b),
        Opcode::Div => div(left, right, heap),
        Opcode::Rem => rem(left, right, heap),
        Opcode::BitAnd => int_bitwise(op, left, right, heap, |a, b| a & b),
        Opcode::BitOr => int_bitwise(op, left, right, heap, |a, b| a | b),
        Opcode::BitXor => int_bitwise(op, left, right, heap, |a, b| a ^ b),
        Opcode::Shl => shift(op, left, right, heap, true),
        Opcode::Shr => shift(op, left, right, heap, false),
        other => unreachable!("not a binary opcode: {other:?}"),
    }
}

/// Applies a unary opcode.
pub(super) fn unary<T: ResourceTracker>(
    op: Opcode,
    operand: Value,
    heap: &mut Heap<T>,
    interns: &Interns,
) -> RunResult<Value> {
    match op {
        Opcode::UnaryNot => {
            let truthy = operand.truthy(heap, interns);
            operand.drop_with_heap(heap);
            Ok(Value::Bool(!truthy))
        }
        Opcode::UnaryMinus => match operand {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(unsupported_unary("-", other, heap)),
        },
        Opcode::UnaryPlus => match operand {
            Value::Int(_) | Value::Float(_) => Ok(operand),
            other => Err(unsupported_unary("+", other, heap)),
        },
        Opcode::UnaryBitNot => match operand {
            Value::Int(i) => Ok(Value::Int(!i)),
            other => Err(unsupported_unary("^", other, heap)),
        },
        other => unreachable!("not a unary opcode: {other:?}"),
    }
}

fn unsupported<T: ResourceTracker>(op: Opcode, left: &Value, right: &Value, heap: &Heap<T>) -> RunError {
    RunError::type_error(format!(
        "operator {} is not defined for {} and {}",
        op_symbol(op),
        left.type_of(heap),
        right.type_of(heap)
    ))
}

fn unsupported_unary<T: ResourceTracker>(symbol: &str, operand: Value, heap: &mut Heap<T>) -> RunError {
    let type_name = operand.type_of(heap);
    operand.drop_with_heap(heap);
    RunError::type_error(format!("unary {symbol} is not defined for {type_name}"))
}

fn op_symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::Add => "+",
        Opcode::Sub => "-",
        Opcode::Mul => "*",
        Opcode::Div => "/",
        Opcode::Rem => "%",
        Opcode::BitAnd => "&",
        Opcode::BitOr => "|",
        Opcode::BitXor => "^",
        Opcode::Shl => "<<",
        Opcode::Shr => ">>",
        Opcode::CompareLt => "<",
        Opcode::CompareLe => "<=",
        Opcode::CompareGt => ">",
        Opcode::CompareGe => ">=",
        _ => "?",
    }
}

fn add<T: ResourceTracker>(left: Value, right: Value, heap: &mut Heap<T>, interns: &Interns) -> RunResult<Value> {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => return Ok(Value::Int(a.wrapping_add(*b))),
        (Value::Float(a), Value::Float(b)) => return Ok(Value::Float(a + b)),
        (Value::Int(a), Value::Float(b)) => return Ok(Value::Float(*a as f64 + b)),
        (Value::Float(a), Value::Int(b)) => return Ok(Value::Float(a + *b as f64)),
        (Value::Char(a), Value::Int(b)) => {
            let shifted = i64::from(u32::from(*a)).wrapping_add(*b);
            return u32::try_from(shifted)
                .ok()
                .and_then(char::from_u32)
                .map(Value::Char)
                .ok_or_else(|| RunError::value(format!("char + {b} is not a valid code point")));
        }
        (Value::Int(a), Value::Char(b)) => {
            let shifted = a.wrapping_add(i64::from(u32::from(*b)));
            return u32::try_from(shifted)
                .ok()
                .and_then(char::from_u32)
                .map(Value::Char)
                .ok_or_else(|| RunError::value("int + char is not a valid code point"));
        }
        (Value::Char(a), Value::Char(b)) => {
            let mut text = String::with_capacity(8);
            text.push(*a);
            text.push(*b);
            let id = heap.allocate(HeapData::Str(Str::new(text)))?;
            return Ok(Value::Ref(id));
        }
        _ => {}
    }

    // String concatenation (either representation), including char ends.
    let left_str = left.as_str(heap, interns).map(str::to_owned);
    let right_str = right.as_str(heap, interns).map(str::to_owned);
    let char_text = |v: &Value| match v {
        Value::Char(c) => Some(c.to_string()),
        _ => None,
    };
    if let (Some(a), Some(b)) = (
        left_str.clone().or_else(|| char_text(&left)),
        right_str.clone().or_else(|| char_text(&right)),
    ) && (left_str.is_some() || right_str.is_some())
    {
        left.drop_with_heap(heap);
        right.drop_with_heap(heap);
        let id = heap.allocate(HeapData::Str(Str::new(a + &b)))?;
        return Ok(Value::Ref(id));
    }

    // Array and bytes concatenation build fresh containers.
    if let (Value::Ref(a), Value::Ref(b)) = (&left, &right) {
        match (heap.get(*a), heap.get(*b)) {
            (HeapData::Array(x), HeapData::Array(y)) => {
                let mut elems: Vec<Value> = x.as_slice().iter().map(Value::raw_copy).collect();
                elems.extend(y.as_slice().iter().map(Value::raw_copy));
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
                let id = heap.allocate(HeapData::Array(Array::new(elems)))?;
                left.drop_with_heap(heap);
                right.drop_with_heap(heap);
                return Ok(Value::Ref(id));
            }
            (HeapData::Bytes(x), HeapData::Bytes(y)) => {
                let mut data = x.as_slice().to_vec();
                data.extend_from_slice(y.as_slice());
                let id = heap.allocate(HeapData::Bytes(Bytes::new(data)))?;
                left.drop_with_heap(heap);
                right.drop_with_heap(heap);
                return Ok(Value::Ref(id));
            }
            _ => {}
        }
    }

    let err = unsupported(Opcode::Add, &left, &right, heap);
    left.drop_with_heap(heap);
    right.drop_with_heap(heap);
    Err(err)
}

fn sub<T: ResourceTracker>(left: Value, right: Value, heap: &mut Heap<T>) -> RunResult<Value> {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 - b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a - *b as f64)),
        (Value::Char(a), Value::Char(b)) => Ok(Value::Int(i64::from(u32::from(*a)) - i64::from(u32::from(*b)))),
        (Value::Char(a), Value::Int(b)) => {
            let shifted = i64::from(u32::from(*a)).wrapping_sub(*b);
            u32::try_from(shifted)
                .ok()
                .and_then(char::from_u32)
                .map(Value::Char)
                .ok_or_else(|| RunError::value(format!("char - {b} is not a valid code point")))
        }
        _ => {
            let err = unsupported(Opcode::Sub, &left, &right, heap);
            left.drop_with_heap(heap);
            right.drop_with_heap(heap);
            Err(err)
        }
    }
}

fn numeric<T: ResourceTracker>(
    op: Opcode,
    left: Value,
    right: Value,
    heap: &mut Heap<T>,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> RunResult<Value> {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(*a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(*a, *b as f64))),
        _ => {
            let err = unsupported(op, &left, &right, heap);
            left.drop_with_heap(heap);
            right.drop_with_heap(heap);
            Err(err)
        }
    }
}

fn div<T: ResourceTracker>(left: Value, right: Value, heap: &mut Heap<T>) -> RunResult<Value> {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                return Err(RunError::new(ErrorKind::DivisionByZero, "integer division by zero"));
            }
            Ok(Value::Int(a.wrapping_div(*b)))
        }
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a / b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 / b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a / *b as f64)),
        _ => {
            let err = unsupported(Opcode::Div, &left, &right, heap);
            left.drop_with_heap(heap);
            right.drop_with_heap(heap);
            Err(err)
        }
    }
}

fn rem<T: ResourceTracker>(left: Value, right: Value, heap: &mut Heap<T>) -> RunResult<Value> {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b == 0 {
                return Err(RunError::new(ErrorKind::DivisionByZero, "integer remainder by zero"));
            }
            Ok(Value::Int(a.wrapping_rem(*b)))
        }
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a % b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 % b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a % *b as f64)),
        _ => {
            let err = unsupported(Opcode::Rem, &left, &right, heap);
            left.drop_with_heap(heap);
            right.drop_with_heap(heap);
            Err(err)
        }
    }
}

fn int_bitwise<T: ResourceTracker>(
    op: Opcode,
    left: Value,
    right: Value,
    heap: &mut Heap<T>,
    apply: fn(i64, i64) -> i64,
) -> RunResult<Value> {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(apply(*a, *b))),
        _ => {
            let err = unsupported(op, &left, &right, heap);
            left.drop_with_heap(heap);
            right.drop_with_heap(heap);
            Err(err)
        }
    }
}

fn shift<T: ResourceTracker>(
    op: Opcode,
    left: Value,
    right: Value,
    heap: &mut Heap<T>,
    shl: bool,
) -> RunResult<Value> {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b < 0 {
                return Err(RunError::value("negative shift amount"));
            }
            let result = match u32::try_from(*b) {
                Ok(amount) if amount < 64 => {
                    if shl {
                        a.wrapping_shl(amount)
                    } else {
                        a.wrapping_shr(amount)
                    }
                }
                // Shifting out every bit: left shifts drain to zero, right
                // shifts drain to the sign.
                _ => {
                    if shl {
                        0
                    } else if *a < 0 {
                        -1
                    } else {
                        0
                    }
                }
            };
            Ok(Value::Int(result))
        }
        _ => {
            let err = unsupported(op, &left, &right, heap);
            left.drop_with_heap(heap);
            right.drop_with_heap(heap);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn apply(op: Opcode, left: Value, right: Value) -> RunResult<Value> {
        let mut heap = Heap::new(NoLimitTracker);
        let interns = Interns::default();
        binary(op, left, right, &mut heap, &interns)
    }

    #[test]
    fn int_arithmetic() {
        assert_eq!(apply(Opcode::Add, Value::Int(2), Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(apply(Opcode::Mul, Value::Int(4), Value::Int(5)).unwrap(), Value::Int(20));
        assert_eq!(apply(Opcode::Div, Value::Int(7), Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(apply(Opcode::Rem, Value::Int(7), Value::Int(2)).unwrap(), Value::Int(1));
    }

    #[test]
    fn mixed_numeric_promotes_to_float() {
        assert_eq!(
            apply(Opcode::Add, Value::Int(1), Value::Float(0.5)).unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    fn int_overflow_wraps() {
        assert_eq!(
            apply(Opcode::Add, Value::Int(i64::MAX), Value::Int(1)).unwrap(),
            Value::Int(i64::MIN)
        );
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = apply(Opcode::Div, Value::Int(1), Value::Int(0)).unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::DivisionByZero);
        // Float division follows IEEE instead.
        assert_eq!(
            apply(Opcode::Div, Value::Float(1.0), Value::Float(0.0)).unwrap(),
            Value::Float(f64::INFINITY)
        );
    }

    #[test]
    fn comparisons() {
        assert_eq!(
            apply(Opcode::CompareLt, Value::Int(1), Value::Float(1.5)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            apply(Opcode::CompareGe, Value::Int(2), Value::Int(2)).unwrap(),
            Value::Bool(true)
        );
        assert!(apply(Opcode::CompareLt, Value::Int(1), Value::Nil).is_err());
    }

    #[test]
    fn char_arithmetic() {
        assert_eq!(apply(Opcode::Add, Value::Char('a'), Value::Int(1)).unwrap(), Value::Char('b'));
        assert_eq!(apply(Opcode::Sub, Value::Char('c'), Value::Char('a')).unwrap(), Value::Int(2));
    }

    #[test]
    fn shifts() {
        assert_eq!(apply(Opcode::Shl, Value::Int(1), Value::Int(4)).unwrap(), Value::Int(16));
        assert_eq!(apply(Opcode::Shr, Value::Int(-8), Value::Int(1)).unwrap(), Value::Int(-4));
        assert_eq!(apply(Opcode::Shr, Value::Int(-1), Value::Int(99)).unwrap(), Value::Int(-1));
        assert!(apply(Opcode::Shl, Value::Int(1), Value::Int(-1)).is_err());
    }

    #[test]
    fn string_concatenation() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut builder = crate::intern::InternerBuilder::new();
        let a = builder.intern("foo");
        let b = builder.intern("bar");
        let interns = builder.build();
        let result = binary(
            Opcode::Add,
            Value::InternString(a),
            Value::InternString(b),
            &mut heap,
            &interns,
        )
        .unwrap();
        assert_eq!(result.as_str(&heap, &interns), Some("foobar"));
        result.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn unary_ops() {
        let mut heap = Heap::new(NoLimitTracker);
        let interns = Interns::default();
        assert_eq!(
            unary(Opcode::UnaryMinus, Value::Int(3), &mut heap, &interns).unwrap(),
            Value::Int(-3)
        );
        assert_eq!(
            unary(Opcode::UnaryNot, Value::Int(0), &mut heap, &interns).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            unary(Opcode::UnaryBitNot, Value::Int(0), &mut heap, &interns).unwrap(),
            Value::Int(-1)
        );
        assert!(unary(Opcode::UnaryMinus, Value::Nil, &mut heap, &interns).is_err());
    }
}
