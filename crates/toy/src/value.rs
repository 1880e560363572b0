//! The runtime value representation and its capability surface.
//!
//! `Value` is a small immediate: primitives inline, strings interned or on
//! the heap, containers and callables behind `Ref(HeapId)`. `Clone` is
//! deliberately not implemented — copying a `Ref` must go through
//! [`Value::clone_with_heap`] so the reference count stays correct, and the
//! `raw_copy`/`retained` pair exists for the two-phase pattern where a
//! value is read out of a heap object under a shared borrow and retained
//! once the borrow ends.
//!
//! The free functions here are the value model of the language: equality
//! (numeric across int/float), ordering, deterministic hashing consistent
//! with equality, truthiness, length, and display/repr formatting.

use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::{
    builtins::Builtin,
    error::{ErrorKind, RunError, RunResult},
    function::FunctionId,
    hash,
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    resource::ResourceTracker,
    types::Type,
};

/// Maximum nesting depth for structural equality, hashing, and display.
/// Guards against cyclic values built through mutation.
pub(crate) const MAX_DATA_DEPTH: usize = 64;

/// A runtime value.
#[derive(Debug, PartialEq)]
pub(crate) enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    /// An interned string literal; content lives in the interner.
    InternString(StringId),
    /// A universe builtin: function or callable type value.
    Builtin(Builtin),
    /// A compiled function without captures.
    Function(FunctionId),
    /// Heap-allocated data.
    Ref(HeapId),
}

impl Value {
    /// Bit-copies the value without touching reference counts.
    ///
    /// Only for the two-phase read pattern: copy under a shared heap
    /// borrow, then call [`Value::retained`] once the borrow ends. Never
    /// store the result without retaining it.
    #[inline]
    pub fn raw_copy(&self) -> Self {
        match self {
            Self::Nil => Self::Nil,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(i) => Self::Int(*i),
            Self::Float(f) => Self::Float(*f),
            Self::Char(c) => Self::Char(*c),
            Self::InternString(id) => Self::InternString(*id),
            Self::Builtin(b) => Self::Builtin(*b),
            Self::Function(id) => Self::Function(*id),
            Self::Ref(id) => Self::Ref(*id),
        }
    }

    /// Takes ownership of a `raw_copy` by incrementing the refcount.
    #[inline]
    pub fn retained<T: ResourceTracker>(self, heap: &mut Heap<T>) -> Self {
        if let Self::Ref(id) = &self {
            heap.inc_ref(*id);
        }
        self
    }

    /// Clones the value, incrementing the refcount for heap data.
    #[inline]
    pub fn clone_with_heap<T: ResourceTracker>(&self, heap: &mut Heap<T>) -> Self {
        self.raw_copy().retained(heap)
    }

    /// Releases the value, decrementing the refcount for heap data.
    #[inline]
    pub fn drop_with_heap<T: ResourceTracker>(self, heap: &mut Heap<T>) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    /// The value's type tag.
    pub fn type_of<T: ResourceTracker>(&self, heap: &Heap<T>) -> Type {
        match self {
            Self::Nil => Type::Nil,
            Self::Bool(_) => Type::Bool,
            Self::Int(_) => Type::Int,
            Self::Float(_) => Type::Float,
            Self::Char(_) => Type::Char,
            Self::InternString(_) => Type::String,
            Self::Builtin(b) => b.type_of(),
            Self::Function(_) => Type::Function,
            Self::Ref(id) => heap.get(*id).type_of(),
        }
    }

    /// Truthiness, used by conditions and `!`.
    pub fn truthy<T: ResourceTracker>(&self, heap: &Heap<T>, interns: &Interns) -> bool {
        match self {
            Self::Nil => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Char(c) => *c != '\0',
            Self::InternString(id) => !interns.get(*id).is_empty(),
            Self::Builtin(_) | Self::Function(_) => true,
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => !s.as_str().is_empty(),
                HeapData::Bytes(b) => b.len() != 0,
                HeapData::Array(a) => a.len() != 0,
                HeapData::Table(t) => t.len() != 0,
                HeapData::Tuple(t) => t.len() != 0,
                HeapData::Range(r) => r.len() != 0,
                _ => true,
            },
        }
    }

    /// String content when this value is a string of either representation.
    pub fn as_str<'a, T: ResourceTracker>(&self, heap: &'a Heap<T>, interns: &'a Interns) -> Option<&'a str> {
        match self {
            Self::InternString(id) => Some(interns.get(*id)),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Integer content, when this value is an int.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Container length per the value model; `None` for unsized values.
pub(crate) fn value_len<T: ResourceTracker>(value: &Value, heap: &Heap<T>, interns: &Interns) -> Option<usize> {
    match value {
        Value::InternString(id) => Some(interns.get(*id).chars().count()),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => Some(s.char_len()),
            HeapData::Bytes(b) => Some(b.len()),
            HeapData::Array(a) => Some(a.len()),
            HeapData::Table(t) => Some(t.len()),
            HeapData::Tuple(t) => Some(t.len()),
            HeapData::Range(r) => Some(r.len()),
            _ => None,
        },
        Value::Builtin(crate::builtins::Builtin::ModuleHandle(m)) => Some(m.len()),
        _ => None,
    }
}

/// Equality per the value model: reflexive, symmetric, numeric across
/// int/float, structural for containers (depth-guarded).
pub(crate) fn value_eq<T: ResourceTracker>(a: &Value, b: &Value, heap: &Heap<T>, interns: &Interns) -> bool {
    eq_at_depth(a, b, heap, interns, 0)
}

fn eq_at_depth<T: ResourceTracker>(a: &Value, b: &Value, heap: &Heap<T>, interns: &Interns, depth: usize) -> bool {
    if depth > MAX_DATA_DEPTH {
        return false;
    }
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) => (*x as f64) == *y,
        (Value::Float(x), Value::Int(y)) => *x == (*y as f64),
        (Value::Char(x), Value::Char(y)) => x == y,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => x == y,
        (Value::InternString(x), Value::InternString(y)) => {
            x == y || interns.get(*x) == interns.get(*y)
        }
        (Value::InternString(sid), Value::Ref(id)) | (Value::Ref(id), Value::InternString(sid)) => {
            match heap.get(*id) {
                HeapData::Str(s) => s.as_str() == interns.get(*sid),
                _ => false,
            }
        }
        (Value::Ref(x), Value::Ref(y)) => {
            if x == y {
                return true;
            }
            match (heap.get(*x), heap.get(*y)) {
                (HeapData::Str(s1), HeapData::Str(s2)) => s1.as_str() == s2.as_str(),
                (HeapData::Bytes(b1), HeapData::Bytes(b2)) => b1.as_slice() == b2.as_slice(),
                (HeapData::Range(r1), HeapData::Range(r2)) => r1 == r2,
                (HeapData::Array(a1), HeapData::Array(a2)) => {
                    seq_eq(a1.as_slice(), a2.as_slice(), heap, interns, depth)
                }
                (HeapData::Tuple(t1), HeapData::Tuple(t2)) => {
                    seq_eq(t1.as_slice(), t2.as_slice(), heap, interns, depth)
                }
                (HeapData::Table(t1), HeapData::Table(t2)) => {
                    if t1.len() != t2.len() {
                        return false;
                    }
                    t1.entries().all(|entry| {
                        let Ok(slot) = t2.find(&entry.key, heap, interns) else {
                            return false;
                        };
                        match slot.index {
                            Some(i) => {
                                let other = t2.entry(i).expect("index from find");
                                eq_at_depth(&entry.value, &other.value, heap, interns, depth + 1)
                            }
                            None => false,
                        }
                    })
                }
                (HeapData::Error(e1), HeapData::Error(e2)) => e1 == e2,
                _ => false,
            }
        }
        _ => false,
    }
}

fn seq_eq<T: ResourceTracker>(a: &[Value], b: &[Value], heap: &Heap<T>, interns: &Interns, depth: usize) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| eq_at_depth(x, y, heap, interns, depth + 1))
}

/// Ordered comparison; `None` when the pair has no defined order.
pub(crate) fn value_cmp<T: ResourceTracker>(
    a: &Value,
    b: &Value,
    heap: &Heap<T>,
    interns: &Interns,
) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Char(x), Value::Char(y)) => x.partial_cmp(y),
        _ => {
            let sa = a.as_str(heap, interns);
            let sb = b.as_str(heap, interns);
            if let (Some(sa), Some(sb)) = (sa, sb) {
                return sa.partial_cmp(sb);
            }
            if let (Value::Ref(x), Value::Ref(y)) = (a, b)
                && let (HeapData::Bytes(b1), HeapData::Bytes(b2)) = (heap.get(*x), heap.get(*y))
            {
                return b1.as_slice().partial_cmp(b2.as_slice());
            }
            None
        }
    }
}

/// Membership test backing the `in` operator and the `contains` builtin.
///
/// Arrays test elements, tables test keys, strings test substrings or
/// chars, bytes test byte values, ranges test membership.
pub(crate) fn value_contains<T: ResourceTracker>(
    container: &Value,
    item: &Value,
    heap: &Heap<T>,
    interns: &Interns,
) -> RunResult<bool> {
    if let Some(s) = container.as_str(heap, interns) {
        return match item {
            Value::Char(c) => Ok(s.contains(*c)),
            _ => match item.as_str(heap, interns) {
                Some(needle) => Ok(s.contains(needle)),
                None => Err(RunError::type_error(format!(
                    "string membership needs a string or char, not {}",
                    item.type_of(heap)
                ))),
            },
        };
    }
    match container {
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Array(a) => Ok(a.as_slice().iter().any(|e| value_eq(e, item, heap, interns))),
            HeapData::Tuple(t) => Ok(t.as_slice().iter().any(|e| value_eq(e, item, heap, interns))),
            HeapData::Table(t) => Ok(t.find(item, heap, interns)?.index.is_some()),
            HeapData::Bytes(b) => match item {
                Value::Int(i) => Ok(u8::try_from(*i).is_ok_and(|byte| b.as_slice().contains(&byte))),
                _ => Err(RunError::type_error(format!(
                    "bytes membership needs an int, not {}",
                    item.type_of(heap)
                ))),
            },
            HeapData::Range(r) => match item {
                Value::Int(i) => {
                    let i = *i;
                    Ok(i >= r.start() && i < r.stop() && (i - r.start()) % r.step() == 0)
                }
                _ => Ok(false),
            },
            other => Err(RunError::type_error(format!(
                "{} does not support membership tests",
                other.type_of()
            ))),
        },
        other => Err(RunError::type_error(format!(
            "{} does not support membership tests",
            other.type_of(heap)
        ))),
    }
}

/// Hash for table keys; errors for unhashable values.
///
/// Consistent with [`value_eq`]: `a == b` implies equal hashes, including
/// the int/float numeric case.
pub(crate) fn key_hash<T: ResourceTracker>(value: &Value, heap: &Heap<T>, interns: &Interns) -> RunResult<u64> {
    key_hash_at_depth(value, heap, interns, 0)
}

fn key_hash_at_depth<T: ResourceTracker>(
    value: &Value,
    heap: &Heap<T>,
    interns: &Interns,
    depth: usize,
) -> RunResult<u64> {
    if depth > MAX_DATA_DEPTH {
        return Err(RunError::new(ErrorKind::NotHashable, "value nests too deeply to hash"));
    }
    match value {
        Value::Bool(b) => Ok(hash::hash_int(i64::from(*b)).rotate_left(1)),
        Value::Int(i) => Ok(hash::hash_int(*i)),
        Value::Float(f) => Ok(hash::hash_float(*f)),
        Value::Char(c) => Ok(hash::hash_int(i64::from(u32::from(*c))).rotate_left(2)),
        Value::InternString(id) => Ok(hash::hash_str(interns.get(*id))),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => Ok(hash::hash_str(s.as_str())),
            HeapData::Tuple(t) => {
                let mut acc: u64 = 0x345678;
                for elem in t.as_slice() {
                    let h = key_hash_at_depth(elem, heap, interns, depth + 1)?;
                    acc = acc.rotate_left(5) ^ h;
                    acc = acc.wrapping_mul(1_000_003);
                }
                Ok(acc)
            }
            other => Err(RunError::new(
                ErrorKind::NotHashable,
                format!("{} is not hashable", other.type_of()),
            )),
        },
        other => Err(RunError::new(
            ErrorKind::NotHashable,
            format!("{} is not hashable", other.type_of(heap)),
        )),
    }
}

/// Renders the value for user output: strings and chars unquoted.
pub(crate) fn fmt_display<T: ResourceTracker>(value: &Value, heap: &Heap<T>, interns: &Interns) -> String {
    let mut out = String::new();
    write_value(&mut out, value, heap, interns, false, 0);
    out
}

/// Renders the value for debugging: strings quoted, chars quoted.
pub(crate) fn fmt_repr<T: ResourceTracker>(value: &Value, heap: &Heap<T>, interns: &Interns) -> String {
    let mut out = String::new();
    write_value(&mut out, value, heap, interns, true, 0);
    out
}

fn write_value<T: ResourceTracker>(
    out: &mut String,
    value: &Value,
    heap: &Heap<T>,
    interns: &Interns,
    repr: bool,
    depth: usize,
) {
    if depth > MAX_DATA_DEPTH {
        out.push_str("...");
        return;
    }
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(f) => write_float(out, *f),
        Value::Char(c) => {
            if repr {
                let _ = write!(out, "'{}'", c.escape_default());
            } else {
                out.push(*c);
            }
        }
        Value::InternString(id) => write_str(out, interns.get(*id), repr),
        Value::Builtin(b) => b.write_repr(out),
        Value::Function(_) => out.push_str("<function>"),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => write_str(out, s.as_str(), repr),
            HeapData::Bytes(b) => {
                out.push_str("bytes(");
                for byte in b.as_slice() {
                    let _ = write!(out, "{byte:02x}");
                }
                out.push(')');
            }
            HeapData::Array(a) => {
                out.push('[');
                for (i, elem) in a.as_slice().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_value(out, elem, heap, interns, true, depth + 1);
                }
                out.push(']');
            }
            HeapData::Tuple(t) => {
                out.push('(');
                for (i, elem) in t.as_slice().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_value(out, elem, heap, interns, true, depth + 1);
                }
                out.push(')');
            }
            HeapData::Table(t) => {
                out.push('{');
                for (i, entry) in t.entries().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_table_key(out, &entry.key, heap, interns, depth + 1);
                    out.push_str(": ");
                    write_value(out, &entry.value, heap, interns, true, depth + 1);
                }
                out.push('}');
            }
            HeapData::Range(r) => {
                let _ = write!(out, "range({}, {}, {})", r.start(), r.stop(), r.step());
            }
            HeapData::Cell(inner) => write_value(out, inner, heap, interns, repr, depth + 1),
            HeapData::Closure(_) => out.push_str("<function>"),
            HeapData::BoundMethod(_) => out.push_str("<bound method>"),
            HeapData::Error(e) => {
                if repr {
                    let _ = write!(out, "error({:?})", e.to_string());
                } else {
                    let _ = write!(out, "{e}");
                }
            }
            HeapData::Iter(_) => out.push_str("<iterator>"),
        },
    }
}

/// Table keys print bare when they look like identifiers, quoted otherwise.
fn write_table_key<T: ResourceTracker>(
    out: &mut String,
    key: &Value,
    heap: &Heap<T>,
    interns: &Interns,
    depth: usize,
) {
    if let Some(s) = key.as_str(heap, interns)
        && is_identifier(s)
    {
        out.push_str(s);
        return;
    }
    write_value(out, key, heap, interns, true, depth);
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn write_str(out: &mut String, s: &str, repr: bool) {
    if repr {
        let _ = write!(out, "{s:?}");
    } else {
        out.push_str(s);
    }
}

/// Floats always render with a decimal point or exponent so they read back
/// as floats.
pub(crate) fn write_float(out: &mut String, f: f64) {
    if f.is_nan() {
        out.push_str("nan");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "inf" } else { "-inf" });
    } else {
        let mut buffer = ryu::Buffer::new();
        out.push_str(buffer.format(f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resource::NoLimitTracker, types::{Array, Str, Table, Tuple}};

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker)
    }

    #[test]
    fn numeric_cross_type_equality() {
        let heap = heap();
        let interns = Interns::default();
        assert!(value_eq(&Value::Int(1), &Value::Float(1.0), &heap, &interns));
        assert!(value_eq(&Value::Float(2.0), &Value::Int(2), &heap, &interns));
        assert!(!value_eq(&Value::Int(1), &Value::Bool(true), &heap, &interns));
    }

    #[test]
    fn equal_values_hash_equal() {
        let heap = heap();
        let interns = Interns::default();
        let h_int = key_hash(&Value::Int(3), &heap, &interns).unwrap();
        let h_float = key_hash(&Value::Float(3.0), &heap, &interns).unwrap();
        assert_eq!(h_int, h_float);
    }

    #[test]
    fn intern_and_heap_strings_compare_equal() {
        let mut heap = heap();
        let mut builder = crate::intern::InternerBuilder::new();
        let id = builder.intern("abc");
        let interns = builder.build();
        let heap_id = heap.allocate(HeapData::Str(Str::new("abc"))).unwrap();
        assert!(value_eq(
            &Value::InternString(id),
            &Value::Ref(heap_id),
            &heap,
            &interns
        ));
        let h1 = key_hash(&Value::InternString(id), &heap, &interns).unwrap();
        let h2 = key_hash(&Value::Ref(heap_id), &heap, &interns).unwrap();
        assert_eq!(h1, h2);
        heap.dec_ref(heap_id);
    }

    #[test]
    fn arrays_compare_structurally() {
        let mut heap = heap();
        let interns = Interns::default();
        let a = heap
            .allocate(HeapData::Array(Array::new(vec![Value::Int(1), Value::Int(2)])))
            .unwrap();
        let b = heap
            .allocate(HeapData::Array(Array::new(vec![Value::Int(1), Value::Int(2)])))
            .unwrap();
        let c = heap
            .allocate(HeapData::Array(Array::new(vec![Value::Int(1), Value::Int(3)])))
            .unwrap();
        assert!(value_eq(&Value::Ref(a), &Value::Ref(b), &heap, &interns));
        assert!(!value_eq(&Value::Ref(a), &Value::Ref(c), &heap, &interns));
        heap.dec_ref(a);
        heap.dec_ref(b);
        heap.dec_ref(c);
    }

    #[test]
    fn tables_are_not_hashable() {
        let mut heap = heap();
        let interns = Interns::default();
        let id = heap.allocate(HeapData::Table(Table::new())).unwrap();
        let err = key_hash(&Value::Ref(id), &heap, &interns).unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::NotHashable);
        heap.dec_ref(id);
    }

    #[test]
    fn tuple_hash_respects_element_equality() {
        let mut heap = heap();
        let interns = Interns::default();
        let t1 = heap
            .allocate(HeapData::Tuple(Tuple::new(vec![Value::Int(1), Value::Int(2)])))
            .unwrap();
        let t2 = heap
            .allocate(HeapData::Tuple(Tuple::new(vec![Value::Float(1.0), Value::Int(2)])))
            .unwrap();
        let h1 = key_hash(&Value::Ref(t1), &heap, &interns).unwrap();
        let h2 = key_hash(&Value::Ref(t2), &heap, &interns).unwrap();
        assert_eq!(h1, h2);
        heap.dec_ref(t1);
        heap.dec_ref(t2);
    }

    #[test]
    fn display_and_repr() {
        let mut heap = heap();
        let mut builder = crate::intern::InternerBuilder::new();
        let s = builder.intern("hi");
        let interns = builder.build();
        assert_eq!(fmt_display(&Value::InternString(s), &heap, &interns), "hi");
        assert_eq!(fmt_repr(&Value::InternString(s), &heap, &interns), "\"hi\"");
        assert_eq!(fmt_display(&Value::Nil, &heap, &interns), "nil");
        assert_eq!(fmt_display(&Value::Float(1.0), &heap, &interns), "1.0");

        let arr = heap
            .allocate(HeapData::Array(Array::new(vec![
                Value::Int(1),
                Value::InternString(s),
            ])))
            .unwrap();
        assert_eq!(fmt_display(&Value::Ref(arr), &heap, &interns), "[1, \"hi\"]");
        heap.dec_ref(arr);
    }

    #[test]
    fn truthiness() {
        let heap = heap();
        let interns = Interns::default();
        assert!(!Value::Nil.truthy(&heap, &interns));
        assert!(!Value::Int(0).truthy(&heap, &interns));
        assert!(Value::Int(2).truthy(&heap, &interns));
        assert!(!Value::Float(0.0).truthy(&heap, &interns));
        assert!(Value::Char('x').truthy(&heap, &interns));
    }

    #[test]
    fn ordering() {
        let heap = heap();
        let interns = Interns::default();
        assert_eq!(
            value_cmp(&Value::Int(1), &Value::Float(1.5), &heap, &interns),
            Some(Ordering::Less)
        );
        assert_eq!(
            value_cmp(&Value::Char('b'), &Value::Char('a'), &heap, &interns),
            Some(Ordering::Greater)
        );
        assert_eq!(value_cmp(&Value::Int(1), &Value::Nil, &heap, &interns), None);
    }
}
