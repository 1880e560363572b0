//! The public value tree handed across the embedding boundary.
//!
//! Runtime values are reference-counted and heap-interned; [`Object`] is
//! their detached, owner-free projection. Converting deep structures is
//! depth-guarded: cycles surface as an explicit marker object rather than
//! unbounded recursion.

use std::fmt;

use crate::{
    error::ErrorValue,
    heap::{Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    value::{self, Value},
};

/// A script value as seen by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Object>),
    /// Table entries in insertion order.
    Map(Vec<(Object, Object)>),
    Tuple(Vec<Object>),
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    Error(ErrorValue),
    /// An opaque callable (function, closure, builtin, bound method).
    Callable,
    /// A module value, by name.
    Module(String),
    /// Marks a depth cutoff while converting cyclic or very deep data.
    Truncated,
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => {
                let mut out = String::new();
                value::write_float(&mut out, *v);
                f.write_str(&out)
            }
            Self::Char(c) => write!(f, "{c}"),
            Self::String(s) => f.write_str(s),
            Self::Bytes(data) => {
                f.write_str("bytes(")?;
                for byte in data {
                    write!(f, "{byte:02x}")?;
                }
                f.write_str(")")
            }
            Self::Array(elems) => {
                f.write_str("[")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, val)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {val}")?;
                }
                f.write_str("}")
            }
            Self::Tuple(elems) => {
                f.write_str("(")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                f.write_str(")")
            }
            Self::Range { start, stop, step } => write!(f, "range({start}, {stop}, {step})"),
            Self::Error(error) => write!(f, "error({error})"),
            Self::Callable => f.write_str("<function>"),
            Self::Module(name) => write!(f, "<module {name}>"),
            Self::Truncated => f.write_str("..."),
        }
    }
}

/// Converts a runtime value into its host projection.
pub(crate) fn object_from_value<T: ResourceTracker>(value: &Value, heap: &Heap<T>, interns: &Interns) -> Object {
    convert(value, heap, interns, 0)
}

fn convert<T: ResourceTracker>(value: &Value, heap: &Heap<T>, interns: &Interns, depth: usize) -> Object {
    if depth > value::MAX_DATA_DEPTH {
        return Object::Truncated;
    }
    match value {
        Value::Nil => Object::Nil,
        Value::Bool(b) => Object::Bool(*b),
        Value::Int(i) => Object::Int(*i),
        Value::Float(f) => Object::Float(*f),
        Value::Char(c) => Object::Char(*c),
        Value::InternString(id) => Object::String(interns.get(*id).to_owned()),
        Value::Builtin(crate::builtins::Builtin::ModuleHandle(m)) => Object::Module(m.name().to_owned()),
        Value::Builtin(_) | Value::Function(_) => Object::Callable,
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => Object::String(s.as_str().to_owned()),
            HeapData::Bytes(b) => Object::Bytes(b.as_slice().to_vec()),
            HeapData::Array(a) => Object::Array(
                a.as_slice()
                    .iter()
                    .map(|elem| convert(elem, heap, interns, depth + 1))
                    .collect(),
            ),
            HeapData::Tuple(t) => Object::Tuple(
                t.as_slice()
                    .iter()
                    .map(|elem| convert(elem, heap, interns, depth + 1))
                    .collect(),
            ),
            HeapData::Table(t) => Object::Map(
                t.entries()
                    .map(|entry| {
                        (
                            convert(&entry.key, heap, interns, depth + 1),
                            convert(&entry.value, heap, interns, depth + 1),
                        )
                    })
                    .collect(),
            ),
            HeapData::Range(r) => Object::Range {
                start: r.start(),
                stop: r.stop(),
                step: r.step(),
            },
            HeapData::Error(e) => Object::Error(e.clone()),
            HeapData::Closure(_) | HeapData::BoundMethod(_) => Object::Callable,
            HeapData::Cell(inner) => convert(inner, heap, interns, depth + 1),
            HeapData::Iter(_) => Object::Callable,
        },
    }
}
