//! Container access: indexing, slicing, and field access.
//!
//! Arrays index by int (negative counts from the end), tables by any
//! hashable key (a missing key reads as nil), tuples read-only by int,
//! strings and bytes by int yielding a char or byte. Slices are half-open
//! with nil defaults. Fields are string-named: table entries, module
//! members, and the `message`/`kind`/`cause` properties of error values.

use crate::{
    builtins::collections::normalize_index,
    error::{ErrorKind, RunError, RunResult},
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    resource::ResourceTracker,
    types::{Array, Bytes, Str, Tuple, str as str_ops},
    value::{self, Value},
};

pub(super) fn index_get<T: ResourceTracker>(
    heap: &mut Heap<T>,
    interns: &Interns,
    obj: Value,
    index: Value,
) -> RunResult<Value> {
    if let Some(s) = obj.as_str(heap, interns) {
        let result = string_index(s, &index, heap);
        obj.drop_with_heap(heap);
        index.drop_with_heap(heap);
        return result;
    }
    let Value::Ref(id) = &obj else {
        let err = not_indexable(&obj, heap);
        obj.drop_with_heap(heap);
        index.drop_with_heap(heap);
        return Err(err);
    };
    let id = *id;
    let result = (|| -> RunResult<Value> {
        match heap.get(id) {
            HeapData::Array(array) => {
                let position = int_index(&index, array.len(), heap, "array")?;
                Ok(array.as_slice()[position].raw_copy())
            }
            HeapData::Tuple(tuple) => {
                let position = int_index(&index, tuple.len(), heap, "tuple")?;
                Ok(tuple.as_slice()[position].raw_copy())
            }
            HeapData::Bytes(bytes) => {
                let position = int_index(&index, bytes.len(), heap, "bytes")?;
                Ok(Value::Int(i64::from(bytes.as_slice()[position])))
            }
            HeapData::Range(range) => {
                let position = int_index(&index, range.len(), heap, "range")?;
                Ok(Value::Int(range.get(position).expect("index checked")))
            }
            HeapData::Table(table) => {
                let slot = table.find(&index, heap, interns)?;
                Ok(match slot.index {
                    Some(entry) => table.entry(entry).expect("index from find").value.raw_copy(),
                    // Reading an absent key yields nil.
                    None => Value::Nil,
                })
            }
            other => Err(RunError::type_error(format!("{} is not indexable", other.type_of()))),
        }
    })();
    let result = result.map(|value| value.retained(heap));
    obj.drop_with_heap(heap);
    index.drop_with_heap(heap);
    result
}

fn string_index<T: ResourceTracker>(s: &str, index: &Value, heap: &Heap<T>) -> RunResult<Value> {
    let len = s.chars().count();
    let position = int_index(index, len, heap, "string")?;
    Ok(Value::Char(str_ops::char_at(s, position).expect("index checked")))
}

fn int_index<T: ResourceTracker>(index: &Value, len: usize, heap: &Heap<T>, what: &str) -> RunResult<usize> {
    let Some(i) = index.as_int() else {
        return Err(RunError::type_error(format!(
            "{what} index must be an int, not {}",
            index.type_of(heap)
        )));
    };
    normalize_index(i, len).ok_or_else(|| RunError::index(format!("index {i} out of range for {what} of length {len}")))
}

pub(super) fn index_set<T: ResourceTracker>(
    heap: &mut Heap<T>,
    interns: &Interns,
    obj: Value,
    index: Value,
    value: Value,
) -> RunResult<()> {
    let Value::Ref(id) = &obj else {
        let err = not_mutable_index(&obj, heap);
        obj.drop_with_heap(heap);
        index.drop_with_heap(heap);
        value.drop_with_heap(heap);
        return Err(err);
    };
    let id = *id;
    let result = index_set_inner(heap, interns, id, &index, value);
    obj.drop_with_heap(heap);
    index.drop_with_heap(heap);
    result
}

fn index_set_inner<T: ResourceTracker>(
    heap: &mut Heap<T>,
    interns: &Interns,
    id: HeapId,
    index: &Value,
    value: Value,
) -> RunResult<()> {
    let outcome = match heap.get(id) {
        HeapData::Array(array) => {
            if let Err(err) = check_mutable(array.frozen(), array.locked(), "array") {
                value.drop_with_heap(heap);
                return Err(err);
            }
            match int_index(index, array.len(), heap, "array") {
                Ok(position) => {
                    let HeapData::Array(array) = heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    let old = array.set(position, value);
                    old.drop_with_heap(heap);
                    return Ok(());
                }
                Err(err) => Err(err),
            }
        }
        HeapData::Table(table) => {
            if let Err(err) = check_mutable(table.frozen(), table.locked(), "table") {
                value.drop_with_heap(heap);
                return Err(err);
            }
            match table.find(index, heap, interns) {
                Ok(slot) => {
                    if let Err(err) = heap.tracker_mut().on_container_insert() {
                        value.drop_with_heap(heap);
                        return Err(err.into());
                    }
                    let key = index.clone_with_heap(heap);
                    let HeapData::Table(table) = heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    if let Some((dup_key, old_value)) = table.set_found(slot, key, value) {
                        dup_key.drop_with_heap(heap);
                        old_value.drop_with_heap(heap);
                    }
                    return Ok(());
                }
                Err(err) => Err(err),
            }
        }
        HeapData::Bytes(bytes) => {
            if let Err(err) = check_mutable(bytes.frozen(), bytes.locked(), "bytes") {
                value.drop_with_heap(heap);
                return Err(err);
            }
            match int_index(index, bytes.len(), heap, "bytes") {
                Ok(position) => {
                    let byte = match value.as_int().and_then(|i| u8::try_from(i).ok()) {
                        Some(byte) => byte,
                        None => {
                            let message = format!("bytes element must be an int in 0..=255, not {}", value.type_of(heap));
                            value.drop_with_heap(heap);
                            return Err(RunError::type_error(message));
                        }
                    };
                    let HeapData::Bytes(bytes) = heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    bytes.set(position, byte);
                    return Ok(());
                }
                Err(err) => Err(err),
            }
        }
        HeapData::Tuple(_) => Err(RunError::new(ErrorKind::Frozen, "tuples are immutable")),
        HeapData::Str(_) => Err(RunError::new(ErrorKind::Frozen, "strings are immutable")),
        other => Err(RunError::type_error(format!(
            "{} does not support index assignment",
            other.type_of()
        ))),
    };
    match outcome {
        Ok(()) => Ok(()),
        Err(err) => {
            value.drop_with_heap(heap);
            Err(err)
        }
    }
}

fn check_mutable(frozen: bool, locked: bool, what: &str) -> RunResult<()> {
    if frozen {
        return Err(RunError::new(ErrorKind::Frozen, format!("cannot mutate a frozen {what}")));
    }
    if locked {
        return Err(RunError::new(
            ErrorKind::MutatedWhileIterating,
            format!("cannot mutate a {what} while iterating over it"),
        ));
    }
    Ok(())
}

/// Half-open slice with nil defaults; negative bounds count from the end.
pub(super) fn slice<T: ResourceTracker>(
    heap: &mut Heap<T>,
    interns: &Interns,
    obj: Value,
    low: Value,
    high: Value,
) -> RunResult<Value> {
    let result = slice_inner(heap, interns, &obj, &low, &high);
    obj.drop_with_heap(heap);
    low.drop_with_heap(heap);
    high.drop_with_heap(heap);
    result
}

fn slice_inner<T: ResourceTracker>(
    heap: &mut Heap<T>,
    interns: &Interns,
    obj: &Value,
    low: &Value,
    high: &Value,
) -> RunResult<Value> {
    let Some(len) = value::value_len(obj, heap, interns) else {
        return Err(RunError::type_error(format!(
            "{} does not support slicing",
            obj.type_of(heap)
        )));
    };
    let (low, high) = slice_bounds(low, high, len, heap)?;

    if let Some(s) = obj.as_str(heap, interns) {
        let text = str_ops::char_slice(s, low, high);
        let id = heap.allocate(HeapData::Str(Str::new(text)))?;
        return Ok(Value::Ref(id));
    }
    let Value::Ref(id) = obj else {
        return Err(RunError::type_error(format!(
            "{} does not support slicing",
            obj.type_of(heap)
        )));
    };
    match heap.get(*id) {
        HeapData::Array(array) => {
            let elems: Vec<Value> = array.as_slice()[low..high].iter().map(Value::raw_copy).collect();
            retain_refs(heap, &elems);
            let id = heap.allocate(HeapData::Array(Array::new(elems)))?;
            Ok(Value::Ref(id))
        }
        HeapData::Tuple(tuple) => {
            let elems: Vec<Value> = tuple.as_slice()[low..high].iter().map(Value::raw_copy).collect();
            retain_refs(heap, &elems);
            let id = heap.allocate(HeapData::Tuple(Tuple::new(elems)))?;
            Ok(Value::Ref(id))
        }
        HeapData::Bytes(bytes) => {
            let data = bytes.as_slice()[low..high].to_vec();
            let id = heap.allocate(HeapData::Bytes(Bytes::new(data)))?;
            Ok(Value::Ref(id))
        }
        other => Err(RunError::type_error(format!(
            "{} does not support slicing",
            other.type_of()
        ))),
    }
}

fn retain_refs<T: ResourceTracker>(heap: &mut Heap<T>, values: &[Value]) {
    let ids: Vec<HeapId> = values
        .iter()
        .filter_map(|v| match v {
            Value::Ref(id) => Some(*id),
            _ => None,
        })
        .collect();
    for id in ids {
        heap.inc_ref(id);
    }
}

fn slice_bounds<T: ResourceTracker>(low: &Value, high: &Value, len: usize, heap: &Heap<T>) -> RunResult<(usize, usize)> {
    let resolve = |bound: &Value, default: usize| -> RunResult<usize> {
        match bound {
            Value::Nil => Ok(default),
            Value::Int(i) => {
                let len_i = i64::try_from(len).unwrap_or(i64::MAX);
                let adjusted = if *i < 0 { i + len_i } else { *i };
                if (0..=len_i).contains(&adjusted) {
                    Ok(usize::try_from(adjusted).expect("bound in range"))
                } else {
                    Err(RunError::new(
                        ErrorKind::SliceError,
                        format!("slice bound {i} out of range for length {len}"),
                    ))
                }
            }
            other => Err(RunError::type_error(format!(
                "slice bound must be an int, not {}",
                other.type_of(heap)
            ))),
        }
    };
    let low = resolve(low, 0)?;
    let high = resolve(high, len)?;
    if low > high {
        return Err(RunError::new(
            ErrorKind::SliceError,
            format!("slice bounds inverted: {low} > {high}"),
        ));
    }
    Ok((low, high))
}

/// What a field read resolved to, before any allocation happens.
///
/// The read phase holds a shared heap borrow; reads that materialize new
/// values (error properties) defer their allocation to the second phase.
enum FieldPlan {
    Existing(Value),
    NewStr(String),
    NewError(crate::error::ErrorValue),
}

pub(super) fn field_get<T: ResourceTracker>(
    heap: &mut Heap<T>,
    interns: &Interns,
    obj: Value,
    name_id: StringId,
) -> RunResult<Value> {
    let name = interns.get(name_id);
    if let Value::Builtin(crate::builtins::Builtin::ModuleHandle(module)) = &obj {
        return match module.member(name) {
            Some(member) => Ok(member),
            None => Err(RunError::new(
                ErrorKind::NoSuchField,
                format!("module {} has no member '{name}'", module.name()),
            )),
        };
    }
    let Value::Ref(id) = &obj else {
        let err = no_field(&obj, name, heap);
        obj.drop_with_heap(heap);
        return Err(err);
    };
    let id = *id;
    let plan = match heap.get(id) {
        HeapData::Table(table) => {
            let key = Value::InternString(name_id);
            match table.find(&key, heap, interns) {
                Ok(slot) => Ok(match slot.index {
                    Some(entry) => FieldPlan::Existing(table.entry(entry).expect("index from find").value.raw_copy()),
                    None => FieldPlan::Existing(Value::Nil),
                }),
                Err(err) => Err(err),
            }
        }
        HeapData::Error(error) => match name {
            "message" => Ok(FieldPlan::NewStr(error.message.clone())),
            "kind" => Ok(FieldPlan::NewStr(error.kind.to_string())),
            "cause" => Ok(match &error.cause {
                Some(cause) => FieldPlan::NewError((**cause).clone()),
                None => FieldPlan::Existing(Value::Nil),
            }),
            _ => Err(RunError::new(
                ErrorKind::NoSuchField,
                format!("error has no field '{name}'"),
            )),
        },
        other => Err(RunError::new(
            ErrorKind::NoSuchField,
            format!("{} has no fields", other.type_of()),
        )),
    };
    let result = match plan {
        Ok(FieldPlan::Existing(value)) => Ok(value.retained(heap)),
        Ok(FieldPlan::NewStr(text)) => heap
            .allocate(HeapData::Str(Str::new(text)))
            .map(Value::Ref)
            .map_err(Into::into),
        Ok(FieldPlan::NewError(error)) => heap
            .allocate(HeapData::Error(error))
            .map(Value::Ref)
            .map_err(Into::into),
        Err(err) => Err(err),
    };
    obj.drop_with_heap(heap);
    result
}

pub(super) fn field_set<T: ResourceTracker>(
    heap: &mut Heap<T>,
    interns: &Interns,
    obj: Value,
    name_id: StringId,
    value: Value,
) -> RunResult<()> {
    let Value::Ref(id) = &obj else {
        let name = interns.get(name_id);
        let err = no_field(&obj, name, heap);
        obj.drop_with_heap(heap);
        value.drop_with_heap(heap);
        return Err(err);
    };
    let id = *id;
    let is_table = matches!(heap.get(id), HeapData::Table(_));
    if !is_table {
        let name = interns.get(name_id);
        let err = RunError::new(
            ErrorKind::NoSuchField,
            format!("{} does not support field assignment ('{name}')", heap.get(id).type_of()),
        );
        obj.drop_with_heap(heap);
        value.drop_with_heap(heap);
        return Err(err);
    }
    let result = index_set_inner(heap, interns, id, &Value::InternString(name_id), value);
    obj.drop_with_heap(heap);
    result
}

fn not_indexable<T: ResourceTracker>(obj: &Value, heap: &Heap<T>) -> RunError {
    RunError::type_error(format!("{} is not indexable", obj.type_of(heap)))
}

fn not_mutable_index<T: ResourceTracker>(obj: &Value, heap: &Heap<T>) -> RunError {
    RunError::type_error(format!("{} does not support index assignment", obj.type_of(heap)))
}

fn no_field<T: ResourceTracker>(obj: &Value, name: &str, heap: &Heap<T>) -> RunError {
    RunError::new(
        ErrorKind::NoSuchField,
        format!("{} has no field '{name}'", obj.type_of(heap)),
    )
}
