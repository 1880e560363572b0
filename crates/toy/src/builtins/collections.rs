//! Container builtins: `len`, `clone`, `freeze`, `is_frozen`, `push`,
//! `delete`, `contains`, `keys`, `values`.

use super::{ArgList, take1, take2};
use crate::{
    error::{ErrorKind, RunError, RunResult},
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    intern::Interns,
    resource::ResourceTracker,
    types::{Array, Bytes},
    value::{self, Value},
};

pub(super) fn len<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let value = take1(args, "len", heap)?;
    let result = value::value_len(&value, heap, interns);
    let type_name = value.type_of(heap);
    value.drop_with_heap(heap);
    match result {
        Some(n) => Ok(Value::Int(i64::try_from(n).unwrap_or(i64::MAX))),
        None => Err(RunError::type_error(format!("{type_name} has no length"))),
    }
}

/// Spine copy: mutable containers copy their top level (elements aliased,
/// frozen flag cleared); immutable values alias.
pub(super) fn clone<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "clone", heap)?;
    let Value::Ref(id) = &value else {
        return Ok(value);
    };
    let id = *id;
    match heap.get(id) {
        HeapData::Array(array) => {
            let elems: Vec<Value> = array.as_slice().iter().map(Value::raw_copy).collect();
            let child_ids: Vec<HeapId> = ref_ids(&elems);
            for child in child_ids {
                heap.inc_ref(child);
            }
            let copy = heap.allocate(HeapData::Array(Array::new(elems)))?;
            value.drop_with_heap(heap);
            Ok(Value::Ref(copy))
        }
        HeapData::Table(table) => {
            let dup = table.duplicate();
            let mut child_ids = Vec::new();
            for entry in dup.entries() {
                if let Value::Ref(id) = &entry.key {
                    child_ids.push(*id);
                }
                if let Value::Ref(id) = &entry.value {
                    child_ids.push(*id);
                }
            }
            for child in child_ids {
                heap.inc_ref(child);
            }
            let copy = heap.allocate(HeapData::Table(dup))?;
            value.drop_with_heap(heap);
            Ok(Value::Ref(copy))
        }
        HeapData::Bytes(bytes) => {
            let copy = Bytes::new(bytes.as_slice().to_vec());
            let copy = heap.allocate(HeapData::Bytes(copy))?;
            value.drop_with_heap(heap);
            Ok(Value::Ref(copy))
        }
        // Immutable data aliases: the clone is the same reference.
        _ => Ok(value),
    }
}

pub(super) fn freeze<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "freeze", heap)?;
    if let Value::Ref(id) = &value {
        match heap.get_mut(*id) {
            HeapData::Array(array) => array.freeze(),
            HeapData::Table(table) => table.freeze(),
            HeapData::Bytes(bytes) => bytes.freeze(),
            _ => {}
        }
    }
    Ok(value)
}

pub(super) fn is_frozen<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "is_frozen", heap)?;
    let frozen = match &value {
        Value::InternString(_) => true,
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Array(array) => array.frozen(),
            HeapData::Table(table) => table.frozen(),
            HeapData::Bytes(bytes) => bytes.frozen(),
            HeapData::Str(_) | HeapData::Tuple(_) | HeapData::Range(_) => true,
            _ => false,
        },
        _ => false,
    };
    value.drop_with_heap(heap);
    Ok(Value::Bool(frozen))
}

/// Appends every remaining argument to the array and returns the array.
pub(super) fn push<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let mut args = args;
    if args.len() < 2 {
        let count = args.len();
        args.drop_with_heap(heap);
        return Err(RunError::arity(format!("push takes at least 2 arguments, got {count}")));
    }
    let rest: Vec<Value> = args.drain(1..).collect();
    let array = args.pop().expect("length checked");
    let Value::Ref(id) = &array else {
        let message = format!("push target must be an array, not {}", array.type_of(heap));
        array.drop_with_heap(heap);
        rest.drop_with_heap(heap);
        return Err(RunError::type_error(message));
    };
    let id = *id;
    if let Err(err) = check_array_mutable(heap, id) {
        array.drop_with_heap(heap);
        rest.drop_with_heap(heap);
        return Err(err);
    }
    for _ in 0..rest.len() {
        heap.tracker_mut().on_container_insert()?;
    }
    let HeapData::Array(target) = heap.get_mut(id) else {
        let message = format!("push target must be an array, not {}", heap.get(id).type_of());
        array.drop_with_heap(heap);
        rest.drop_with_heap(heap);
        return Err(RunError::type_error(message));
    };
    for value in rest {
        target.push(value);
    }
    Ok(array)
}

fn check_array_mutable<T: ResourceTracker>(heap: &Heap<T>, id: HeapId) -> RunResult<()> {
    if let HeapData::Array(array) = heap.get(id) {
        if array.frozen() {
            return Err(RunError::new(ErrorKind::Frozen, "cannot mutate a frozen array"));
        }
        if array.locked() {
            return Err(RunError::new(
                ErrorKind::MutatedWhileIterating,
                "cannot mutate an array while iterating over it",
            ));
        }
    }
    Ok(())
}

/// Removes by index (arrays) or key (tables), returning the removed value.
pub(super) fn delete<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let (container, key) = take2(args, "delete", heap)?;
    let Value::Ref(id) = &container else {
        let message = format!("delete target must be an array or table, not {}", container.type_of(heap));
        container.drop_with_heap(heap);
        key.drop_with_heap(heap);
        return Err(RunError::type_error(message));
    };
    let id = *id;
    let result = delete_from(heap, id, &key, interns);
    container.drop_with_heap(heap);
    key.drop_with_heap(heap);
    result
}

fn delete_from<T: ResourceTracker>(heap: &mut Heap<T>, id: HeapId, key: &Value, interns: &Interns) -> RunResult<Value> {
    match heap.get(id) {
        HeapData::Array(array) => {
            if array.frozen() {
                return Err(RunError::new(ErrorKind::Frozen, "cannot mutate a frozen array"));
            }
            if array.locked() {
                return Err(RunError::new(
                    ErrorKind::MutatedWhileIterating,
                    "cannot mutate an array while iterating over it",
                ));
            }
            let len = array.len();
            let Some(index) = key.as_int() else {
                return Err(RunError::type_error(format!(
                    "array index must be an int, not {}",
                    key.type_of(heap)
                )));
            };
            let index = normalize_index(index, len).ok_or_else(|| {
                RunError::index(format!("index {index} out of range for array of length {len}"))
            })?;
            let HeapData::Array(array) = heap.get_mut(id) else {
                unreachable!("checked above");
            };
            Ok(array.remove(index))
        }
        HeapData::Table(table) => {
            if table.frozen() {
                return Err(RunError::new(ErrorKind::Frozen, "cannot mutate a frozen table"));
            }
            if table.locked() {
                return Err(RunError::new(
                    ErrorKind::MutatedWhileIterating,
                    "cannot mutate a table while iterating over it",
                ));
            }
            let slot = table.find(key, heap, interns)?;
            match slot.index {
                Some(index) => {
                    let HeapData::Table(table) = heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    let (old_key, old_value) = table.remove_at(index);
                    old_key.drop_with_heap(heap);
                    Ok(old_value)
                }
                None => Ok(Value::Nil),
            }
        }
        other => Err(RunError::type_error(format!(
            "delete target must be an array or table, not {}",
            other.type_of()
        ))),
    }
}

/// Maps an index to `0..len`. Negative indices count from the end.
pub(crate) fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len_i = i64::try_from(len).ok()?;
    let adjusted = if index < 0 { index + len_i } else { index };
    if (0..len_i).contains(&adjusted) {
        usize::try_from(adjusted).ok()
    } else {
        None
    }
}

pub(super) fn contains<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let (container, item) = take2(args, "contains", heap)?;
    let result = value::value_contains(&container, &item, heap, interns);
    container.drop_with_heap(heap);
    item.drop_with_heap(heap);
    result.map(Value::Bool)
}

pub(super) fn keys<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "keys", heap)?;
    let Value::Ref(id) = &value else {
        let message = format!("keys takes a table, not {}", value.type_of(heap));
        value.drop_with_heap(heap);
        return Err(RunError::type_error(message));
    };
    let id = *id;
    let HeapData::Table(table) = heap.get(id) else {
        let message = format!("keys takes a table, not {}", heap.get(id).type_of());
        value.drop_with_heap(heap);
        return Err(RunError::type_error(message));
    };
    let elems: Vec<Value> = table.entries().map(|e| e.key.raw_copy()).collect();
    retain_all(heap, &elems);
    let array = heap.allocate(HeapData::Array(Array::new(elems)))?;
    value.drop_with_heap(heap);
    Ok(Value::Ref(array))
}

pub(super) fn values<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "values", heap)?;
    let Value::Ref(id) = &value else {
        let message = format!("values takes a table or array, not {}", value.type_of(heap));
        value.drop_with_heap(heap);
        return Err(RunError::type_error(message));
    };
    let id = *id;
    let elems: Vec<Value> = match heap.get(id) {
        HeapData::Table(table) => table.entries().map(|e| e.value.raw_copy()).collect(),
        HeapData::Array(array) => array.as_slice().iter().map(Value::raw_copy).collect(),
        other => {
            let message = format!("values takes a table or array, not {}", other.type_of());
            value.drop_with_heap(heap);
            return Err(RunError::type_error(message));
        }
    };
    retain_all(heap, &elems);
    let array = heap.allocate(HeapData::Array(Array::new(elems)))?;
    value.drop_with_heap(heap);
    Ok(Value::Ref(array))
}

fn ref_ids(values: &[Value]) -> Vec<HeapId> {
    values
        .iter()
        .filter_map(|v| match v {
            Value::Ref(id) => Some(*id),
            _ => None,
        })
        .collect()
}

fn retain_all<T: ResourceTracker>(heap: &mut Heap<T>, values: &[Value]) {
    for id in ref_ids(values) {
        heap.inc_ref(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker)
    }

    fn arr(heap: &mut Heap<NoLimitTracker>, elems: Vec<Value>) -> Value {
        Value::Ref(heap.allocate(HeapData::Array(Array::new(elems))).unwrap())
    }

    #[test]
    fn len_of_array() {
        let mut heap = heap();
        let interns = Interns::default();
        let a = arr(&mut heap, vec![Value::Int(1), Value::Int(2)]);
        let args: ArgList = [a].into_iter().collect();
        assert_eq!(len(&mut heap, args, &interns).unwrap(), Value::Int(2));
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn clone_detaches_spine_but_aliases_elements() {
        let mut heap = heap();
        let inner = arr(&mut heap, vec![Value::Int(9)]);
        let Value::Ref(inner_id) = inner else { unreachable!() };
        let outer = arr(&mut heap, vec![inner]);
        let args: ArgList = [outer].into_iter().collect();
        let copy = clone(&mut heap, args).unwrap();
        let Value::Ref(copy_id) = &copy else {
            panic!("clone returns an array");
        };
        let HeapData::Array(copy_arr) = heap.get(*copy_id) else {
            panic!("clone returns an array");
        };
        // The inner array is aliased, not copied.
        assert_eq!(copy_arr.as_slice(), &[Value::Ref(inner_id)]);
        copy.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn frozen_array_rejects_push() {
        let mut heap = heap();
        let a = arr(&mut heap, vec![]);
        let args: ArgList = [a].into_iter().collect();
        let frozen = freeze(&mut heap, args).unwrap();
        let args: ArgList = [frozen, Value::Int(1)].into_iter().collect();
        let err = push(&mut heap, args).unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::Frozen);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn delete_returns_removed_value() {
        let mut heap = heap();
        let a = arr(&mut heap, vec![Value::Int(5), Value::Int(6)]);
        let interns = Interns::default();
        let args: ArgList = [a, Value::Int(0)].into_iter().collect();
        assert_eq!(delete(&mut heap, args, &interns).unwrap(), Value::Int(5));
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn negative_indices_count_from_end() {
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(-3, 3), Some(0));
        assert_eq!(normalize_index(-4, 3), None);
        assert_eq!(normalize_index(3, 3), None);
    }
}
