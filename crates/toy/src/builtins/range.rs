//! The `range` builtin.

use super::{ArgList, take_between};
use crate::{
    error::{RunError, RunResult},
    heap::{DropWithHeap, Heap, HeapData},
    resource::ResourceTracker,
    types::Range,
    value::Value,
};

/// `range(stop)`, `range(start, stop)`, or `range(start, stop, step)`.
/// The step must be a positive int.
pub(super) fn range<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let args = take_between(args, "range", 1, 3, heap)?;
    let mut ints = [0_i64; 3];
    let count = args.len();
    for (slot, value) in ints.iter_mut().zip(args.iter()) {
        match value.as_int() {
            Some(i) => *slot = i,
            None => {
                let type_name = value.type_of(heap);
                args.drop_with_heap(heap);
                return Err(RunError::type_error(format!(
                    "range arguments must be ints, not {type_name}"
                )));
            }
        }
    }

    let (start, stop, step) = match count {
        1 => (0, ints[0], 1),
        2 => (ints[0], ints[1], 1),
        _ => (ints[0], ints[1], ints[2]),
    };
    if step <= 0 {
        return Err(RunError::value("range step must be a positive int"));
    }
    let id = heap.allocate(HeapData::Range(Range::new(start, stop, step)))?;
    Ok(Value::Ref(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, resource::NoLimitTracker};

    #[test]
    fn single_argument_counts_from_zero() {
        let mut heap = Heap::new(NoLimitTracker);
        let value = range(&mut heap, [Value::Int(3)].into_iter().collect()).unwrap();
        let Value::Ref(id) = &value else {
            panic!("range returns a heap value");
        };
        let HeapData::Range(r) = heap.get(*id) else {
            panic!("range returns a range");
        };
        assert_eq!((r.start(), r.stop(), r.step()), (0, 3, 1));
        value.drop_with_heap(&mut heap);
    }

    #[test]
    fn non_positive_step_is_rejected() {
        let mut heap = Heap::new(NoLimitTracker);
        let args: ArgList = [Value::Int(0), Value::Int(10), Value::Int(-2)].into_iter().collect();
        let err = range(&mut heap, args).unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::ValueError);
    }
}
