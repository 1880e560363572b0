//! `min` and `max` over arguments or a single array.

use std::cmp::Ordering;

use super::ArgList;
use crate::{
    error::{RunError, RunResult},
    heap::{DropWithHeap, Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    value::{self, Value},
};

pub(crate) fn min<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    select(heap, args, interns, Ordering::Less, "min")
}

pub(crate) fn max<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    select(heap, args, interns, Ordering::Greater, "max")
}

fn select<T: ResourceTracker>(
    heap: &mut Heap<T>,
    args: ArgList,
    interns: &Interns,
    want: Ordering,
    name: &str,
) -> RunResult<Value> {
    // A single array argument selects over its elements.
    let single_array = args.len() == 1
        && matches!(&args[0], Value::Ref(id) if matches!(heap.get(*id), HeapData::Array(_)));
    let candidates: Vec<Value> = if single_array {
        let copies: Vec<Value> = {
            let Value::Ref(id) = &args[0] else {
                unreachable!("checked above");
            };
            let HeapData::Array(array) = heap.get(*id) else {
                unreachable!("checked above");
            };
            array.as_slice().iter().map(Value::raw_copy).collect()
        };
        let ids: Vec<_> = copies
            .iter()
            .filter_map(|v| match v {
                Value::Ref(id) => Some(*id),
                _ => None,
            })
            .collect();
        for id in ids {
            heap.inc_ref(id);
        }
        args.drop_with_heap(heap);
        copies
    } else {
        args.into_iter().collect()
    };

    if candidates.is_empty() {
        return Err(RunError::value(format!("{name} of an empty sequence")));
    }

    let mut best: usize = 0;
    for i in 1..candidates.len() {
        match value::value_cmp(&candidates[i], &candidates[best], heap, interns) {
            Some(ord) if ord == want => best = i,
            Some(_) => {}
            None => {
                let left = candidates[i].type_of(heap);
                let right = candidates[best].type_of(heap);
                candidates.drop_with_heap(heap);
                return Err(RunError::type_error(format!("{name}: cannot compare {left} and {right}")));
            }
        }
    }

    let mut result = Value::Nil;
    for (i, candidate) in candidates.into_iter().enumerate() {
        if i == best {
            result = candidate;
        } else {
            candidate.drop_with_heap(heap);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resource::NoLimitTracker, types::Array};

    #[test]
    fn min_of_args() {
        let mut heap = Heap::new(NoLimitTracker);
        let interns = Interns::default();
        let args: ArgList = [Value::Int(3), Value::Float(1.5), Value::Int(2)].into_iter().collect();
        assert_eq!(min(&mut heap, args, &interns).unwrap(), Value::Float(1.5));
    }

    #[test]
    fn max_of_array() {
        let mut heap = Heap::new(NoLimitTracker);
        let interns = Interns::default();
        let arr = heap
            .allocate(HeapData::Array(Array::new(vec![Value::Int(4), Value::Int(9), Value::Int(7)])))
            .unwrap();
        let args: ArgList = [Value::Ref(arr)].into_iter().collect();
        assert_eq!(max(&mut heap, args, &interns).unwrap(), Value::Int(9));
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn incomparable_is_type_error() {
        let mut heap = Heap::new(NoLimitTracker);
        let interns = Interns::default();
        let args: ArgList = [Value::Int(1), Value::Nil].into_iter().collect();
        assert!(min(&mut heap, args, &interns).is_err());
    }
}
