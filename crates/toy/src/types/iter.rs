//! Iterator objects for `for`-`in` loops.
//!
//! Iterators are index-based state machines rather than Rust iterators so
//! advancing can take `&mut Heap` for cloning elements. Opening an iterator
//! over a mutable container takes out an iteration lock; the lock is
//! released when the iterator is freed (loop exit drops the iterator's
//! hidden local, unwinding drops the frame's locals — both paths end here).
//!
//! Strings and ranges are copied into the iterator up front, so iterating
//! them holds no lock and no heap reference.

use crate::{
    error::{ErrorKind, RunError, RunResult},
    heap::{Heap, HeapData, HeapId},
    intern::Interns,
    resource::ResourceTracker,
    types::Range,
    value::Value,
};

/// Type-specific iteration target.
#[derive(Debug)]
pub(crate) enum IterTarget {
    /// Iterates elements; the id is a strong, locked reference.
    Array(HeapId),
    /// Iterates entries in insertion order; strong, locked reference.
    Table(HeapId),
    /// Iterates elements; strong reference (tuples are immutable).
    Tuple(HeapId),
    /// Iterates bytes as ints; strong, locked reference.
    Bytes(HeapId),
    /// Iterates chars of a copied string; `byte` is the current offset.
    Str { content: String, byte: usize },
    /// Iterates the values of a copied range.
    Range(Range),
}

/// Iteration state for one `for`-`in` loop (or the `values` builtin).
#[derive(Debug)]
pub(crate) struct ToyIter {
    /// Elements yielded so far; the key for pair iteration of sequences.
    index: usize,
    target: IterTarget,
}

impl ToyIter {
    /// Builds an iterator over `value`, taking ownership of it.
    ///
    /// Mutable containers get their iteration lock incremented here; the
    /// matching unlock happens when the heap frees the iterator.
    pub fn new<T: ResourceTracker>(value: Value, heap: &mut Heap<T>, interns: &Interns) -> RunResult<Self> {
        let target = match &value {
            Value::InternString(id) => {
                let content = interns.get(*id).to_owned();
                IterTarget::Str { content, byte: 0 }
            }
            Value::Ref(id) => {
                let id = *id;
                match heap.get(id) {
                    HeapData::Array(_) => {
                        let HeapData::Array(array) = heap.get_mut(id) else {
                            unreachable!("checked above");
                        };
                        array.lock();
                        IterTarget::Array(id)
                    }
                    HeapData::Table(_) => {
                        let HeapData::Table(table) = heap.get_mut(id) else {
                            unreachable!("checked above");
                        };
                        table.lock();
                        IterTarget::Table(id)
                    }
                    HeapData::Bytes(_) => {
                        let HeapData::Bytes(bytes) = heap.get_mut(id) else {
                            unreachable!("checked above");
                        };
                        bytes.lock();
                        IterTarget::Bytes(id)
                    }
                    HeapData::Tuple(_) => IterTarget::Tuple(id),
                    HeapData::Str(s) => {
                        let content = s.as_str().to_owned();
                        value.drop_with_heap(heap);
                        return Ok(Self {
                            index: 0,
                            target: IterTarget::Str { content, byte: 0 },
                        });
                    }
                    HeapData::Range(range) => {
                        let range = *range;
                        value.drop_with_heap(heap);
                        return Ok(Self {
                            index: 0,
                            target: IterTarget::Range(range),
                        });
                    }
                    other => {
                        let type_name = other.type_of().to_string();
                        value.drop_with_heap(heap);
                        return Err(RunError::new(
                            ErrorKind::NotIterable,
                            format!("{type_name} is not iterable"),
                        ));
                    }
                }
            }
            other => {
                return Err(RunError::new(
                    ErrorKind::NotIterable,
                    format!("{} is not iterable", other.type_of(heap)),
                ));
            }
        };
        Ok(Self { index: 0, target })
    }

    /// Heap id of the container this iterator holds alive, if any.
    pub fn target_id(&self) -> Option<HeapId> {
        match self.target {
            IterTarget::Array(id) | IterTarget::Table(id) | IterTarget::Tuple(id) | IterTarget::Bytes(id) => Some(id),
            IterTarget::Str { .. } | IterTarget::Range(_) => None,
        }
    }

    /// Advances, yielding the single-variable form: elements for sequences,
    /// keys for tables.
    pub fn next_single<T: ResourceTracker>(&mut self, heap: &mut Heap<T>) -> Option<Value> {
        match &mut self.target {
            IterTarget::Table(id) => {
                let key = {
                    let HeapData::Table(table) = heap.get(*id) else {
                        unreachable!("iterator target is a table");
                    };
                    table.entry(self.index)?.key.raw_copy()
                };
                self.index += 1;
                Some(key.retained(heap))
            }
            _ => self.next_pair(heap).map(|(key, value)| {
                key.drop_with_heap(heap);
                value
            }),
        }
    }

    /// Advances, yielding `(index-or-key, value)`.
    pub fn next_pair<T: ResourceTracker>(&mut self, heap: &mut Heap<T>) -> Option<(Value, Value)> {
        let index_value = Value::Int(i64::try_from(self.index).unwrap_or(i64::MAX));
        match &mut self.target {
            IterTarget::Array(id) => {
                let elem = {
                    let HeapData::Array(array) = heap.get(*id) else {
                        unreachable!("iterator target is an array");
                    };
                    array.get(self.index)?.raw_copy()
                };
                self.index += 1;
                Some((index_value, elem.retained(heap)))
            }
            IterTarget::Tuple(id) => {
                let elem = {
                    let HeapData::Tuple(tuple) = heap.get(*id) else {
                        unreachable!("iterator target is a tuple");
                    };
                    tuple.get(self.index)?.raw_copy()
                };
                self.index += 1;
                Some((index_value, elem.retained(heap)))
            }
            IterTarget::Table(id) => {
                let (key, value) = {
                    let HeapData::Table(table) = heap.get(*id) else {
                        unreachable!("iterator target is a table");
                    };
                    let entry = table.entry(self.index)?;
                    (entry.key.raw_copy(), entry.value.raw_copy())
                };
                self.index += 1;
                let key = key.retained(heap);
                let value = value.retained(heap);
                Some((key, value))
            }
            IterTarget::Bytes(id) => {
                let HeapData::Bytes(bytes) = heap.get(*id) else {
                    unreachable!("iterator target is bytes");
                };
                let byte = bytes.get(self.index)?;
                self.index += 1;
                Some((index_value, Value::Int(i64::from(byte))))
            }
            IterTarget::Str { content, byte } => {
                let ch = content[*byte..].chars().next()?;
                *byte += ch.len_utf8();
                self.index += 1;
                Some((index_value, Value::Char(ch)))
            }
            IterTarget::Range(range) => {
                let value = range.get(self.index)?;
                self.index += 1;
                Some((index_value, Value::Int(value)))
            }
        }
    }
}

/// One step of an iterator that lives on the heap.
///
/// The iterator is taken out of its slot for the duration of the step (a
/// cheap placeholder fills the slot) so advancing can borrow the heap
/// mutably for element clones, then it is put back. The iterator never
/// reads its own slot, so the placeholder is unobservable.
pub(crate) fn advance_iter<T: ResourceTracker>(
    heap: &mut Heap<T>,
    iter_id: HeapId,
    pair: bool,
) -> Option<(Value, Option<Value>)> {
    let slot = heap.get_mut(iter_id);
    let HeapData::Iter(mut iter) = std::mem::replace(slot, HeapData::Range(Range::new(0, 0, 1))) else {
        unreachable!("advance target is an iterator");
    };
    let step = if pair {
        iter.next_pair(heap).map(|(k, v)| (k, Some(v)))
    } else {
        iter.next_single(heap).map(|v| (v, None))
    };
    *heap.get_mut(iter_id) = HeapData::Iter(iter);
    step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resource::NoLimitTracker, types::Array};

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker)
    }

    #[test]
    fn array_iteration_yields_index_value_pairs() {
        let mut heap = heap();
        let interns = Interns::default();
        let id = heap
            .allocate(HeapData::Array(Array::new(vec![Value::Int(10), Value::Int(20)])))
            .unwrap();
        let mut iter = ToyIter::new(Value::Ref(id), &mut heap, &interns).unwrap();
        assert_eq!(iter.next_pair(&mut heap), Some((Value::Int(0), Value::Int(10))));
        assert_eq!(iter.next_pair(&mut heap), Some((Value::Int(1), Value::Int(20))));
        assert_eq!(iter.next_pair(&mut heap), None);
    }

    #[test]
    fn array_is_locked_while_iterating() {
        let mut heap = heap();
        let interns = Interns::default();
        let id = heap
            .allocate(HeapData::Array(Array::new(vec![Value::Int(1)])))
            .unwrap();
        heap.inc_ref(id);
        let iter = ToyIter::new(Value::Ref(id), &mut heap, &interns).unwrap();
        let HeapData::Array(array) = heap.get(id) else {
            unreachable!();
        };
        assert!(array.locked());
        // Freeing the iterator's reference releases the lock.
        let iter_id = heap.allocate(HeapData::Iter(iter)).unwrap();
        heap.dec_ref(iter_id);
        let HeapData::Array(array) = heap.get(id) else {
            unreachable!();
        };
        assert!(!array.locked());
        heap.dec_ref(id);
    }

    #[test]
    fn string_iteration_yields_chars() {
        let mut heap = heap();
        let interns = Interns::default();
        let id = heap.allocate(HeapData::Str(crate::types::Str::new("héj"))).unwrap();
        let mut iter = ToyIter::new(Value::Ref(id), &mut heap, &interns).unwrap();
        assert_eq!(iter.next_single(&mut heap), Some(Value::Char('h')));
        assert_eq!(iter.next_single(&mut heap), Some(Value::Char('é')));
        assert_eq!(iter.next_single(&mut heap), Some(Value::Char('j')));
        assert_eq!(iter.next_single(&mut heap), None);
    }

    #[test]
    fn range_iteration() {
        let mut heap = heap();
        let interns = Interns::default();
        let id = heap.allocate(HeapData::Range(Range::new(0, 6, 2))).unwrap();
        let mut iter = ToyIter::new(Value::Ref(id), &mut heap, &interns).unwrap();
        let mut out = Vec::new();
        while let Some(v) = iter.next_single(&mut heap) {
            out.push(v);
        }
        assert_eq!(out, vec![Value::Int(0), Value::Int(2), Value::Int(4)]);
    }

    #[test]
    fn non_iterable_errors() {
        let mut heap = heap();
        let interns = Interns::default();
        let err = ToyIter::new(Value::Int(3), &mut heap, &interns).unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::NotIterable);
    }
}
