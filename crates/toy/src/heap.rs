//! The reference-counted heap arena.
//!
//! Heap values live in slots addressed by [`HeapId`]. Reference counting is
//! explicit: `Value` does not implement `Clone`, so every copy of a `Ref`
//! goes through [`Value::clone_with_heap`](crate::value::Value::clone_with_heap)
//! and every discard through `drop_with_heap`. Freeing is iterative (a
//! worklist, not recursion) so deep structures cannot blow the Rust stack.
//!
//! Reference cycles created through mutation are not collected; the spec's
//! depth guard reports cycles where they would otherwise cause unbounded
//! recursion (equality, hashing, display, clone).

use crate::{
    error::{ErrorKind, ErrorValue, RunError},
    function::{BoundMethod, Closure},
    resource::{ResourceError, ResourceTracker},
    types::{Array, Bytes, Range, Str, Table, ToyIter, Tuple, Type},
    value::Value,
};

/// Index of a live heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HeapId(usize);

impl HeapId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Every runtime value that lives in the arena.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(Str),
    Bytes(Bytes),
    Array(Array),
    Table(Table),
    Tuple(Tuple),
    Range(Range),
    /// A closure upvalue cell holding one mutable value. The defining frame
    /// and every capturing closure share the same cell.
    Cell(Value),
    Closure(Closure),
    BoundMethod(BoundMethod),
    /// A first-class error value.
    Error(ErrorValue),
    /// An open iteration; holds (and locks) its target container.
    Iter(ToyIter),
}

impl HeapData {
    /// The type tag this data reports to scripts.
    pub fn type_of(&self) -> Type {
        match self {
            Self::Str(_) => Type::String,
            Self::Bytes(_) => Type::Bytes,
            Self::Array(_) => Type::Array,
            Self::Table(_) => Type::Table,
            Self::Tuple(_) => Type::Tuple,
            Self::Range(_) => Type::Range,
            // A cell is invisible to scripts; it reports its content's kind
            // only in internal diagnostics.
            Self::Cell(_) => Type::Nil,
            Self::Closure(_) => Type::Function,
            Self::BoundMethod(_) => Type::BoundMethod,
            Self::Error(_) => Type::Error,
            Self::Iter(_) => Type::Iterator,
        }
    }

    /// Approximate payload size for resource accounting.
    fn estimate_size(&self) -> usize {
        let payload = match self {
            Self::Str(s) => s.estimate_size(),
            Self::Bytes(b) => b.estimate_size(),
            Self::Array(a) => a.estimate_size(),
            Self::Table(t) => t.estimate_size(),
            Self::Tuple(t) => t.estimate_size(),
            Self::Closure(c) => c.captures.len() * size_of::<HeapId>(),
            Self::Error(e) => e.message.len(),
            Self::Range(_) | Self::Cell(_) | Self::BoundMethod(_) | Self::Iter(_) => 0,
        };
        payload + size_of::<Slot>()
    }
}

#[derive(Debug)]
struct Slot {
    data: HeapData,
    refs: usize,
}

/// The arena. Generic over the resource tracker so unlimited execution
/// pays no accounting cost.
#[derive(Debug)]
pub(crate) struct Heap<T: ResourceTracker> {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    tracker: T,
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        Self::new(ErrorKind::OutOfMemory, err.message)
    }
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(tracker: T) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            tracker,
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Allocates a slot with an initial reference count of one.
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.on_allocate(data.estimate_size())?;
        let slot = Slot { data, refs: 1 };
        match self.free.pop() {
            Some(index) => {
                debug_assert!(self.slots[index].is_none(), "free list entry still occupied");
                self.slots[index] = Some(slot);
                Ok(HeapId(index))
            }
            None => {
                let index = self.slots.len();
                self.slots.push(Some(slot));
                Ok(HeapId(index))
            }
        }
    }

    /// Increments the reference count of a live slot.
    #[inline]
    pub fn inc_ref(&mut self, id: HeapId) {
        let slot = self.slots[id.0].as_mut().expect("inc_ref on freed heap slot");
        slot.refs += 1;
    }

    /// Decrements a reference count, freeing the slot — and, iteratively,
    /// everything it solely owned — when it reaches zero.
    pub fn dec_ref(&mut self, id: HeapId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let slot = self.slots[id.0].as_mut().expect("dec_ref on freed heap slot");
            debug_assert!(slot.refs > 0, "reference count underflow");
            slot.refs -= 1;
            if slot.refs > 0 {
                continue;
            }
            let slot = self.slots[id.0].take().expect("slot verified live above");
            self.tracker.on_free(slot.data.estimate_size());
            self.free.push(id.0);
            self.release_children(slot.data, &mut pending);
        }
    }

    /// Pushes the heap ids owned by `data` onto the free worklist,
    /// releasing iterator locks first.
    fn release_children(&mut self, data: HeapData, pending: &mut Vec<HeapId>) {
        fn push_value(value: Value, pending: &mut Vec<HeapId>) {
            if let Value::Ref(id) = value {
                pending.push(id);
            }
        }

        match data {
            HeapData::Str(_) | HeapData::Bytes(_) | HeapData::Range(_) | HeapData::Error(_) => {}
            HeapData::Array(mut array) => {
                for value in array.drain_elems() {
                    push_value(value, pending);
                }
            }
            HeapData::Tuple(mut tuple) => {
                for value in tuple.drain_elems() {
                    push_value(value, pending);
                }
            }
            HeapData::Table(mut table) => {
                for (key, value) in table.drain_entries() {
                    push_value(key, pending);
                    push_value(value, pending);
                }
            }
            HeapData::Cell(value) => push_value(value, pending),
            HeapData::Closure(closure) => pending.extend(closure.captures),
            HeapData::BoundMethod(method) => {
                push_value(method.callable, pending);
                push_value(method.receiver, pending);
            }
            HeapData::Iter(iter) => {
                if let Some(target) = iter.target_id() {
                    // The iteration ends here: release the mutation lock
                    // before the target itself is released.
                    match self.get_mut(target) {
                        HeapData::Array(array) => array.unlock(),
                        HeapData::Table(table) => table.unlock(),
                        HeapData::Bytes(bytes) => bytes.unlock(),
                        _ => {}
                    }
                    pending.push(target);
                }
            }
        }
    }

    /// Borrows a live slot.
    ///
    /// # Panics
    /// Panics on a freed slot — that is a reference-counting bug, not a
    /// recoverable condition.
    #[inline]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.slots[id.0].as_ref().expect("get on freed heap slot").data
    }

    /// Mutably borrows a live slot.
    #[inline]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.slots[id.0].as_mut().expect("get_mut on freed heap slot").data
    }

    /// Current reference count; used by tests.
    #[cfg(test)]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.slots[id.0].as_ref().map_or(0, |s| s.refs)
    }

    /// Number of live slots; used by tests as a leak check.
    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// Releasing a whole collection of values against the heap.
pub(crate) trait DropWithHeap<T: ResourceTracker> {
    fn drop_with_heap(self, heap: &mut Heap<T>);
}

impl<T: ResourceTracker, I: IntoIterator<Item = Value>> DropWithHeap<T> for I {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{LimitedTracker, NoLimitTracker};

    #[test]
    fn alloc_and_free_reuses_slots() {
        let mut heap = Heap::new(NoLimitTracker);
        let a = heap.allocate(HeapData::Str(Str::new("a"))).unwrap();
        heap.dec_ref(a);
        let b = heap.allocate(HeapData::Str(Str::new("b"))).unwrap();
        assert_eq!(a.index(), b.index());
        heap.dec_ref(b);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn freeing_a_container_releases_children() {
        let mut heap = Heap::new(NoLimitTracker);
        let child = heap.allocate(HeapData::Str(Str::new("child"))).unwrap();
        let parent = heap
            .allocate(HeapData::Array(Array::new(vec![Value::Ref(child)])))
            .unwrap();
        assert_eq!(heap.refcount(child), 1);
        heap.dec_ref(parent);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn shared_child_survives_one_parent() {
        let mut heap = Heap::new(NoLimitTracker);
        let child = heap.allocate(HeapData::Str(Str::new("shared"))).unwrap();
        heap.inc_ref(child);
        let p1 = heap
            .allocate(HeapData::Array(Array::new(vec![Value::Ref(child)])))
            .unwrap();
        let p2 = heap
            .allocate(HeapData::Array(Array::new(vec![Value::Ref(child)])))
            .unwrap();
        heap.dec_ref(p1);
        assert_eq!(heap.refcount(child), 1);
        heap.dec_ref(p2);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn deep_nesting_frees_iteratively() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut inner = heap.allocate(HeapData::Array(Array::new(Vec::new()))).unwrap();
        for _ in 0..10_000 {
            inner = heap
                .allocate(HeapData::Array(Array::new(vec![Value::Ref(inner)])))
                .unwrap();
        }
        heap.dec_ref(inner);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn tracker_limits_are_enforced() {
        let mut heap = Heap::new(LimitedTracker::new(2, usize::MAX));
        let _a = heap.allocate(HeapData::Str(Str::new("a"))).unwrap();
        let _b = heap.allocate(HeapData::Str(Str::new("b"))).unwrap();
        assert!(heap.allocate(HeapData::Str(Str::new("c"))).is_err());
    }
}
