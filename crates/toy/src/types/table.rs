//! Insertion-ordered tables.
//!
//! # Storage strategy
//!
//! A `HashTable<usize>` maps key hashes to indices in a dense `Vec` of
//! entries, so lookups are O(1) while iteration follows insertion order.
//! Key hashing and equality go through the value model (and may read other
//! heap objects), so the find step borrows the heap immutably and the
//! mutation step runs afterwards on the entry vector alone.
//!
//! # Reference counting
//!
//! Entries own one reference to each key and value. `set_found` and
//! `remove_at` hand replaced/removed values back to the caller, which must
//! release them against the heap.

use hashbrown::HashTable;

use crate::{
    error::RunResult,
    heap::Heap,
    intern::Interns,
    resource::ResourceTracker,
    value::{self, Value},
};

/// One key/value slot of a table.
#[derive(Debug)]
pub(crate) struct TableEntry {
    pub key: Value,
    pub value: Value,
    /// Cached key hash, needed to maintain the index on rebuilds.
    hash: u64,
}

/// An insertion-ordered mutable mapping with hashable keys.
#[derive(Debug, Default)]
pub(crate) struct Table {
    indices: HashTable<usize>,
    entries: Vec<TableEntry>,
    frozen: bool,
    locks: u32,
}

/// Result of [`Table::find`]: the key's hash and its entry index if present.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeySlot {
    pub hash: u64,
    pub index: Option<usize>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            indices: HashTable::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
            frozen: false,
            locks: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn locked(&self) -> bool {
        self.locks > 0
    }

    pub fn lock(&mut self) {
        self.locks += 1;
    }

    pub fn unlock(&mut self) {
        debug_assert!(self.locks > 0, "unlock without matching lock");
        self.locks = self.locks.saturating_sub(1);
    }

    /// Locates `key`: computes its hash and finds the entry index, if any.
    ///
    /// Fails when the key is not hashable. Pure lookup — the heap is only
    /// read, so this can run while the table itself is borrowed from it.
    pub fn find<T: ResourceTracker>(&self, key: &Value, heap: &Heap<T>, interns: &Interns) -> RunResult<KeySlot> {
        let hash = value::key_hash(key, heap, interns)?;
        let index = self
            .indices
            .find(hash, |&i| {
                self.entries[i].hash == hash && value::value_eq(&self.entries[i].key, key, heap, interns)
            })
            .copied();
        Ok(KeySlot { hash, index })
    }

    /// Inserts or replaces at a slot located by [`Table::find`].
    ///
    /// Takes ownership of `key` and `value`. On replacement the table keeps
    /// its existing key (preserving first-insertion order) and returns the
    /// duplicate key and the old value so the caller can release them.
    pub fn set_found(&mut self, slot: KeySlot, key: Value, value: Value) -> Option<(Value, Value)> {
        match slot.index {
            Some(index) => {
                let entry = &mut self.entries[index];
                let old_value = std::mem::replace(&mut entry.value, value);
                Some((key, old_value))
            }
            None => {
                let index = self.entries.len();
                self.entries.push(TableEntry {
                    key,
                    value,
                    hash: slot.hash,
                });
                self.indices
                    .insert_unique(slot.hash, index, |&i| self.entries[i].hash);
                None
            }
        }
    }

    /// Removes the entry at `index`, returning its key and value.
    ///
    /// Later entries shift down, so the hash index is rebuilt.
    pub fn remove_at(&mut self, index: usize) -> (Value, Value) {
        let entry = self.entries.remove(index);
        self.rebuild_indices();
        (entry.key, entry.value)
    }

    fn rebuild_indices(&mut self) {
        self.indices.clear();
        for (index, entry) in self.entries.iter().enumerate() {
            let hash = entry.hash;
            self.indices.insert_unique(hash, index, |&i| self.entries[i].hash);
        }
    }

    /// Entry at a dense position, in insertion order.
    pub fn entry(&self, index: usize) -> Option<&TableEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TableEntry> {
        self.entries.iter()
    }

    /// Copies the table's spine: raw key/value copies with cached hashes
    /// and a rebuilt index. The caller must retain every heap reference in
    /// the returned table before sharing it.
    pub fn duplicate(&self) -> Self {
        let mut copy = Self::with_capacity(self.entries.len());
        for entry in &self.entries {
            copy.entries.push(TableEntry {
                key: entry.key.raw_copy(),
                value: entry.value.raw_copy(),
                hash: entry.hash,
            });
        }
        copy.rebuild_indices();
        copy
    }

    /// Takes every key/value out, leaving the table empty. Used when
    /// freeing the containing heap slot.
    pub fn drain_entries(&mut self) -> Vec<(Value, Value)> {
        self.indices.clear();
        self.entries.drain(..).map(|e| (e.key, e.value)).collect()
    }

    pub fn estimate_size(&self) -> usize {
        self.entries.len() * (size_of::<TableEntry>() + size_of::<usize>())
    }
}
