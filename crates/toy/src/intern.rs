//! String interning.
//!
//! Every string literal, identifier-derived field name, and function name is
//! interned once during compilation and referred to by a [`StringId`]
//! afterwards, so bytecode operands and constant-pool entries are plain
//! `u32` indices. The builder deduplicates; the frozen [`Interns`] table is
//! read-only during execution and lookups happen only for error messages,
//! display output, and field access.

use ahash::AHashMap;

/// Index into the string interner's storage.
///
/// `u32` keeps constant-pool entries and bytecode operands small.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct StringId(u32);

impl StringId {
    /// Reconstructs a StringId from a bytecode operand.
    #[inline]
    pub fn from_index(index: u16) -> Self {
        Self(u32::from(index))
    }

    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Mutable interner used while compiling.
#[derive(Debug, Default, Clone)]
pub(crate) struct InternerBuilder {
    strings: Vec<String>,
    lookup: AHashMap<String, u32>,
}

impl InternerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its stable id.
    pub fn intern(&mut self, value: &str) -> StringId {
        if let Some(&id) = self.lookup.get(value) {
            return StringId(id);
        }
        let id = u32::try_from(self.strings.len()).expect("interner exceeds u32 range");
        self.strings.push(value.to_owned());
        self.lookup.insert(value.to_owned(), id);
        StringId(id)
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Freezes the builder into a read-only table.
    pub fn build(self) -> Interns {
        Interns { strings: self.strings }
    }
}

/// Read-only interned string table owned by a compiled program.
#[derive(Debug, Default, Clone)]
pub(crate) struct Interns {
    strings: Vec<String>,
}

impl Interns {
    /// Returns the interned string for an id.
    #[inline]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates() {
        let mut builder = InternerBuilder::new();
        let a = builder.intern("hello");
        let b = builder.intern("world");
        let c = builder.intern("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn cloned_builder_keeps_ids_stable() {
        let mut builder = InternerBuilder::new();
        let a = builder.intern("alpha");
        // A REPL session snapshots the builder per evaluation; ids from
        // earlier chunks stay valid in every later snapshot.
        let interns = builder.clone().build();
        assert_eq!(interns.get(a), "alpha");
        let b = builder.intern("beta");
        assert_eq!(builder.clone().build().get(b), "beta");
        assert_ne!(a, b);
    }
}
