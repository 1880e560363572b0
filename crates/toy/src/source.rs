//! Source buffers and position resolution.
//!
//! All compiled source text lives in a [`FileSet`]. Every token, AST node,
//! and bytecode location carries a [`Pos`]: an opaque `u32` offset into the
//! file set's global address space. Offsets are only resolved back to
//! `(file, line, column)` when a diagnostic or backtrace is rendered, so the
//! hot paths never touch line tables.

use std::fmt;

/// An opaque position inside a [`FileSet`].
///
/// `Pos::NONE` marks synthesized nodes with no source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pos(u32);

impl Pos {
    /// Sentinel for nodes without a source location.
    pub const NONE: Self = Self(0);

    /// Returns true when this position refers to real source text.
    #[must_use]
    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

/// A resolved human-readable source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// File name as registered with the file set.
    pub name: String,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number (in characters, not bytes).
    pub column: u32,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.name, self.line, self.column)
    }
}

/// One registered source file: its name, text, base offset, and line starts.
#[derive(Debug)]
struct SourceFile {
    name: String,
    /// First global offset belonging to this file. Global offset 0 is
    /// reserved for `Pos::NONE`, so bases start at 1.
    base: u32,
    text: String,
    /// Byte offset (file-local) of the start of each line.
    line_starts: Vec<u32>,
}

impl SourceFile {
    fn new(name: String, base: u32, text: String) -> Self {
        let mut line_starts = vec![0];
        for (idx, byte) in text.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(u32::try_from(idx + 1).expect("source file exceeds u32 range"));
            }
        }
        Self {
            name,
            base,
            text,
            line_starts,
        }
    }

    fn len(&self) -> u32 {
        u32::try_from(self.text.len()).expect("source file exceeds u32 range")
    }

    fn contains(&self, pos: Pos) -> bool {
        pos.0 >= self.base && pos.0 <= self.base + self.len()
    }

    /// Resolves a file-local byte offset to a 1-based line/column pair.
    fn line_column(&self, local: u32) -> (u32, u32) {
        let line_idx = match self.line_starts.binary_search(&local) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = self.line_starts[line_idx] as usize;
        let upto = &self.text[line_start..local as usize];
        let column = u32::try_from(upto.chars().count()).unwrap_or(u32::MAX) + 1;
        (u32::try_from(line_idx).unwrap_or(u32::MAX) + 1, column)
    }
}

/// Owns every source buffer of a compilation and maps positions back to
/// file/line/column.
///
/// Files occupy disjoint, monotonically increasing offset ranges, so a
/// `Pos` never aliases between two files.
#[derive(Debug, Default)]
pub struct FileSet {
    files: Vec<SourceFile>,
    next_base: u32,
}

impl FileSet {
    /// Creates an empty file set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            // Offset 0 is Pos::NONE.
            next_base: 1,
        }
    }

    /// Registers a file and returns its base position.
    ///
    /// # Panics
    /// Panics if the combined source size exceeds the `u32` offset space.
    pub fn add_file(&mut self, name: &str, text: String) -> FileId {
        let base = self.next_base;
        let file = SourceFile::new(name.to_owned(), base, text);
        self.next_base = base
            .checked_add(file.len() + 1)
            .expect("file set exceeds u32 offset space");
        let id = FileId(self.files.len());
        self.files.push(file);
        id
    }

    /// Returns the source text of a registered file.
    #[must_use]
    pub fn text(&self, id: FileId) -> &str {
        &self.files[id.0].text
    }

    /// Converts a file-local byte offset into a global position.
    #[must_use]
    pub fn pos(&self, id: FileId, local_offset: u32) -> Pos {
        Pos(self.files[id.0].base + local_offset)
    }

    /// Resolves a global position to file/line/column.
    ///
    /// Returns `None` for `Pos::NONE` or positions outside every file.
    #[must_use]
    pub fn position(&self, pos: Pos) -> Option<Position> {
        if !pos.is_some() {
            return None;
        }
        let file = self.files.iter().find(|f| f.contains(pos))?;
        let (line, column) = file.line_column(pos.0 - file.base);
        Some(Position {
            name: file.name.clone(),
            line,
            column,
        })
    }
}

/// Identifier of a file inside a [`FileSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_line_and_column() {
        let mut set = FileSet::new();
        let id = set.add_file("a.toy", "one\ntwo\nthree".to_owned());
        let pos = set.pos(id, 4); // start of "two"
        let resolved = set.position(pos).unwrap();
        assert_eq!(resolved.line, 2);
        assert_eq!(resolved.column, 1);
        assert_eq!(resolved.name, "a.toy");
    }

    #[test]
    fn columns_count_chars_not_bytes() {
        let mut set = FileSet::new();
        let id = set.add_file("u.toy", "héllo x".to_owned());
        // Byte offset of 'x' is 7 because 'é' is two bytes.
        let resolved = set.position(set.pos(id, 7)).unwrap();
        assert_eq!(resolved.line, 1);
        assert_eq!(resolved.column, 7);
    }

    #[test]
    fn files_never_alias() {
        let mut set = FileSet::new();
        let a = set.add_file("a.toy", "aaa".to_owned());
        let b = set.add_file("b.toy", "bbb".to_owned());
        let pa = set.position(set.pos(a, 0)).unwrap();
        let pb = set.position(set.pos(b, 0)).unwrap();
        assert_eq!(pa.name, "a.toy");
        assert_eq!(pb.name, "b.toy");
    }

    #[test]
    fn none_position_resolves_to_none() {
        let set = FileSet::new();
        assert_eq!(set.position(Pos::NONE), None);
    }
}
