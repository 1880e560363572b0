//! Identifier resolution: globals, locals, free variables, builtins.
//!
//! The table is a stack of function frames, each holding a stack of block
//! scopes. Resolving a name that lives in an enclosing function promotes it
//! to a *free variable* of every function in between (so each closure frame
//! carries exactly the captures it needs) and flags the defining local as
//! cell-allocated, which the code builder later uses to rewrite plain local
//! accesses into cell accesses.

use ahash::AHashMap;

use crate::source::Pos;

/// Where a resolved name lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolScope {
    Global,
    Local,
    Free,
    Builtin,
}

/// A resolved reference to a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Symbol {
    pub scope: SymbolScope,
    pub index: u16,
    /// For locals: whether the slot is accessed through a heap cell because
    /// a nested function captures it. Free variables are always cells.
    pub cell: bool,
}

/// How a closure obtains one captured variable from its defining frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Capture {
    /// The cell sits in a local slot of the directly enclosing function.
    Local(u16),
    /// The cell is itself a capture of the directly enclosing function.
    Free(u16),
}

/// Everything the compiler needs about a function scope once it closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FunctionScope {
    /// Total number of local slots (parameters included).
    pub num_locals: u16,
    /// Local slots that must be wrapped in cells at frame entry.
    pub cell_slots: Vec<u16>,
    /// Capture descriptors, in free-variable index order, resolved against
    /// the enclosing function.
    pub captures: Vec<Capture>,
}

#[derive(Debug)]
struct LocalInfo {
    cell: bool,
}

#[derive(Debug, Default)]
struct Frame {
    /// Block scopes, innermost last. Values are local slots (or global
    /// slots for the outermost frame).
    blocks: Vec<AHashMap<String, u16>>,
    /// Per-slot metadata, indexed by slot. Unused for the global frame.
    locals: Vec<LocalInfo>,
    /// Monotonic local slot counter; slots are never reused within a
    /// function, so sibling blocks get distinct slots.
    next_slot: u16,
    /// Free variables registered so far: name → free index.
    free_map: AHashMap<String, u16>,
    /// Capture descriptor for each free variable, by free index.
    captures: Vec<Capture>,
}

impl Frame {
    fn new() -> Self {
        Self {
            blocks: vec![AHashMap::new()],
            ..Self::default()
        }
    }

    /// Looks a name up in the lexically visible blocks, innermost first.
    fn lookup(&self, name: &str) -> Option<u16> {
        self.blocks.iter().rev().find_map(|block| block.get(name).copied())
    }

    fn add_free(&mut self, name: &str, capture: Capture) -> u16 {
        if let Some(&idx) = self.free_map.get(name) {
            return idx;
        }
        let idx = u16::try_from(self.captures.len()).expect("free variable count exceeds u16");
        self.captures.push(capture);
        self.free_map.insert(name.to_owned(), idx);
        idx
    }
}

/// Scopes taken out by [`SymbolTable::detach_scopes`], to be restored
/// after an imported module compiles.
#[derive(Debug)]
pub(crate) struct DetachedScopes {
    frames: Vec<Frame>,
}

/// Error returned by [`SymbolTable::define`] on a duplicate name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Redeclaration {
    pub name: String,
    pub pos: Pos,
}

/// The scope tree. Frame 0 is the global frame; further frames are entered
/// per function literal.
#[derive(Debug)]
pub(crate) struct SymbolTable {
    frames: Vec<Frame>,
    /// Universe builtins: name → builtin table index.
    builtins: AHashMap<String, u16>,
    num_globals: u16,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::new()],
            builtins: AHashMap::new(),
            num_globals: 0,
        }
    }

    /// Registers a universe builtin at a fixed index.
    pub fn define_builtin(&mut self, index: u16, name: &str) {
        self.builtins.insert(name.to_owned(), index);
    }

    /// Swaps every scope out for a fresh, empty global frame; builtins
    /// stay visible. An imported module compiles against this isolated
    /// view so it can never resolve (or capture) the importer's names.
    pub fn detach_scopes(&mut self) -> DetachedScopes {
        DetachedScopes {
            frames: std::mem::replace(&mut self.frames, vec![Frame::new()]),
        }
    }

    /// Restores scopes detached by [`SymbolTable::detach_scopes`].
    pub fn restore_scopes(&mut self, detached: DetachedScopes) {
        self.frames = detached.frames;
    }

    /// Number of global slots defined so far.
    pub fn num_globals(&self) -> u16 {
        self.num_globals
    }

    /// Enters a new function scope.
    pub fn enter_function(&mut self) {
        self.frames.push(Frame::new());
    }

    /// Leaves the current function scope, yielding its locals/captures.
    ///
    /// # Panics
    /// Panics when called on the global frame; function enter/leave calls
    /// are balanced by construction in the compiler.
    pub fn leave_function(&mut self) -> FunctionScope {
        assert!(self.frames.len() > 1, "cannot leave the global scope");
        let frame = self.frames.pop().expect("frame stack never empty");
        let cell_slots = frame
            .locals
            .iter()
            .enumerate()
            .filter(|(_, info)| info.cell)
            .map(|(slot, _)| u16::try_from(slot).expect("slot fits u16"))
            .collect();
        FunctionScope {
            num_locals: frame.next_slot,
            cell_slots,
            captures: frame.captures,
        }
    }

    /// Enters a nested block scope.
    pub fn enter_block(&mut self) {
        self.current_mut().blocks.push(AHashMap::new());
    }

    /// Leaves the innermost block scope.
    pub fn leave_block(&mut self) {
        let frame = self.current_mut();
        assert!(frame.blocks.len() > 1, "cannot leave the outermost block");
        frame.blocks.pop();
    }

    fn current_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack never empty")
    }

    fn in_global_frame(&self) -> bool {
        self.frames.len() == 1
    }

    /// Defines a new name in the innermost block.
    ///
    /// Fails when the name already exists in the same block; shadowing an
    /// outer block or enclosing function is allowed.
    pub fn define(&mut self, name: &str, pos: Pos) -> Result<Symbol, Redeclaration> {
        let global = self.in_global_frame();
        let num_globals = self.num_globals;
        let frame = self.current_mut();
        let block = frame.blocks.last_mut().expect("block stack never empty");
        if block.contains_key(name) {
            return Err(Redeclaration {
                name: name.to_owned(),
                pos,
            });
        }
        if global {
            let index = num_globals;
            block.insert(name.to_owned(), index);
            self.num_globals = self
                .num_globals
                .checked_add(1)
                .expect("global slot count exceeds u16");
            Ok(Symbol {
                scope: SymbolScope::Global,
                index,
                cell: false,
            })
        } else {
            let index = frame.next_slot;
            frame.next_slot = frame.next_slot.checked_add(1).expect("local slot count exceeds u16");
            frame.locals.push(LocalInfo { cell: false });
            block.insert(name.to_owned(), index);
            Ok(Symbol {
                scope: SymbolScope::Local,
                index,
                cell: false,
            })
        }
    }

    /// Resolves a name, promoting enclosing-function locals to free
    /// variables of every function between the definition and the use.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        // Local in the current function (or global when at the top level).
        let current_idx = self.frames.len() - 1;
        if let Some(slot) = self.frames[current_idx].lookup(name) {
            if current_idx == 0 {
                return Some(Symbol {
                    scope: SymbolScope::Global,
                    index: slot,
                    cell: false,
                });
            }
            let cell = self.frames[current_idx].locals[slot as usize].cell;
            return Some(Symbol {
                scope: SymbolScope::Local,
                index: slot,
                cell,
            });
        }
        // Already a known free variable of the current function.
        if current_idx > 0
            && let Some(&idx) = self.frames[current_idx].free_map.get(name)
        {
            return Some(Symbol {
                scope: SymbolScope::Free,
                index: idx,
                cell: true,
            });
        }

        // A local of some enclosing function becomes a free variable of
        // every function from there inward.
        if current_idx > 1 {
            for def_idx in (1..current_idx).rev() {
                if let Some(slot) = self.frames[def_idx].lookup(name) {
                    self.frames[def_idx].locals[slot as usize].cell = true;
                    let mut capture = Capture::Local(slot);
                    let mut free_idx = 0;
                    for frame_idx in def_idx + 1..=current_idx {
                        free_idx = self.frames[frame_idx].add_free(name, capture);
                        capture = Capture::Free(free_idx);
                    }
                    return Some(Symbol {
                        scope: SymbolScope::Free,
                        index: free_idx,
                        cell: true,
                    });
                }
                if let Some(&existing) = self.frames[def_idx].free_map.get(name) {
                    let mut capture = Capture::Free(existing);
                    let mut free_idx = 0;
                    for frame_idx in def_idx + 1..=current_idx {
                        free_idx = self.frames[frame_idx].add_free(name, capture);
                        capture = Capture::Free(free_idx);
                    }
                    return Some(Symbol {
                        scope: SymbolScope::Free,
                        index: free_idx,
                        cell: true,
                    });
                }
            }
        }

        // Globals, then builtins. Builtins are never promoted to free.
        if let Some(index) = self.frames[0].lookup(name) {
            return Some(Symbol {
                scope: SymbolScope::Global,
                index,
                cell: false,
            });
        }
        self.builtins.get(name).map(|&index| Symbol {
            scope: SymbolScope::Builtin,
            index,
            cell: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SymbolTable {
        SymbolTable::new()
    }

    #[test]
    fn defines_globals_at_top_level() {
        let mut t = table();
        let a = t.define("a", Pos::NONE).unwrap();
        let b = t.define("b", Pos::NONE).unwrap();
        assert_eq!(a.scope, SymbolScope::Global);
        assert_eq!((a.index, b.index), (0, 1));
        assert_eq!(t.num_globals(), 2);
    }

    #[test]
    fn duplicate_in_same_block_fails() {
        let mut t = table();
        t.define("x", Pos::NONE).unwrap();
        assert!(t.define("x", Pos::NONE).is_err());
    }

    #[test]
    fn shadowing_in_inner_block_gets_new_slot() {
        let mut t = table();
        t.enter_function();
        let outer = t.define("x", Pos::NONE).unwrap();
        t.enter_block();
        let inner = t.define("x", Pos::NONE).unwrap();
        assert_ne!(outer.index, inner.index);
        t.leave_block();
        // The outer definition is visible again.
        assert_eq!(t.resolve("x").unwrap().index, outer.index);
        t.leave_function();
    }

    #[test]
    fn builtins_resolve_when_nothing_shadows() {
        let mut t = table();
        t.define_builtin(3, "len");
        let sym = t.resolve("len").unwrap();
        assert_eq!(sym.scope, SymbolScope::Builtin);
        assert_eq!(sym.index, 3);
    }

    #[test]
    fn capture_promotes_local_to_cell() {
        let mut t = table();
        t.enter_function();
        t.define("x", Pos::NONE).unwrap();
        t.enter_function();
        let sym = t.resolve("x").unwrap();
        assert_eq!(sym.scope, SymbolScope::Free);
        assert_eq!(sym.index, 0);
        let inner = t.leave_function();
        assert_eq!(inner.captures, vec![Capture::Local(0)]);
        let outer = t.leave_function();
        // The defining slot became a cell slot.
        assert_eq!(outer.cell_slots, vec![0]);
    }

    #[test]
    fn capture_threads_through_intermediate_functions() {
        let mut t = table();
        t.enter_function();
        t.define("x", Pos::NONE).unwrap();
        t.enter_function(); // middle, does not mention x
        t.enter_function(); // inner
        let sym = t.resolve("x").unwrap();
        assert_eq!(sym.scope, SymbolScope::Free);
        let inner = t.leave_function();
        let middle = t.leave_function();
        let outer = t.leave_function();
        // The middle function captures the outer local; the inner function
        // captures the middle function's free variable — exactly once each.
        assert_eq!(middle.captures, vec![Capture::Local(0)]);
        assert_eq!(inner.captures, vec![Capture::Free(0)]);
        assert_eq!(outer.cell_slots, vec![0]);
    }

    #[test]
    fn repeated_resolution_registers_one_free_var() {
        let mut t = table();
        t.enter_function();
        t.define("x", Pos::NONE).unwrap();
        t.enter_function();
        t.resolve("x").unwrap();
        t.resolve("x").unwrap();
        let inner = t.leave_function();
        assert_eq!(inner.captures.len(), 1);
        t.leave_function();
    }

    #[test]
    fn globals_are_not_captured() {
        let mut t = table();
        t.define("g", Pos::NONE).unwrap();
        t.enter_function();
        let sym = t.resolve("g").unwrap();
        assert_eq!(sym.scope, SymbolScope::Global);
        let scope = t.leave_function();
        assert!(scope.captures.is_empty());
    }

    #[test]
    fn params_count_toward_locals() {
        let mut t = table();
        t.enter_function();
        t.define("a", Pos::NONE).unwrap();
        t.define("b", Pos::NONE).unwrap();
        let scope = t.leave_function();
        assert_eq!(scope.num_locals, 2);
    }
}
