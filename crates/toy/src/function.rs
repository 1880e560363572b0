//! Compiled functions, closures, and bound methods.

use crate::{
    bytecode::Code,
    heap::HeapId,
    intern::StringId,
    symbol::Capture,
    value::Value,
};

/// Index of a compiled function in the program's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FunctionId(u32);

impl FunctionId {
    #[inline]
    pub fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("function table exceeds u32 range"))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A function's arity descriptor: required positionals, then optionals
/// (missing ones bind to `nil`), then at most one variadic collecting the
/// rest into a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub(crate) struct Signature {
    pub required: u8,
    pub optional: u8,
    pub variadic: bool,
}

impl Signature {
    /// Number of parameter slots the frame binds.
    pub fn param_slots(self) -> u16 {
        u16::from(self.required) + u16::from(self.optional) + u16::from(self.variadic)
    }
}

/// A compiled function: bytecode plus the frame layout metadata the VM
/// needs to bind a call.
///
/// # Frame layout
///
/// Locals occupy `num_locals` stack slots starting at the frame base:
/// parameters first (in declaration order), then every other declaration
/// in the body, slots handed out monotonically. Slots listed in
/// `cell_slots` are wrapped in heap cells at frame entry so nested
/// functions can capture them by reference.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Function {
    /// Display name for backtraces: the binding name when the literal was
    /// directly assigned, `<anonymous>` otherwise, `<module>` for units.
    pub name: StringId,
    pub signature: Signature,
    pub num_locals: u16,
    /// Local slots wrapped in cells at frame entry (includes captured
    /// parameters, whose bound value is moved into the cell).
    pub cell_slots: Vec<u16>,
    /// How to obtain each capture from the defining frame, in
    /// free-variable index order.
    pub captures: Vec<Capture>,
    pub code: Code,
}

/// A closure: a function plus the cells it captured at creation.
#[derive(Debug)]
pub(crate) struct Closure {
    pub function: FunctionId,
    /// One cell per free variable, indexed by `LoadFree`/`StoreFree`.
    pub captures: Vec<HeapId>,
}

/// A callable bound to a receiver: calling it prepends the receiver to the
/// argument list.
#[derive(Debug)]
pub(crate) struct BoundMethod {
    pub callable: Value,
    pub receiver: Value,
}
