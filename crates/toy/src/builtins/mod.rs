//! Universe builtins: the functions and callable type values visible to
//! every script without an import.
//!
//! A builtin is an immediate [`Value`] variant — no heap allocation — and
//! dispatches by enum. `recover` is special: it reads the VM's pending
//! panic, so the VM intercepts it before this module's dispatch runs.

pub(crate) mod collections;
pub(crate) mod conv;
mod errors;
pub(crate) mod minmax;
mod range;

use smallvec::SmallVec;
use strum::{Display, IntoStaticStr};

use crate::{
    error::{RunError, RunResult},
    function::BoundMethod,
    heap::{DropWithHeap, Heap, HeapData},
    intern::Interns,
    modules::{BuiltinModule, ModuleFunction},
    resource::ResourceTracker,
    types::Type,
    value::Value,
};

/// Argument vector for builtin and host calls. Small calls stay inline.
pub(crate) type ArgList = SmallVec<[Value; 4]>;

/// Any callable (or type) provided by the runtime rather than compiled
/// from script source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    /// A universe function like `len` or `format`.
    Function(BuiltinFunction),
    /// A callable type value like `int` — calling it converts/constructs.
    Type(Type),
    /// A member of a builtin module (`fmt.println`, `math.sqrt`).
    Module(ModuleFunction),
    /// A builtin module itself (`fmt`, `math`); member access goes through
    /// the selector syntax and needs no import.
    ModuleHandle(BuiltinModule),
}

impl Builtin {
    /// The type this value reports.
    pub fn type_of(self) -> Type {
        match self {
            Self::Function(_) | Self::Module(_) => Type::BuiltinFunction,
            Self::Type(_) => Type::Type,
            Self::ModuleHandle(_) => Type::Module,
        }
    }

    /// Writes the display form (`<builtin len>`, `<type int>`).
    pub fn write_repr(self, out: &mut String) {
        use std::fmt::Write as _;
        match self {
            Self::Function(f) => {
                let _ = write!(out, "<builtin {f}>");
            }
            Self::Type(t) => {
                let _ = write!(out, "<type {t}>");
            }
            Self::Module(m) => {
                let _ = write!(out, "<builtin {m}>");
            }
            Self::ModuleHandle(m) => {
                let _ = write!(out, "<module {}>", m.name());
            }
        }
    }
}

/// The universe functions.
///
/// Display gives the script-visible name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum BuiltinFunction {
    Len,
    #[strum(serialize = "type")]
    TypeOf,
    Clone,
    Freeze,
    IsFrozen,
    Push,
    Delete,
    Contains,
    Keys,
    Values,
    Min,
    Max,
    Range,
    Format,
    Error,
    Fail,
    /// Clears the pending panic from inside a deferred call; dispatched by
    /// the VM, never through [`BuiltinFunction::call`].
    Recover,
    Bind,
    /// Hidden hook the REPL splices in to echo expression results.
    #[strum(serialize = "__replPrint__")]
    ReplPrint,
}

impl BuiltinFunction {
    /// Calls the builtin. `Recover` and `ReplPrint` are handled by the VM
    /// (they need VM state or the print writer) and reaching them here is
    /// a dispatch bug upstream.
    pub fn call<T: ResourceTracker>(
        self,
        heap: &mut Heap<T>,
        args: ArgList,
        interns: &Interns,
    ) -> RunResult<Value> {
        match self {
            Self::Len => collections::len(heap, args, interns),
            Self::TypeOf => type_of(heap, args),
            Self::Clone => collections::clone(heap, args),
            Self::Freeze => collections::freeze(heap, args),
            Self::IsFrozen => collections::is_frozen(heap, args),
            Self::Push => collections::push(heap, args),
            Self::Delete => collections::delete(heap, args, interns),
            Self::Contains => collections::contains(heap, args, interns),
            Self::Keys => collections::keys(heap, args),
            Self::Values => collections::values(heap, args),
            Self::Min => minmax::min(heap, args, interns),
            Self::Max => minmax::max(heap, args, interns),
            Self::Range => range::range(heap, args),
            Self::Format => {
                let formatted = crate::format::format_args(heap, args, interns)?;
                let id = heap.allocate(HeapData::Str(crate::types::Str::new(formatted)))?;
                Ok(Value::Ref(id))
            }
            Self::Error => errors::error(heap, args, interns),
            Self::Fail => errors::fail(heap, args, interns),
            Self::Bind => bind(heap, args),
            Self::Recover | Self::ReplPrint => {
                args.drop_with_heap(heap);
                Err(RunError::type_error(format!("{self} requires VM dispatch")))
            }
        }
    }
}

/// The fixed universe: index order is the `LoadBuiltin` operand space and
/// must stay stable within a compiled program.
pub(crate) fn universe() -> Vec<(&'static str, Builtin)> {
    use BuiltinFunction as F;
    let functions = [
        F::Len,
        F::TypeOf,
        F::Clone,
        F::Freeze,
        F::IsFrozen,
        F::Push,
        F::Delete,
        F::Contains,
        F::Keys,
        F::Values,
        F::Min,
        F::Max,
        F::Range,
        F::Format,
        F::Error,
        F::Fail,
        F::Recover,
        F::Bind,
        F::ReplPrint,
    ];
    let types = [
        Type::Int,
        Type::Float,
        Type::Bool,
        Type::Char,
        Type::String,
        Type::Bytes,
        Type::Tuple,
        Type::Array,
        Type::Table,
    ];
    let mut entries: Vec<(&'static str, Builtin)> = Vec::new();
    for f in functions {
        entries.push((f.into(), Builtin::Function(f)));
    }
    for t in types {
        entries.push((t.into(), Builtin::Type(t)));
    }
    // Builtin modules are ambient: `fmt.println(...)` needs no import.
    for m in [BuiltinModule::Fmt, BuiltinModule::Math] {
        entries.push((m.name(), Builtin::ModuleHandle(m)));
    }
    entries
}

fn type_of<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let value = take1(args, "type", heap)?;
    let tag = value.type_of(heap);
    value.drop_with_heap(heap);
    Ok(Value::Builtin(Builtin::Type(tag)))
}

fn bind<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList) -> RunResult<Value> {
    let (callable, receiver) = take2(args, "bind", heap)?;
    let callable_type = callable.type_of(heap);
    if !matches!(
        callable_type,
        Type::Function | Type::BuiltinFunction | Type::BoundMethod | Type::Type
    ) {
        let message = format!("bind target must be callable, not {callable_type}");
        callable.drop_with_heap(heap);
        receiver.drop_with_heap(heap);
        return Err(RunError::type_error(message));
    }
    let id = heap.allocate(HeapData::BoundMethod(BoundMethod { callable, receiver }))?;
    Ok(Value::Ref(id))
}

// === Argument helpers ===
//
// Builtins own their arguments; on an arity error the helpers release
// everything before reporting.

pub(crate) fn take1<T: ResourceTracker>(args: ArgList, name: &str, heap: &mut Heap<T>) -> RunResult<Value> {
    if args.len() == 1 {
        let mut args = args;
        Ok(args.pop().expect("length checked"))
    } else {
        let count = args.len();
        args.drop_with_heap(heap);
        Err(RunError::arity(format!("{name} takes 1 argument, got {count}")))
    }
}

pub(crate) fn take2<T: ResourceTracker>(args: ArgList, name: &str, heap: &mut Heap<T>) -> RunResult<(Value, Value)> {
    if args.len() == 2 {
        let mut args = args;
        let b = args.pop().expect("length checked");
        let a = args.pop().expect("length checked");
        Ok((a, b))
    } else {
        let count = args.len();
        args.drop_with_heap(heap);
        Err(RunError::arity(format!("{name} takes 2 arguments, got {count}")))
    }
}

pub(crate) fn take_between<T: ResourceTracker>(
    args: ArgList,
    name: &str,
    low: usize,
    high: usize,
    heap: &mut Heap<T>,
) -> RunResult<ArgList> {
    if (low..=high).contains(&args.len()) {
        Ok(args)
    } else {
        let count = args.len();
        args.drop_with_heap(heap);
        Err(RunError::arity(format!(
            "{name} takes {low} to {high} arguments, got {count}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn universe_names_are_unique() {
        let entries = universe();
        let mut names: Vec<&str> = entries.iter().map(|(n, _)| *n).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), entries.len());
    }

    #[test]
    fn builtin_names_render_as_script_names() {
        assert_eq!(BuiltinFunction::TypeOf.to_string(), "type");
        assert_eq!(BuiltinFunction::IsFrozen.to_string(), "is_frozen");
        assert_eq!(BuiltinFunction::Len.to_string(), "len");
    }

    #[test]
    fn type_of_reports_tags() {
        let mut heap = Heap::new(NoLimitTracker);
        let args: ArgList = [Value::Int(3)].into_iter().collect();
        let result = type_of(&mut heap, args).unwrap();
        assert_eq!(result, Value::Builtin(Builtin::Type(Type::Int)));
    }
}
