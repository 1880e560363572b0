//! Error types for every stage of the pipeline.
//!
//! Three families, matching the stages they come from:
//!
//! - [`Diagnostic`]: positional lex/parse/compile errors. They are batched —
//!   the lexer and parser keep going after an error — and rendered against
//!   the [`FileSet`](crate::source::FileSet) at the embedding boundary.
//! - [`RunError`] / [`RunResult`]: the runtime's internal error channel,
//!   threaded through the VM with `?`. A `RunError` wraps an [`ErrorValue`]:
//!   plain data (kind, message, cause chain) with no heap references, so it
//!   can cross unwinding without reference-count bookkeeping.
//! - [`Exception`]: the public runtime failure handed to the host, carrying
//!   the resolved source position and a frame backtrace.

use std::fmt;

use strum::{Display as StrumDisplay, IntoStaticStr};

use crate::source::{Pos, Position};

/// Result alias for runtime operations.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Classifies a runtime error.
///
/// Every kind except `StackOverflow` and `OutOfMemory` is routinely
/// catchable with `try`; the fatal kinds are still well-defined error
/// values but scripts are not expected to recover from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// Operand or argument of the wrong type.
    TypeError,
    /// Call with the wrong number of arguments.
    ArityError,
    /// Integer index outside a sequence's bounds.
    IndexError,
    /// Slice bounds out of range or inverted.
    SliceError,
    /// Lookup with an invalid key.
    KeyError,
    /// Integer division or remainder by zero.
    DivisionByZero,
    /// Explicit conversion failed (e.g. `int("abc")`).
    ConversionError,
    /// Field or property access on a value that has no such member.
    NoSuchField,
    /// Value used as a table key is not hashable.
    NotHashable,
    /// Mutation attempted while an iteration over the container is open.
    MutatedWhileIterating,
    /// Mutation attempted on a frozen container.
    Frozen,
    /// Call target is not callable.
    NotCallable,
    /// `for`-`in` target is not iterable.
    NotIterable,
    /// A value outside the accepted domain (e.g. `range` step of zero).
    ValueError,
    /// Import failed: unknown module.
    ImportError,
    /// Raised by `fail(...)` or carried by user-constructed error values.
    UserError,
    /// The host interrupt flag was observed.
    Cancelled,
    /// Call-frame limit exceeded. Fatal but well-defined.
    StackOverflow,
    /// Resource tracker refused an allocation. Fatal but well-defined.
    OutOfMemory,
}

/// A plain-data error value: kind, message, optional cause chain.
///
/// This is both the payload of a [`RunError`] and the content of the
/// language's first-class `error` values, so a caught panic converts to a
/// value (and back) without loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<Box<ErrorValue>>,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Wraps `cause` under a new error, forming a chain.
    pub fn with_cause(kind: ErrorKind, message: impl Into<String>, cause: Self) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Depth of the cause chain including this error.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        1 + self.cause.as_deref().map_or(0, Self::chain_len)
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

/// The runtime's internal error: an [`ErrorValue`] plus the position of the
/// instruction that raised it.
///
/// The position starts as `Pos::NONE` in leaf helpers that have no location
/// context; the VM stamps the current instruction's position the first time
/// the error crosses the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunError {
    pub error: ErrorValue,
    pub pos: Pos,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorValue::new(kind, message),
            pos: Pos::NONE,
        }
    }

    pub fn from_value(error: ErrorValue) -> Self {
        Self {
            error,
            pos: Pos::NONE,
        }
    }

    /// Stamps `pos` unless a more precise position was already recorded.
    pub fn at(mut self, pos: Pos) -> Self {
        if !self.pos.is_some() {
            self.pos = pos;
        }
        self
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    pub fn arity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ArityError, message)
    }

    pub fn index(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IndexError, message)
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValueError, message)
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConversionError, message)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error.kind, self.error)
    }
}

/// A positional compile-stage error (lex, parse, or codegen).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Diagnostic {
    pub message: String,
    pub pos: Pos,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>, pos: Pos) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }
}

/// A compile error reported to the host, with its position resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
    pub position: Option<Position>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.position {
            Some(p) => write!(f, "{p}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// The batched compile failure returned from [`Script::compile`](crate::Script::compile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileErrors {
    pub errors: Vec<CompileError>,
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

/// One frame of a runtime backtrace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function name, or `<module>` for top-level code.
    pub function: String,
    /// Resolved call-site position, if known.
    pub position: Option<Position>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.position {
            Some(p) => write!(f, "  at {} ({p})", self.function),
            None => write!(f, "  at {}", self.function),
        }
    }
}

/// A runtime failure surfaced to the host: the error value, the position of
/// the raising instruction, and the frame backtrace at the point of the
/// unhandled panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub error: ErrorValue,
    pub position: Option<Position>,
    pub backtrace: Vec<StackFrame>,
}

impl Exception {
    /// Returns the error kind of the outermost error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.error.kind
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.position {
            Some(p) => write!(f, "{p}: {}: {}", self.error.kind, self.error)?,
            None => write!(f, "{}: {}", self.error.kind, self.error)?,
        }
        for frame in &self.backtrace {
            write!(f, "\n{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_chain_display() {
        let inner = ErrorValue::new(ErrorKind::IndexError, "index 4 out of range");
        let outer = ErrorValue::with_cause(ErrorKind::UserError, "loading row", inner);
        assert_eq!(outer.to_string(), "loading row: index 4 out of range");
        assert_eq!(outer.chain_len(), 2);
    }

    #[test]
    fn run_error_keeps_first_position() {
        let mut set = crate::source::FileSet::new();
        let id = set.add_file("t.toy", "x".to_owned());
        let first = set.pos(id, 0);
        let err = RunError::type_error("boom").at(first).at(Pos::NONE);
        assert_eq!(err.pos, first);
    }

    #[test]
    fn kind_renders_kebab_case() {
        assert_eq!(ErrorKind::DivisionByZero.to_string(), "division-by-zero");
        assert_eq!(ErrorKind::MutatedWhileIterating.to_string(), "mutated-while-iterating");
    }
}
