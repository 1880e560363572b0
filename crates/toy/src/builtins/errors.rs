//! The `error` and `fail` builtins.
//!
//! `error(...)` constructs a first-class error value; `fail(...)` builds
//! the same value and raises it as a panic. With a leading error argument,
//! the remaining arguments format a new message and the leading error
//! becomes the cause, forming a chain.

use super::ArgList;
use crate::{
    error::{ErrorKind, ErrorValue, RunError, RunResult},
    format,
    heap::{DropWithHeap, Heap, HeapData},
    intern::Interns,
    resource::ResourceTracker,
    value::{self, Value},
};

pub(super) fn error<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let error_value = build_error(heap, args, interns)?;
    let id = heap.allocate(HeapData::Error(error_value))?;
    Ok(Value::Ref(id))
}

pub(super) fn fail<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let error_value = build_error(heap, args, interns)?;
    Err(RunError::from_value(error_value))
}

/// Shared constructor: `(message)`, `(fmt, args...)`, or
/// `(cause, fmt, args...)`.
fn build_error<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<ErrorValue> {
    let mut args = args;
    if args.is_empty() {
        return Err(RunError::arity("error takes at least 1 argument, got 0"));
    }

    let has_cause = args.len() > 1
        && matches!(&args[0], Value::Ref(id) if matches!(heap.get(*id), HeapData::Error(_)));
    let cause = if has_cause {
        let first = args.remove(0);
        let copied = {
            let Value::Ref(id) = &first else {
                unreachable!("checked above");
            };
            let HeapData::Error(e) = heap.get(*id) else {
                unreachable!("checked above");
            };
            e.clone()
        };
        first.drop_with_heap(heap);
        Some(copied)
    } else {
        None
    };

    let message = if args.len() == 1 {
        let value = args.pop().expect("length checked");
        // A single error argument copies the whole chain.
        if cause.is_none()
            && let Value::Ref(id) = &value
            && let HeapData::Error(e) = heap.get(*id)
        {
            let copied = e.clone();
            value.drop_with_heap(heap);
            return Ok(copied);
        }
        let text = value::fmt_display(&value, heap, interns);
        value.drop_with_heap(heap);
        text
    } else {
        format::format_args(heap, args, interns)?
    };

    Ok(match cause {
        Some(cause) => ErrorValue::with_cause(ErrorKind::UserError, message, cause),
        None => ErrorValue::new(ErrorKind::UserError, message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn heap() -> Heap<NoLimitTracker> {
        Heap::new(NoLimitTracker)
    }

    fn intern(s: &str) -> (crate::intern::Interns, Value) {
        let mut builder = crate::intern::InternerBuilder::new();
        let id = builder.intern(s);
        (builder.build(), Value::InternString(id))
    }

    #[test]
    fn fail_raises_user_error() {
        let mut heap = heap();
        let (interns, msg) = intern("boom");
        let err = fail(&mut heap, [msg].into_iter().collect(), &interns).unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::UserError);
        assert_eq!(err.error.message, "boom");
    }

    #[test]
    fn error_with_cause_chains() {
        let mut heap = heap();
        let (interns, msg) = intern("inner");
        let inner = error(&mut heap, [msg].into_iter().collect(), &interns).unwrap();
        let (interns2, outer_msg) = intern("outer");
        let outer = error(&mut heap, [inner, outer_msg].into_iter().collect(), &interns2).unwrap();
        let Value::Ref(id) = &outer else {
            panic!("error returns a heap value");
        };
        let HeapData::Error(e) = heap.get(*id) else {
            panic!("error returns an error value");
        };
        assert_eq!(e.message, "outer");
        assert_eq!(e.cause.as_ref().unwrap().message, "inner");
        assert_eq!(e.chain_len(), 2);
        outer.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }
}
