//! The `fmt` module: script-visible printing and string formatting.

use crate::{
    builtins::{ArgList, Builtin},
    error::RunResult,
    format,
    heap::{DropWithHeap, Heap, HeapData},
    intern::Interns,
    io::PrintWriter,
    modules::ModuleFunction,
    resource::ResourceTracker,
    types::Str,
    value::{self, Value},
};

pub(super) const MEMBER_COUNT: usize = 4;

/// Member lookup for the `fmt` module value.
pub(super) fn member(name: &str) -> Option<Value> {
    let function = match name {
        "print" => ModuleFunction::FmtPrint,
        "println" => ModuleFunction::FmtPrintln,
        "printf" => ModuleFunction::FmtPrintf,
        "sprintf" => ModuleFunction::FmtSprintf,
        _ => return None,
    };
    Some(Value::Builtin(Builtin::Module(function)))
}

/// `fmt.print(values...)`: displays arguments space-separated, no newline.
pub(super) fn print<T: ResourceTracker>(
    heap: &mut Heap<T>,
    args: ArgList,
    interns: &Interns,
    print: &mut dyn PrintWriter,
) -> RunResult<Value> {
    write_values(heap, args, interns, print);
    Ok(Value::Nil)
}

/// `fmt.println(values...)`: like `print` with a trailing newline.
pub(super) fn println<T: ResourceTracker>(
    heap: &mut Heap<T>,
    args: ArgList,
    interns: &Interns,
    print: &mut dyn PrintWriter,
) -> RunResult<Value> {
    write_values(heap, args, interns, print);
    print.push_char('\n');
    Ok(Value::Nil)
}

fn write_values<T: ResourceTracker>(
    heap: &mut Heap<T>,
    args: ArgList,
    interns: &Interns,
    print: &mut dyn PrintWriter,
) {
    // Build the whole line first so a print call is atomic in the output.
    let mut first = true;
    for value in &args {
        if first {
            first = false;
        } else {
            print.push_char(' ');
        }
        print.write_str(value::fmt_display(value, heap, interns).into());
    }
    args.drop_with_heap(heap);
}

/// `fmt.printf(template, values...)`: formatted output, no newline.
pub(super) fn printf<T: ResourceTracker>(
    heap: &mut Heap<T>,
    args: ArgList,
    interns: &Interns,
    print: &mut dyn PrintWriter,
) -> RunResult<Value> {
    let output = format::format_args(heap, args, interns)?;
    print.write_str(output.into());
    Ok(Value::Nil)
}

/// `fmt.sprintf(template, values...)`: formatted output as a string.
pub(super) fn sprintf<T: ResourceTracker>(heap: &mut Heap<T>, args: ArgList, interns: &Interns) -> RunResult<Value> {
    let output = format::format_args(heap, args, interns)?;
    let id = heap.allocate(HeapData::Str(Str::new(output)))?;
    Ok(Value::Ref(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{io::CollectStringPrint, resource::NoLimitTracker};

    #[test]
    fn println_joins_with_spaces() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut builder = crate::intern::InternerBuilder::new();
        let hello = builder.intern("hello");
        let world = builder.intern("world");
        let interns = builder.build();
        let mut out = CollectStringPrint::new();
        let args: ArgList = [Value::InternString(hello), Value::InternString(world)]
            .into_iter()
            .collect();
        let result = println(&mut heap, args, &interns, &mut out).unwrap();
        assert_eq!(result, Value::Nil);
        assert_eq!(out.output(), "hello world\n");
    }

    #[test]
    fn sprintf_returns_a_string() {
        let mut heap = Heap::new(NoLimitTracker);
        let mut builder = crate::intern::InternerBuilder::new();
        let template = builder.intern("%d-%d");
        let interns = builder.build();
        let args: ArgList = [Value::InternString(template), Value::Int(1), Value::Int(2)]
            .into_iter()
            .collect();
        let result = sprintf(&mut heap, args, &interns).unwrap();
        assert_eq!(result.as_str(&heap, &interns), Some("1-2"));
        result.drop_with_heap(&mut heap);
        assert_eq!(heap.live_count(), 0);
    }
}
