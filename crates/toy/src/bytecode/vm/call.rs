//! Call dispatch: script functions, closures, builtins, type values,
//! module functions, and bound methods.
//!
//! The stack shape at a call is `[callee, arg0..argN]`. Script calls bind
//! arguments in place — the argument region becomes the parameter slots of
//! the new frame — so a call pushes no copies. Builtin calls drain the
//! arguments into an [`ArgList`] and run synchronously.

use smallvec::SmallVec;

use super::{Frame, Vm};
use crate::{
    builtins::{ArgList, Builtin, BuiltinFunction},
    builtins::conv,
    error::{ErrorKind, RunError, RunResult},
    function::FunctionId,
    heap::{DropWithHeap, HeapData},
    io::PrintWriter,
    resource::ResourceTracker,
    types::Tuple,
    value::{self, Value},
};

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Calls the value at `stack[len - argc - 1]` with the `argc` arguments
    /// above it. For `try_call`, panics from the call become the second
    /// slot of a `(result, err)` tuple instead of unwinding.
    pub(super) fn call_value(&mut self, argc: usize, try_call: bool) -> RunResult<()> {
        if self.interrupt.is_interrupted() {
            return Err(RunError::new(ErrorKind::Cancelled, "execution interrupted by host"));
        }
        let callee_index = self.stack.len() - argc - 1;
        let callee = self.stack[callee_index].raw_copy();

        match callee {
            Value::Function(function_id) => self.call_function(function_id, Vec::new(), argc, try_call),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Closure(closure) => {
                    let function_id = closure.function;
                    let captures = closure.captures.clone();
                    self.call_function(function_id, captures, argc, try_call)
                }
                HeapData::BoundMethod(method) => {
                    let callable = method.callable.raw_copy();
                    let receiver = method.receiver.raw_copy();
                    let callable = callable.retained(self.heap);
                    let receiver = receiver.retained(self.heap);
                    // Rewrite the callee slot and splice the receiver in as
                    // the first argument.
                    let old = std::mem::replace(&mut self.stack[callee_index], callable);
                    old.drop_with_heap(self.heap);
                    if self.stack.len() >= self.max_stack {
                        receiver.drop_with_heap(self.heap);
                        return Err(RunError::new(ErrorKind::StackOverflow, "value stack overflow"));
                    }
                    self.stack.insert(callee_index + 1, receiver);
                    self.call_value(argc + 1, try_call)
                }
                other => {
                    let message = format!("{} is not callable", other.type_of());
                    self.drop_call_stack(argc);
                    let err = RunError::new(ErrorKind::NotCallable, message);
                    self.deliver_builtin_result(Err(err), try_call)
                }
            },
            Value::Builtin(builtin) => self.call_builtin(builtin, argc, try_call),
            other => {
                let message = format!("{} is not callable", other.type_of(self.heap));
                self.drop_call_stack(argc);
                let err = RunError::new(ErrorKind::NotCallable, message);
                self.deliver_builtin_result(Err(err), try_call)
            }
        }
    }

    /// Pops and releases the callee and arguments of a failed call.
    fn drop_call_stack(&mut self, argc: usize) {
        for _ in 0..argc + 1 {
            let value = self.pop();
            value.drop_with_heap(self.heap);
        }
    }

    /// Binds arguments and pushes a frame for a compiled function.
    fn call_function(
        &mut self,
        function_id: FunctionId,
        captures: Vec<crate::heap::HeapId>,
        argc: usize,
        try_call: bool,
    ) -> RunResult<()> {
        if self.frames.len() >= self.max_frames {
            self.drop_call_stack(argc);
            let err = RunError::new(ErrorKind::StackOverflow, "call stack overflow");
            return self.deliver_builtin_result(Err(err), try_call);
        }
        let function = &self.program.functions[function_id.index()];
        let signature = function.signature;
        let num_locals = usize::from(function.num_locals);
        let required = usize::from(signature.required);
        let max_positional = required + usize::from(signature.optional);

        if argc < required || (!signature.variadic && argc > max_positional) {
            let name = self.interns.get(function.name).to_owned();
            let expected = describe_arity(required, usize::from(signature.optional), signature.variadic);
            self.drop_call_stack(argc);
            let err = RunError::arity(format!("{name} takes {expected}, got {argc}"));
            return self.deliver_builtin_result(Err(err), try_call);
        }

        let base = self.stack.len() - argc;
        if base + num_locals + 1 > self.max_stack {
            self.drop_call_stack(argc);
            let err = RunError::new(ErrorKind::StackOverflow, "value stack overflow");
            return self.deliver_builtin_result(Err(err), try_call);
        }

        if signature.variadic {
            // Collect everything past the declared parameters into a tuple.
            let rest: Vec<Value> = if argc > max_positional {
                self.stack.drain(base + max_positional..).collect()
            } else {
                Vec::new()
            };
            // Missing optionals bind nil, before the rest-tuple slot.
            for _ in self.stack.len() - base..max_positional {
                self.stack.push(Value::Nil);
            }
            let rest_id = self.heap.allocate(HeapData::Tuple(Tuple::new(rest)))?;
            self.stack.push(Value::Ref(rest_id));
        } else {
            for _ in argc..max_positional {
                self.stack.push(Value::Nil);
            }
        }

        let param_slots = usize::from(signature.param_slots());
        debug_assert_eq!(self.stack.len(), base + param_slots);
        for _ in param_slots..num_locals {
            self.stack.push(Value::Nil);
        }

        // Wrap captured locals (parameters included) in cells.
        let cell_slots = function.cell_slots.clone();
        for slot in cell_slots {
            let index = base + usize::from(slot);
            let current = std::mem::replace(&mut self.stack[index], Value::Nil);
            let cell = self.heap.allocate(HeapData::Cell(current))?;
            self.stack[index] = Value::Ref(cell);
        }

        self.frames.push(Frame {
            function: function_id,
            ip: 0,
            base,
            floor: base - 1,
            captures,
            deferred: Vec::new(),
            exit: None,
            is_try: try_call,
            module_index: None,
            export: None,
            discard_result: false,
        });
        Ok(())
    }

    /// Runs a builtin callee synchronously.
    fn call_builtin(&mut self, builtin: Builtin, argc: usize, try_call: bool) -> RunResult<()> {
        // `recover` and the REPL hook need VM state, so they dispatch here
        // rather than through the builtin table.
        if let Builtin::Function(BuiltinFunction::Recover) = builtin {
            let args = self.drain_args(argc);
            let result = if args.is_empty() {
                self.take_recovered()
            } else {
                let count = args.len();
                args.drop_with_heap(self.heap);
                Err(RunError::arity(format!("recover takes 0 arguments, got {count}")))
            };
            return self.deliver_builtin_result(result, try_call);
        }
        if let Builtin::Function(BuiltinFunction::ReplPrint) = builtin {
            let args = self.drain_args(argc);
            let result = self.repl_print(args);
            return self.deliver_builtin_result(result, try_call);
        }

        let args = self.drain_args(argc);
        let result = match builtin {
            Builtin::Function(function) => function.call(self.heap, args, self.interns),
            Builtin::Type(ty) => conv::call_type(ty, self.heap, args, self.interns),
            Builtin::Module(function) => function.call(self.heap, args, self.interns, self.print),
            Builtin::ModuleHandle(module) => {
                args.drop_with_heap(self.heap);
                Err(RunError::new(
                    ErrorKind::NotCallable,
                    format!("module {} is not callable", module.name()),
                ))
            }
        };
        self.deliver_builtin_result(result, try_call)
    }

    /// Pops the arguments and callee, returning the arguments.
    fn drain_args(&mut self, argc: usize) -> ArgList {
        let args: SmallVec<[Value; 4]> = self.stack.drain(self.stack.len() - argc..).collect();
        let callee = self.pop();
        callee.drop_with_heap(self.heap);
        args
    }

    /// Pushes a builtin's result, honoring the try-call contract.
    fn deliver_builtin_result(&mut self, result: RunResult<Value>, try_call: bool) -> RunResult<()> {
        if !try_call {
            let value = result?;
            return self.push(value);
        }
        match result {
            Ok(value) => {
                let tuple = self
                    .heap
                    .allocate(HeapData::Tuple(Tuple::new(vec![value, Value::Nil])))?;
                self.push(Value::Ref(tuple))
            }
            Err(err) => {
                let error_id = self.heap.allocate(HeapData::Error(err.error))?;
                let tuple = self
                    .heap
                    .allocate(HeapData::Tuple(Tuple::new(vec![Value::Nil, Value::Ref(error_id)])))?;
                self.push(Value::Ref(tuple))
            }
        }
    }

    /// The hidden REPL echo: prints non-nil results as their repr.
    fn repl_print(&mut self, args: ArgList) -> RunResult<Value> {
        let mut args = args;
        if args.len() != 1 {
            let count = args.len();
            args.drop_with_heap(self.heap);
            return Err(RunError::arity(format!("__replPrint__ takes 1 argument, got {count}")));
        }
        let value = args.pop().expect("length checked");
        if !matches!(value, Value::Nil) {
            let text = value::fmt_repr(&value, self.heap, self.interns);
            self.print.write_str(text.into());
            self.print.push_char('\n');
        }
        value.drop_with_heap(self.heap);
        Ok(Value::Nil)
    }
}

fn describe_arity(required: usize, optional: usize, variadic: bool) -> String {
    let mut text = match (required, optional) {
        (r, 0) => format!("{r} argument(s)"),
        (r, o) => format!("{r} to {} argument(s)", r + o),
    };
    if variadic {
        text.push_str(" or more");
    }
    text
}
