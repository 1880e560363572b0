//! The bytecode virtual machine.
//!
//! A single value stack plus a frame stack; each frame owns its
//! instruction pointer, base pointer, captures, deferred-call list, and
//! try flag. Globals and the module cache are per run, passed in by the
//! host so a REPL can persist them across evaluations.
//!
//! # Frame exit
//!
//! Returning, panicking, and import completion all funnel through one
//! exit path: the frame's deferred calls run first (LIFO, possibly
//! pushing frames of their own), then the frame pops, its stack region is
//! released, and its completion is delivered — a pushed value, a cached
//! module export, a `(result, err)` tuple for try-calls, or continued
//! unwinding into the caller. A deferred call may clear the pending panic
//! through `recover()`, in which case the frame completes with `nil`.

mod binary;
mod call;
mod collections;

use crate::{
    builtins::Builtin,
    bytecode::{Opcode, code::Constant, compiler::Program},
    error::{ErrorKind, ErrorValue, RunError, RunResult},
    function::{Closure, FunctionId},
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    io::PrintWriter,
    resource::{InterruptHandle, ResourceTracker},
    source::Pos,
    types::{Array, Str, Table, ToyIter, Tuple, iter::advance_iter},
    value::{self, Value},
};

/// One frame of the backtrace attached to an uncaught panic.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TraceFrame {
    pub function: StringId,
    pub pos: Pos,
}

/// An uncaught panic: the error, the raising position, and the frames it
/// unwound through (innermost first).
#[derive(Debug)]
pub(crate) struct RunOutcome {
    pub error: ErrorValue,
    pub pos: Pos,
    pub trace: Vec<TraceFrame>,
}

/// A call recorded by `defer`: callee and arguments, evaluated eagerly at
/// the defer site.
#[derive(Debug)]
struct DeferredCall {
    callee: Value,
    args: Vec<Value>,
}

/// How a frame is completing.
#[derive(Debug)]
enum FrameExit {
    Return(Value),
    /// Unwinding; the error itself sits in `Vm::pending_panic` so a
    /// deferred `recover()` can claim it.
    Panic,
}

/// A call activation record.
#[derive(Debug)]
struct Frame {
    function: FunctionId,
    ip: usize,
    /// Stack index of local slot 0.
    base: usize,
    /// Stack index to truncate to on exit (the callee slot for calls, the
    /// base for entry and module frames).
    floor: usize,
    /// Capture cells, for closures.
    captures: Vec<HeapId>,
    deferred: Vec<DeferredCall>,
    /// Present while the frame is exiting and draining deferred calls.
    exit: Option<FrameExit>,
    /// Entered via a try-call: completion becomes a `(result, err)` tuple.
    is_try: bool,
    /// Module slot to cache the export into, for import frames.
    module_index: Option<u16>,
    /// Value set by the `export` statement.
    export: Option<Value>,
    /// Deferred-call frames: the return value is discarded.
    discard_result: bool,
}

/// The virtual machine for one run.
pub(crate) struct Vm<'a, T: ResourceTracker, P: PrintWriter> {
    program: &'a Program,
    interns: &'a Interns,
    heap: &'a mut Heap<T>,
    globals: &'a mut Vec<Value>,
    /// Export cache, one slot per module table entry.
    module_cache: &'a mut Vec<Option<Value>>,
    print: &'a mut P,
    interrupt: InterruptHandle,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// The panic currently unwinding, if any.
    pending_panic: Option<RunError>,
    trace: Vec<TraceFrame>,
    /// Set when unwinding exhausted the frame stack.
    aborted: Option<RunOutcome>,
    /// Result of the entry frame once it pops.
    final_result: Option<Value>,
    max_frames: usize,
    max_stack: usize,
    /// Offset of the opcode currently executing, for error positions.
    current_instruction: usize,
}

impl<'a, T: ResourceTracker, P: PrintWriter> Vm<'a, T, P> {
    pub fn new(
        program: &'a Program,
        heap: &'a mut Heap<T>,
        globals: &'a mut Vec<Value>,
        module_cache: &'a mut Vec<Option<Value>>,
        print: &'a mut P,
        interrupt: InterruptHandle,
        max_frames: usize,
        max_stack: usize,
    ) -> Self {
        while globals.len() < usize::from(program.num_globals) {
            globals.push(Value::Nil);
        }
        while module_cache.len() < program.modules.len() {
            module_cache.push(None);
        }
        Self {
            program,
            interns: &program.interns,
            heap,
            globals,
            module_cache,
            print,
            interrupt,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            pending_panic: None,
            trace: Vec::new(),
            aborted: None,
            final_result: None,
            max_frames,
            max_stack,
            current_instruction: 0,
        }
    }

    /// Runs the entry unit to completion.
    ///
    /// The result is the unit's exported value (nil when it never
    /// exports); an uncaught panic reports with position and backtrace.
    pub fn run(mut self, entry: FunctionId) -> Result<Value, Box<RunOutcome>> {
        if let Err(err) = self.push_unit_frame(entry, None) {
            return Err(Box::new(RunOutcome {
                error: err.error,
                pos: err.pos,
                trace: Vec::new(),
            }));
        }
        while !self.frames.is_empty() {
            if let Err(err) = self.step() {
                self.start_unwind(err);
            }
            if let Some(outcome) = self.aborted.take() {
                self.release_run_state();
                return Err(Box::new(outcome));
            }
        }
        Ok(self.final_result.take().unwrap_or(Value::Nil))
    }

    /// Drops whatever is left on the stack after an abort.
    fn release_run_state(&mut self) {
        while let Some(value) = self.stack.pop() {
            value.drop_with_heap(self.heap);
        }
        let frames = std::mem::take(&mut self.frames);
        for frame in frames {
            self.release_frame_values(frame);
        }
    }

    fn release_frame_values(&mut self, frame: Frame) {
        for call in frame.deferred {
            call.callee.drop_with_heap(self.heap);
            call.args.drop_with_heap(self.heap);
        }
        if let Some(FrameExit::Return(value)) = frame.exit {
            value.drop_with_heap(self.heap);
        }
        if let Some(export) = frame.export {
            export.drop_with_heap(self.heap);
        }
    }

    // === Fetching ===

    fn code_byte(&self, function: FunctionId, offset: usize) -> u8 {
        self.program.functions[function.index()].code.bytecode()[offset]
    }

    fn fetch_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("fetch with no frame");
        let function = frame.function;
        let ip = frame.ip;
        frame.ip += 1;
        self.code_byte(function, ip)
    }

    fn fetch_u8(&mut self) -> u8 {
        self.fetch_byte()
    }

    fn fetch_i8(&mut self) -> i8 {
        i8::from_ne_bytes([self.fetch_byte()])
    }

    fn fetch_u16(&mut self) -> u16 {
        let lo = self.fetch_byte();
        let hi = self.fetch_byte();
        u16::from_le_bytes([lo, hi])
    }

    fn fetch_i16(&mut self) -> i16 {
        let lo = self.fetch_byte();
        let hi = self.fetch_byte();
        i16::from_le_bytes([lo, hi])
    }

    /// Source position of the instruction currently executing.
    fn instruction_pos(&self) -> Pos {
        match self.frames.last() {
            Some(frame) => self.program.functions[frame.function.index()]
                .code
                .position_at(self.current_instruction),
            None => Pos::NONE,
        }
    }

    // === Stack ===

    fn push(&mut self, value: Value) -> RunResult<()> {
        if self.stack.len() >= self.max_stack {
            value.drop_with_heap(self.heap);
            return Err(RunError::new(ErrorKind::StackOverflow, "value stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn local_index(&self, slot: u8) -> usize {
        self.frames.last().expect("local access with no frame").base + usize::from(slot)
    }

    /// The cell id stored in a cell-promoted local slot.
    fn local_cell(&self, slot: u8) -> HeapId {
        match &self.stack[self.local_index(slot)] {
            Value::Ref(id) => *id,
            other => unreachable!("cell slot holds {other:?}"),
        }
    }

    fn jump(&mut self, offset: i16) -> RunResult<()> {
        if offset < 0 && self.interrupt.is_interrupted() {
            return Err(RunError::new(ErrorKind::Cancelled, "execution interrupted by host"));
        }
        let frame = self.frames.last_mut().expect("jump with no frame");
        let ip = i64::try_from(frame.ip).expect("ip fits i64") + i64::from(offset);
        frame.ip = usize::try_from(ip).expect("jump produced negative ip");
        Ok(())
    }

    // === Dispatch ===

    fn step(&mut self) -> RunResult<()> {
        let frame = self.frames.last().expect("step with no frame");
        self.current_instruction = frame.ip;
        let op = Opcode::decode(self.fetch_byte());
        match op {
            Opcode::Nop => Ok(()),
            Opcode::Pop => {
                let value = self.pop();
                value.drop_with_heap(self.heap);
                Ok(())
            }
            Opcode::Dup => {
                let top = self.stack.last().expect("dup on empty stack").raw_copy();
                let top = top.retained(self.heap);
                self.push(top)
            }
            Opcode::DupTwo => {
                let len = self.stack.len();
                let a = self.stack[len - 2].raw_copy().retained(self.heap);
                let b = self.stack[len - 1].raw_copy().retained(self.heap);
                self.push(a)?;
                self.push(b)
            }
            Opcode::LoadNil => self.push(Value::Nil),
            Opcode::LoadTrue => self.push(Value::Bool(true)),
            Opcode::LoadFalse => self.push(Value::Bool(false)),
            Opcode::LoadSmallInt => {
                let value = i64::from(self.fetch_i8());
                self.push(Value::Int(value))
            }
            Opcode::LoadConst => {
                let index = self.fetch_u16();
                let frame = self.frames.last().expect("step with no frame");
                let constant = self.program.functions[frame.function.index()].code.consts().get(index);
                let value = match constant {
                    Constant::Int(i) => Value::Int(i),
                    Constant::Float(f) => Value::Float(f),
                    Constant::Char(c) => Value::Char(c),
                    Constant::Str(id) => Value::InternString(id),
                    Constant::Func(_) => unreachable!("function constants load via MakeClosure"),
                };
                self.push(value)
            }
            Opcode::LoadLocal => {
                let slot = self.fetch_u8();
                let value = self.stack[self.local_index(slot)].raw_copy().retained(self.heap);
                self.push(value)
            }
            Opcode::StoreLocal => {
                let slot = self.fetch_u8();
                let value = self.pop();
                let index = self.local_index(slot);
                let old = std::mem::replace(&mut self.stack[index], value);
                old.drop_with_heap(self.heap);
                Ok(())
            }
            Opcode::LoadLocalCell => {
                let slot = self.fetch_u8();
                let cell = self.local_cell(slot);
                let HeapData::Cell(inner) = self.heap.get(cell) else {
                    unreachable!("cell slot holds a cell");
                };
                let value = inner.raw_copy();
                let value = value.retained(self.heap);
                self.push(value)
            }
            Opcode::StoreLocalCell => {
                let slot = self.fetch_u8();
                let value = self.pop();
                let cell = self.local_cell(slot);
                let HeapData::Cell(inner) = self.heap.get_mut(cell) else {
                    unreachable!("cell slot holds a cell");
                };
                let old = std::mem::replace(inner, value);
                old.drop_with_heap(self.heap);
                Ok(())
            }
            Opcode::LoadGlobal => {
                let index = usize::from(self.fetch_u16());
                let value = self.globals[index].raw_copy().retained(self.heap);
                self.push(value)
            }
            Opcode::StoreGlobal => {
                let index = usize::from(self.fetch_u16());
                let value = self.pop();
                let old = std::mem::replace(&mut self.globals[index], value);
                old.drop_with_heap(self.heap);
                Ok(())
            }
            Opcode::LoadFree => {
                let index = usize::from(self.fetch_u8());
                let frame = self.frames.last().expect("step with no frame");
                let cell = frame.captures[index];
                let HeapData::Cell(inner) = self.heap.get(cell) else {
                    unreachable!("capture holds a cell");
                };
                let value = inner.raw_copy();
                let value = value.retained(self.heap);
                self.push(value)
            }
            Opcode::StoreFree => {
                let index = usize::from(self.fetch_u8());
                let value = self.pop();
                let frame = self.frames.last().expect("step with no frame");
                let cell = frame.captures[index];
                let HeapData::Cell(inner) = self.heap.get_mut(cell) else {
                    unreachable!("capture holds a cell");
                };
                let old = std::mem::replace(inner, value);
                old.drop_with_heap(self.heap);
                Ok(())
            }
            Opcode::LoadBuiltin => {
                let index = usize::from(self.fetch_u8());
                self.push(Value::Builtin(self.program.universe[index]))
            }
            Opcode::Jump => {
                let offset = self.fetch_i16();
                self.jump(offset)
            }
            Opcode::JumpIfFalse => {
                let offset = self.fetch_i16();
                let value = self.pop();
                let truthy = value.truthy(self.heap, self.interns);
                value.drop_with_heap(self.heap);
                if truthy { Ok(()) } else { self.jump(offset) }
            }
            Opcode::JumpIfFalseOrPop => {
                let offset = self.fetch_i16();
                let truthy = self
                    .stack
                    .last()
                    .expect("jump on empty stack")
                    .truthy(self.heap, self.interns);
                if truthy {
                    let value = self.pop();
                    value.drop_with_heap(self.heap);
                    Ok(())
                } else {
                    self.jump(offset)
                }
            }
            Opcode::JumpIfTrueOrPop => {
                let offset = self.fetch_i16();
                let truthy = self
                    .stack
                    .last()
                    .expect("jump on empty stack")
                    .truthy(self.heap, self.interns);
                if truthy {
                    self.jump(offset)
                } else {
                    let value = self.pop();
                    value.drop_with_heap(self.heap);
                    Ok(())
                }
            }
            Opcode::Call => {
                let argc = usize::from(self.fetch_u8());
                self.call_value(argc, false)
            }
            Opcode::CallSpread => {
                let argc = self.spread_call_args()?;
                self.call_value(argc, false)
            }
            Opcode::TryCall => {
                let argc = usize::from(self.fetch_u8());
                self.call_value(argc, true)
            }
            Opcode::TryCallSpread => {
                let argc = self.spread_call_args()?;
                self.call_value(argc, true)
            }
            Opcode::Return => {
                let value = self.pop();
                self.exit_top_frame(FrameExit::Return(value));
                Ok(())
            }
            Opcode::MakeClosure => {
                let index = self.fetch_u16();
                self.make_closure(index)
            }
            Opcode::BuildArray => {
                let n = usize::from(self.fetch_u16());
                let elems: Vec<Value> = self.stack.drain(self.stack.len() - n..).collect();
                let id = self.heap.allocate(HeapData::Array(Array::new(elems)))?;
                self.push(Value::Ref(id))
            }
            Opcode::BuildTable => {
                let pairs = usize::from(self.fetch_u16());
                self.build_table(pairs)
            }
            Opcode::BuildTuple => {
                let n = usize::from(self.fetch_u16());
                let elems: Vec<Value> = self.stack.drain(self.stack.len() - n..).collect();
                let id = self.heap.allocate(HeapData::Tuple(Tuple::new(elems)))?;
                self.push(Value::Ref(id))
            }
            Opcode::BuildString => {
                let n = usize::from(self.fetch_u16());
                self.build_string(n)
            }
            Opcode::ArrayPush => {
                let value = self.pop();
                if let Err(err) = self.heap.tracker_mut().on_container_insert() {
                    value.drop_with_heap(self.heap);
                    return Err(err.into());
                }
                let Some(Value::Ref(id)) = self.stack.last() else {
                    unreachable!("array literal under construction");
                };
                let id = *id;
                let HeapData::Array(array) = self.heap.get_mut(id) else {
                    unreachable!("array literal under construction");
                };
                array.push(value);
                Ok(())
            }
            Opcode::ArrayExtend => {
                let seq = self.pop();
                self.array_extend(seq)
            }
            Opcode::Unpack => {
                let n = usize::from(self.fetch_u8());
                self.unpack(n)
            }
            Opcode::IndexGet => {
                let index = self.pop();
                let obj = self.pop();
                let result = collections::index_get(self.heap, self.interns, obj, index)?;
                self.push(result)
            }
            Opcode::IndexSet => {
                let value = self.pop();
                let index = self.pop();
                let obj = self.pop();
                collections::index_set(self.heap, self.interns, obj, index, value)
            }
            Opcode::Slice => {
                let high = self.pop();
                let low = self.pop();
                let obj = self.pop();
                let result = collections::slice(self.heap, self.interns, obj, low, high)?;
                self.push(result)
            }
            Opcode::FieldGet => {
                let name_id = StringId::from_index(self.fetch_u16());
                let obj = self.pop();
                let result = collections::field_get(self.heap, self.interns, obj, name_id)?;
                self.push(result)
            }
            Opcode::FieldSet => {
                let name_id = StringId::from_index(self.fetch_u16());
                let value = self.pop();
                let obj = self.pop();
                collections::field_set(self.heap, self.interns, obj, name_id, value)
            }
            Opcode::ToString => {
                let value = self.pop();
                if value.as_str(self.heap, self.interns).is_some() {
                    return self.push(value);
                }
                let text = value::fmt_display(&value, self.heap, self.interns);
                value.drop_with_heap(self.heap);
                let id = self.heap.allocate(HeapData::Str(Str::new(text)))?;
                self.push(Value::Ref(id))
            }
            Opcode::UnaryMinus | Opcode::UnaryPlus | Opcode::UnaryNot | Opcode::UnaryBitNot => {
                let operand = self.pop();
                let result = binary::unary(op, operand, self.heap, self.interns)?;
                self.push(result)
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Rem
            | Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::CompareEq
            | Opcode::CompareNe
            | Opcode::CompareLt
            | Opcode::CompareLe
            | Opcode::CompareGt
            | Opcode::CompareGe
            | Opcode::Contains => {
                let right = self.pop();
                let left = self.pop();
                let result = binary::binary(op, left, right, self.heap, self.interns)?;
                self.push(result)
            }
            Opcode::IterNew => {
                let iterable = self.pop();
                let iter = ToyIter::new(iterable, self.heap, self.interns)?;
                let id = self.heap.allocate(HeapData::Iter(iter))?;
                self.push(Value::Ref(id))
            }
            Opcode::IterNext => {
                let offset = self.fetch_i16();
                self.iter_advance(offset, false)
            }
            Opcode::IterNextPair => {
                let offset = self.fetch_i16();
                self.iter_advance(offset, true)
            }
            Opcode::DeferPush => {
                let argc = usize::from(self.fetch_u8());
                let args: Vec<Value> = self.stack.drain(self.stack.len() - argc..).collect();
                let callee = self.pop();
                self.frames
                    .last_mut()
                    .expect("defer with no frame")
                    .deferred
                    .push(DeferredCall { callee, args });
                Ok(())
            }
            Opcode::DeferPushSpread => {
                let seq = self.pop();
                let args = self.spread_to_vec(seq)?;
                let callee = self.pop();
                self.frames
                    .last_mut()
                    .expect("defer with no frame")
                    .deferred
                    .push(DeferredCall { callee, args });
                Ok(())
            }
            Opcode::Export => {
                let value = self.pop();
                let frame = self.frames.last_mut().expect("export with no frame");
                if let Some(old) = frame.export.replace(value) {
                    old.drop_with_heap(self.heap);
                }
                Ok(())
            }
            Opcode::Import => {
                let index = self.fetch_u16();
                self.import_module(index)
            }
        }
    }

    // === Instruction helpers ===

    fn make_closure(&mut self, const_index: u16) -> RunResult<()> {
        let frame = self.frames.last().expect("closure with no frame");
        let constant = self.program.functions[frame.function.index()]
            .code
            .consts()
            .get(const_index);
        let Constant::Func(function_id) = constant else {
            unreachable!("MakeClosure operand is a function constant");
        };
        let function = &self.program.functions[function_id.index()];
        if function.captures.is_empty() {
            return self.push(Value::Function(function_id));
        }
        let mut cells = Vec::with_capacity(function.captures.len());
        for capture in &function.captures {
            let cell = match capture {
                crate::symbol::Capture::Local(slot) => {
                    let index = frame.base + usize::from(*slot);
                    match &self.stack[index] {
                        Value::Ref(id) => *id,
                        other => unreachable!("captured slot holds {other:?}"),
                    }
                }
                crate::symbol::Capture::Free(index) => frame.captures[usize::from(*index)],
            };
            cells.push(cell);
        }
        for &cell in &cells {
            self.heap.inc_ref(cell);
        }
        let id = self.heap.allocate(HeapData::Closure(Closure {
            function: function_id,
            captures: cells,
        }))?;
        self.push(Value::Ref(id))
    }

    fn build_table(&mut self, pairs: usize) -> RunResult<()> {
        let mut entries: Vec<Value> = self.stack.drain(self.stack.len() - pairs * 2..).collect();
        let mut table = Table::with_capacity(pairs);
        let mut drain = entries.drain(..);
        while let (Some(key), Some(value)) = (drain.next(), drain.next()) {
            let slot = match self
                .heap
                .tracker_mut()
                .on_container_insert()
                .map_err(Into::into)
                .and_then(|()| table.find(&key, self.heap, self.interns))
            {
                Ok(slot) => slot,
                Err(err) => {
                    key.drop_with_heap(self.heap);
                    value.drop_with_heap(self.heap);
                    for leftover in drain {
                        leftover.drop_with_heap(self.heap);
                    }
                    table
                        .drain_entries()
                        .into_iter()
                        .flat_map(|(k, v)| [k, v])
                        .drop_with_heap(self.heap);
                    return Err(err);
                }
            };
            // Duplicate literal keys: first insertion order, last value.
            if let Some((dup_key, old_value)) = table.set_found(slot, key, value) {
                dup_key.drop_with_heap(self.heap);
                old_value.drop_with_heap(self.heap);
            }
        }
        drop(drain);
        let id = self.heap.allocate(HeapData::Table(table))?;
        self.push(Value::Ref(id))
    }

    fn build_string(&mut self, n: usize) -> RunResult<()> {
        let parts: Vec<Value> = self.stack.drain(self.stack.len() - n..).collect();
        let mut text = String::new();
        for part in &parts {
            match part.as_str(self.heap, self.interns) {
                Some(s) => text.push_str(s),
                None => text.push_str(&value::fmt_display(part, self.heap, self.interns)),
            }
        }
        parts.drop_with_heap(self.heap);
        let id = self.heap.allocate(HeapData::Str(Str::new(text)))?;
        self.push(Value::Ref(id))
    }

    fn array_extend(&mut self, seq: Value) -> RunResult<()> {
        let elems = self.spread_to_vec(seq)?;
        for _ in 0..elems.len() {
            if let Err(err) = self.heap.tracker_mut().on_container_insert() {
                elems.drop_with_heap(self.heap);
                return Err(err.into());
            }
        }
        let Some(Value::Ref(id)) = self.stack.last() else {
            unreachable!("array literal under construction");
        };
        let id = *id;
        let HeapData::Array(array) = self.heap.get_mut(id) else {
            unreachable!("array literal under construction");
        };
        for value in elems {
            array.push(value);
        }
        Ok(())
    }

    /// Reads a sequence into an owned element vector for `...` spreading.
    fn spread_to_vec(&mut self, seq: Value) -> RunResult<Vec<Value>> {
        let elems: Vec<Value> = match &seq {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Array(array) => array.as_slice().iter().map(Value::raw_copy).collect(),
                HeapData::Tuple(tuple) => tuple.as_slice().iter().map(Value::raw_copy).collect(),
                other => {
                    let message = format!("cannot spread {}", other.type_of());
                    seq.drop_with_heap(self.heap);
                    return Err(RunError::type_error(message));
                }
            },
            other => {
                let message = format!("cannot spread {}", other.type_of(self.heap));
                seq.drop_with_heap(self.heap);
                return Err(RunError::type_error(message));
            }
        };
        for value in &elems {
            if let Value::Ref(id) = value {
                self.heap.inc_ref(*id);
            }
        }
        seq.drop_with_heap(self.heap);
        Ok(elems)
    }

    /// Expands the argument array of a spread call in place, returning the
    /// actual argument count.
    fn spread_call_args(&mut self) -> RunResult<usize> {
        let seq = self.pop();
        let elems = self.spread_to_vec(seq)?;
        let argc = elems.len();
        for value in elems {
            self.push(value)?;
        }
        Ok(argc)
    }

    fn unpack(&mut self, n: usize) -> RunResult<()> {
        let seq = self.pop();
        let elems: Vec<Value> = match &seq {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Array(array) => array.as_slice().iter().map(Value::raw_copy).collect(),
                HeapData::Tuple(tuple) => tuple.as_slice().iter().map(Value::raw_copy).collect(),
                other => {
                    let message = format!("cannot unpack {}", other.type_of());
                    seq.drop_with_heap(self.heap);
                    return Err(RunError::type_error(message));
                }
            },
            other => {
                let message = format!("cannot unpack {}", other.type_of(self.heap));
                seq.drop_with_heap(self.heap);
                return Err(RunError::type_error(message));
            }
        };
        if elems.len() != n {
            let message = format!("cannot unpack {} values into {n} targets", elems.len());
            seq.drop_with_heap(self.heap);
            return Err(RunError::value(message));
        }
        for value in &elems {
            if let Value::Ref(id) = value {
                self.heap.inc_ref(*id);
            }
        }
        seq.drop_with_heap(self.heap);
        for value in elems {
            self.push(value)?;
        }
        Ok(())
    }

    fn iter_advance(&mut self, offset: i16, pair: bool) -> RunResult<()> {
        let Some(Value::Ref(id)) = self.stack.last() else {
            unreachable!("iterator on stack for IterNext");
        };
        let id = *id;
        match advance_iter(self.heap, id, pair) {
            Some((first, second)) => {
                if let Err(err) = self.push(first) {
                    if let Some(second) = second {
                        second.drop_with_heap(self.heap);
                    }
                    return Err(err);
                }
                if let Some(second) = second {
                    self.push(second)?;
                }
                Ok(())
            }
            None => self.jump(offset),
        }
    }

    fn import_module(&mut self, index: u16) -> RunResult<()> {
        if self.interrupt.is_interrupted() {
            return Err(RunError::new(ErrorKind::Cancelled, "execution interrupted by host"));
        }
        if let Some(cached) = &self.module_cache[usize::from(index)] {
            let value = cached.raw_copy().retained(self.heap);
            return self.push(value);
        }
        match self.program.modules.get(index) {
            // Builtin modules are immediate handles; nothing to execute.
            crate::modules::ModuleDef::Builtin(builtin) => {
                self.push(Value::Builtin(Builtin::ModuleHandle(*builtin)))
            }
            crate::modules::ModuleDef::Source { unit, .. } => self.push_unit_frame(*unit, Some(index)),
        }
    }

    /// Pushes a frame for a parameterless unit: the entry module or an
    /// imported source module.
    fn push_unit_frame(&mut self, unit: FunctionId, module_index: Option<u16>) -> RunResult<()> {
        if self.frames.len() >= self.max_frames {
            return Err(RunError::new(ErrorKind::StackOverflow, "call stack overflow"));
        }
        let function = &self.program.functions[unit.index()];
        let base = self.stack.len();
        if base + usize::from(function.num_locals) > self.max_stack {
            return Err(RunError::new(ErrorKind::StackOverflow, "value stack overflow"));
        }
        for _ in 0..function.num_locals {
            self.stack.push(Value::Nil);
        }
        let cell_slots = function.cell_slots.clone();
        for slot in cell_slots {
            let index = base + usize::from(slot);
            let current = std::mem::replace(&mut self.stack[index], Value::Nil);
            let cell = self.heap.allocate(HeapData::Cell(current))?;
            self.stack[index] = Value::Ref(cell);
        }
        self.frames.push(Frame {
            function: unit,
            ip: 0,
            base,
            floor: base,
            captures: Vec::new(),
            deferred: Vec::new(),
            exit: None,
            is_try: false,
            module_index,
            export: None,
            discard_result: false,
        });
        Ok(())
    }

    // === Panic / frame exit ===

    /// Starts unwinding with `err` from the current instruction.
    fn start_unwind(&mut self, err: RunError) {
        let err = err.at(self.instruction_pos());
        if self.pending_panic.is_some() {
            // A second failure while already unwinding (e.g. out of memory
            // while building the catch tuple): abort the run outright.
            self.abort(err);
            return;
        }
        let Some(frame) = self.frames.last_mut() else {
            self.abort(err);
            return;
        };
        let already_exiting = frame.exit.is_some();
        if !already_exiting {
            // Rewind to the faulting instruction so the backtrace points
            // at it.
            frame.ip = self.current_instruction;
        }
        self.pending_panic = Some(err);
        if already_exiting {
            // The failure struck while delivering a frame completion; the
            // exiting frame turns into a panic exit.
            self.continue_frame_exit();
        } else {
            self.exit_top_frame(FrameExit::Panic);
        }
    }

    fn abort(&mut self, err: RunError) {
        let trace = std::mem::take(&mut self.trace);
        self.aborted = Some(RunOutcome {
            error: err.error,
            pos: err.pos,
            trace,
        });
    }

    /// Marks the top frame as exiting and drives its exit as far as
    /// possible (deferred calls may suspend the exit by pushing frames).
    fn exit_top_frame(&mut self, exit: FrameExit) {
        let frame = self.frames.last_mut().expect("exit with no frame");
        debug_assert!(frame.exit.is_none(), "frame already exiting");
        frame.exit = Some(exit);
        self.continue_frame_exit();
    }

    /// Runs the exiting top frame's remaining deferred calls, then pops it.
    fn continue_frame_exit(&mut self) {
        loop {
            let frame_index = self.frames.len() - 1;
            let Some(call) = self.frames[frame_index].deferred.pop() else {
                self.finish_frame_pop();
                return;
            };
            match self.invoke_deferred(call) {
                // A script function was pushed; the dispatch loop runs it
                // and the exit resumes when it pops.
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    // A failing deferred call replaces the panic in flight.
                    let err = err.at(self.instruction_pos());
                    self.pending_panic = Some(err);
                    let frame = &mut self.frames[frame_index];
                    frame.exit = Some(match frame.exit.take() {
                        Some(FrameExit::Return(value)) => {
                            value.drop_with_heap(self.heap);
                            FrameExit::Panic
                        }
                        _ => FrameExit::Panic,
                    });
                }
            }
        }
    }

    /// Invokes one deferred call. Returns true when a frame was pushed.
    fn invoke_deferred(&mut self, call: DeferredCall) -> RunResult<bool> {
        let depth_before = self.frames.len();
        let argc = call.args.len();
        self.push(call.callee)?;
        for value in call.args {
            self.push(value)?;
        }
        self.call_value(argc, false)?;
        if self.frames.len() > depth_before {
            self.frames.last_mut().expect("frame just pushed").discard_result = true;
            Ok(true)
        } else {
            // A builtin ran synchronously; discard its result.
            let result = self.pop();
            result.drop_with_heap(self.heap);
            Ok(false)
        }
    }

    /// Pops the exiting top frame and delivers its completion.
    fn finish_frame_pop(&mut self) {
        let mut frame = self.frames.pop().expect("pop with no frame");
        while self.stack.len() > frame.floor {
            let value = self.pop();
            value.drop_with_heap(self.heap);
        }
        let exit = frame.exit.take().expect("popping a frame that is not exiting");
        let export = frame.export.take();

        if let Some(err) = self.pending_panic.take() {
            // Unwinding. Record the backtrace frame and keep going.
            if let Some(value) = match exit {
                FrameExit::Return(value) => Some(value),
                FrameExit::Panic => None,
            } {
                value.drop_with_heap(self.heap);
            }
            if let Some(export) = export {
                export.drop_with_heap(self.heap);
            }
            self.trace.push(TraceFrame {
                function: self.program.functions[frame.function.index()].name,
                pos: self.program.functions[frame.function.index()]
                    .code
                    .position_at(frame.ip),
            });

            if frame.is_try {
                // The innermost try-call catches the panic as a value.
                match self.catch_into_tuple(err) {
                    Ok(()) => {}
                    Err(second) => self.abort(second),
                }
                return;
            }
            if self.frames.is_empty() {
                self.abort(err);
                return;
            }
            self.pending_panic = Some(err);
            // The caller may already be mid-exit (this frame came from its
            // deferred list); in that case its remaining deferred calls
            // still run before the panic continues through it.
            if self.frames.last().is_some_and(|f| f.exit.is_some()) {
                self.continue_frame_exit();
            } else {
                self.exit_top_frame(FrameExit::Panic);
            }
            return;
        }

        // Normal completion — or a recovered panic, which completes with
        // nil.
        let value = match exit {
            FrameExit::Return(value) => value,
            FrameExit::Panic => Value::Nil,
        };

        if let Some(module_index) = frame.module_index {
            // Import completion: the module's value is its export.
            value.drop_with_heap(self.heap);
            let result = export.unwrap_or(Value::Nil);
            if self.frames.is_empty() {
                self.final_result = Some(result);
            } else {
                let cached = result.clone_with_heap(self.heap);
                self.module_cache[usize::from(module_index)] = Some(cached);
                if let Err(err) = self.push(result) {
                    self.start_unwind(err);
                }
            }
            self.after_normal_pop();
            return;
        }
        if self.frames.is_empty() {
            // The entry unit finished: its result is its export.
            value.drop_with_heap(self.heap);
            self.final_result = Some(export.unwrap_or(Value::Nil));
            return;
        }
        if let Some(export) = export {
            export.drop_with_heap(self.heap);
        }

        if frame.discard_result {
            value.drop_with_heap(self.heap);
        } else if frame.is_try {
            match self.wrap_try_success(value) {
                Ok(()) => {}
                Err(err) => {
                    self.start_unwind(err);
                    return;
                }
            }
        } else if let Err(err) = self.push(value) {
            self.start_unwind(err);
            return;
        }
        self.after_normal_pop();
    }

    /// After a normal pop, the caller may itself be mid-exit (it pushed
    /// this frame from a deferred call).
    fn after_normal_pop(&mut self) {
        if self.frames.last().is_some_and(|f| f.exit.is_some()) {
            self.continue_frame_exit();
        }
    }

    /// Converts a caught panic into a `(nil, error)` tuple on the caller's
    /// stack.
    fn catch_into_tuple(&mut self, err: RunError) -> RunResult<()> {
        let error_id = self.heap.allocate(HeapData::Error(err.error))?;
        let tuple = self
            .heap
            .allocate(HeapData::Tuple(Tuple::new(vec![Value::Nil, Value::Ref(error_id)])))?;
        self.trace.clear();
        self.push(Value::Ref(tuple))?;
        self.after_normal_pop();
        Ok(())
    }

    /// Wraps a try-call's normal result into `(result, nil)`.
    fn wrap_try_success(&mut self, value: Value) -> RunResult<()> {
        let tuple = self.heap.allocate(HeapData::Tuple(Tuple::new(vec![value, Value::Nil])))?;
        self.push(Value::Ref(tuple))
    }

    /// Builds an error value for `recover()` from the pending panic.
    fn take_recovered(&mut self) -> RunResult<Value> {
        match self.pending_panic.take() {
            Some(err) => {
                self.trace.clear();
                let id = self.heap.allocate(HeapData::Error(err.error))?;
                Ok(Value::Ref(id))
            }
            None => Ok(Value::Nil),
        }
    }
}
