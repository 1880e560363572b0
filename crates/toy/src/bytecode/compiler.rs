//! The AST-to-bytecode compiler.
//!
//! One code unit is emitted for the top level of each module plus one per
//! function literal. All units are stored uniformly as [`Function`]s: the
//! entry unit binds its declarations to global slots, module units and
//! function literals bind locals.
//!
//! Compilation never aborts on the first problem; diagnostics accumulate
//! and the caller refuses to produce a program when any exist.

use std::path::PathBuf;

use ahash::AHashMap;

use crate::{
    ast::{
        BinaryOp, ElseArm, Expr, ExprNode, FuncBody, FuncLit, InterpPart, LogicalOp, SpreadElement, Stmt, StmtNode,
        TableKey, UnaryOp,
    },
    builtins::Builtin,
    bytecode::{
        CodeBuilder, Opcode,
        builder::JumpLabel,
        code::Constant,
    },
    error::Diagnostic,
    function::{Function, FunctionId, Signature},
    intern::{InternerBuilder, Interns},
    lexer::Lexer,
    modules::{BuiltinModule, ModuleDef, ModuleTable},
    parser,
    source::{FileSet, Pos},
    symbol::{Symbol, SymbolScope, SymbolTable},
};

/// A fully compiled program, ready for the VM.
#[derive(Debug)]
pub(crate) struct Program {
    /// The entry unit.
    pub main: FunctionId,
    /// Every compiled unit and function literal.
    pub functions: Vec<Function>,
    /// The name → module map referenced by `Import` operands.
    pub modules: ModuleTable,
    pub interns: Interns,
    /// Universe builtins in `LoadBuiltin` operand order.
    pub universe: Vec<Builtin>,
    /// Global slots the entry unit (and REPL continuations) may touch.
    pub num_globals: u16,
}

/// What kind of unit is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    /// The entry unit: declarations bind global slots.
    Main,
    /// An imported module's top level: declarations bind locals.
    Module,
    /// A function literal body.
    Function,
}

/// Per-loop compilation state.
#[derive(Debug)]
struct LoopCtx {
    label: Option<String>,
    /// Bytecode offset of the loop head (the back-edge target).
    start: usize,
    break_jumps: Vec<JumpLabel>,
    continue_jumps: Vec<JumpLabel>,
    /// True for `for`-`in` loops, which keep their iterator on the operand
    /// stack for the duration of the loop.
    has_iter: bool,
}

/// One unit under compilation.
struct Unit {
    builder: CodeBuilder,
    kind: UnitKind,
    loops: Vec<LoopCtx>,
    export_seen: bool,
}

impl Unit {
    fn new(kind: UnitKind) -> Self {
        Self {
            builder: CodeBuilder::new(),
            kind,
            loops: Vec::new(),
            export_seen: false,
        }
    }
}

/// The compiler. Symbol table, interner, function table, and module table
/// are borrowed so a REPL session can keep them alive across evaluations.
pub(crate) struct Compiler<'a> {
    symbols: &'a mut SymbolTable,
    interner: &'a mut InternerBuilder,
    functions: &'a mut Vec<Function>,
    modules: &'a mut ModuleTable,
    file_set: &'a mut FileSet,
    import_dir: Option<PathBuf>,
    import_stack: Vec<String>,
    /// Function-body dedup: content hash → candidate ids.
    dedup: AHashMap<u64, Vec<FunctionId>>,
    errors: Vec<Diagnostic>,
    /// Label waiting to attach to the next loop statement.
    pending_label: Option<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(
        symbols: &'a mut SymbolTable,
        interner: &'a mut InternerBuilder,
        functions: &'a mut Vec<Function>,
        modules: &'a mut ModuleTable,
        file_set: &'a mut FileSet,
        import_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            symbols,
            interner,
            functions,
            modules,
            file_set,
            import_dir,
            import_stack: Vec::new(),
            dedup: AHashMap::new(),
            errors: Vec::new(),
            pending_label: None,
        }
    }

    /// Compiles the entry unit. Returns its function id, or every
    /// diagnostic collected along the way.
    pub fn compile_main(mut self, stmts: &[StmtNode]) -> Result<FunctionId, Vec<Diagnostic>> {
        let mut unit = Unit::new(UnitKind::Main);
        for stmt in stmts {
            self.compile_stmt(&mut unit, stmt);
        }
        unit.builder.emit(Opcode::LoadNil);
        unit.builder.emit(Opcode::Return);
        let name = self.interner.intern("<module>");
        let function = Function {
            name,
            signature: Signature::default(),
            num_locals: 0,
            cell_slots: Vec::new(),
            captures: Vec::new(),
            code: unit.builder.build(),
        };
        let id = self.add_function(function, Pos::NONE);
        if self.errors.is_empty() {
            Ok(id)
        } else {
            Err(self.errors)
        }
    }

    fn error(&mut self, message: impl Into<String>, pos: Pos) {
        self.errors.push(Diagnostic::new(message, pos));
    }

    // === Statements ===

    fn compile_stmt(&mut self, unit: &mut Unit, node: &StmtNode) {
        unit.builder.set_location(node.pos);
        match &node.stmt {
            Stmt::Expr(expr) => {
                self.compile_expr(unit, expr);
                unit.builder.emit(Opcode::Pop);
            }
            Stmt::Declare { names, values } => self.compile_declare(unit, names, values, node.pos),
            Stmt::Assign { targets, op, values } => self.compile_assign(unit, targets, *op, values, node.pos),
            Stmt::If {
                init,
                cond,
                then,
                otherwise,
            } => self.compile_if(unit, init.as_deref(), cond, then, otherwise.as_ref()),
            Stmt::For { init, cond, post, body } => {
                self.compile_for(unit, init.as_deref(), cond.as_ref(), post.as_deref(), body);
            }
            Stmt::ForIn {
                key,
                value,
                iterable,
                body,
            } => self.compile_for_in(unit, key, value.as_ref(), iterable, body),
            Stmt::Labeled { label, stmt } => {
                self.pending_label = Some(label.clone());
                self.compile_stmt(unit, stmt);
                // A label on a non-loop statement simply goes unused.
                self.pending_label = None;
            }
            Stmt::Break { label } => self.compile_break(unit, label.as_deref(), node.pos),
            Stmt::Continue { label } => self.compile_continue(unit, label.as_deref(), node.pos),
            Stmt::Return { values } => self.compile_return(unit, values, node.pos),
            Stmt::Defer { call } => self.compile_defer(unit, call, node.pos),
            Stmt::Export { value } => self.compile_export(unit, value, node.pos),
            Stmt::Block(stmts) => {
                self.symbols.enter_block();
                for stmt in stmts {
                    self.compile_stmt(unit, stmt);
                }
                self.symbols.leave_block();
            }
            Stmt::Empty | Stmt::Bad => {}
        }
    }

    fn define(&mut self, name: &str, pos: Pos) -> Option<Symbol> {
        match self.symbols.define(name, pos) {
            Ok(symbol) => Some(symbol),
            Err(redecl) => {
                self.error(format!("'{}' is already declared in this scope", redecl.name), pos);
                None
            }
        }
    }

    fn emit_store(&mut self, unit: &mut Unit, symbol: Symbol, pos: Pos) {
        match symbol.scope {
            SymbolScope::Global => unit.builder.emit_u16(Opcode::StoreGlobal, symbol.index),
            SymbolScope::Local => match u8::try_from(symbol.index) {
                Ok(slot) => unit.builder.emit_u8(Opcode::StoreLocal, slot),
                Err(_) => self.error("too many locals in function", pos),
            },
            SymbolScope::Free => match u8::try_from(symbol.index) {
                Ok(slot) => unit.builder.emit_u8(Opcode::StoreFree, slot),
                Err(_) => self.error("too many captured variables", pos),
            },
            SymbolScope::Builtin => self.error("cannot assign to a builtin", pos),
        }
    }

    fn emit_load(&mut self, unit: &mut Unit, symbol: Symbol, pos: Pos) {
        match symbol.scope {
            SymbolScope::Global => unit.builder.emit_u16(Opcode::LoadGlobal, symbol.index),
            SymbolScope::Local => match u8::try_from(symbol.index) {
                Ok(slot) => unit.builder.emit_u8(Opcode::LoadLocal, slot),
                Err(_) => self.error("too many locals in function", pos),
            },
            SymbolScope::Free => match u8::try_from(symbol.index) {
                Ok(slot) => unit.builder.emit_u8(Opcode::LoadFree, slot),
                Err(_) => self.error("too many captured variables", pos),
            },
            SymbolScope::Builtin => match u8::try_from(symbol.index) {
                Ok(index) => unit.builder.emit_u8(Opcode::LoadBuiltin, index),
                Err(_) => self.error("builtin index out of range", pos),
            },
        }
    }

    fn compile_declare(&mut self, unit: &mut Unit, names: &[(String, Pos)], values: &[ExprNode], pos: Pos) {
        // Names are defined before the values compile so `f := fn() {
        // f() }` can refer to itself; the slot holds nil until the store.
        let symbols: Vec<Option<Symbol>> = names
            .iter()
            .map(|(name, name_pos)| self.define(name, *name_pos))
            .collect();

        if values.len() == names.len() {
            for (value, (name, _)) in values.iter().zip(names) {
                self.compile_named_expr(unit, value, Some(name));
            }
        } else if values.len() == 1 {
            self.compile_expr(unit, &values[0]);
            match u8::try_from(names.len()) {
                Ok(n) => unit.builder.emit_u8(Opcode::Unpack, n),
                Err(_) => self.error("too many declaration targets", pos),
            }
        } else {
            self.error(
                format!(
                    "declaration arity mismatch: {} names but {} values",
                    names.len(),
                    values.len()
                ),
                pos,
            );
            return;
        }

        for (symbol, (_, name_pos)) in symbols.into_iter().zip(names).rev() {
            match symbol {
                Some(symbol) => self.emit_store(unit, symbol, *name_pos),
                None => unit.builder.emit(Opcode::Pop),
            }
        }
    }

    fn compile_assign(
        &mut self,
        unit: &mut Unit,
        targets: &[ExprNode],
        op: Option<BinaryOp>,
        values: &[ExprNode],
        pos: Pos,
    ) {
        if targets.len() > 1 {
            if op.is_some() {
                // The parser already rejected this; nothing to emit.
                return;
            }
            self.compile_multi_assign(unit, targets, values, pos);
            return;
        }
        let Some(target) = targets.first() else {
            return;
        };
        let Some(value) = values.first() else {
            return;
        };
        if values.len() != 1 {
            self.error("single-target assignment takes a single value", pos);
            return;
        }

        match (&target.expr, op) {
            (Expr::Ident(name), None) => {
                let Some(symbol) = self.resolve_for_store(name, target.pos) else {
                    return;
                };
                self.compile_named_expr(unit, value, Some(name));
                self.emit_store(unit, symbol, target.pos);
            }
            (Expr::Ident(name), Some(op)) => {
                let Some(symbol) = self.resolve_for_store(name, target.pos) else {
                    return;
                };
                self.emit_load(unit, symbol, target.pos);
                self.compile_expr(unit, value);
                unit.builder.emit(binary_opcode(op));
                self.emit_store(unit, symbol, target.pos);
            }
            (Expr::Index { obj, index }, None) => {
                self.compile_expr(unit, obj);
                self.compile_expr(unit, index);
                self.compile_expr(unit, value);
                unit.builder.emit(Opcode::IndexSet);
            }
            (Expr::Index { obj, index }, Some(op)) => {
                self.compile_expr(unit, obj);
                self.compile_expr(unit, index);
                unit.builder.emit(Opcode::DupTwo);
                unit.builder.emit(Opcode::IndexGet);
                self.compile_expr(unit, value);
                unit.builder.emit(binary_opcode(op));
                unit.builder.emit(Opcode::IndexSet);
            }
            (Expr::Selector { obj, field, field_pos }, None) => {
                self.compile_expr(unit, obj);
                self.compile_expr(unit, value);
                let name = self.intern_operand(field, *field_pos);
                unit.builder.emit_u16(Opcode::FieldSet, name);
            }
            (Expr::Selector { obj, field, field_pos }, Some(op)) => {
                self.compile_expr(unit, obj);
                unit.builder.emit(Opcode::Dup);
                let name = self.intern_operand(field, *field_pos);
                unit.builder.emit_u16(Opcode::FieldGet, name);
                self.compile_expr(unit, value);
                unit.builder.emit(binary_opcode(op));
                unit.builder.emit_u16(Opcode::FieldSet, name);
            }
            (Expr::Bad, _) => {}
            _ => self.error("cannot assign to this expression", target.pos),
        }
    }

    fn compile_multi_assign(&mut self, unit: &mut Unit, targets: &[ExprNode], values: &[ExprNode], pos: Pos) {
        // Multi-target assignment binds identifiers; storing through index
        // or selector targets needs a single-target statement per store.
        let mut symbols = Vec::with_capacity(targets.len());
        for target in targets {
            match &target.expr {
                Expr::Ident(name) => symbols.push(self.resolve_for_store(name, target.pos)),
                Expr::Bad => symbols.push(None),
                _ => {
                    self.error("multi-target assignment targets must be identifiers", target.pos);
                    symbols.push(None);
                }
            }
        }

        if values.len() == targets.len() {
            for value in values {
                self.compile_expr(unit, value);
            }
        } else if values.len() == 1 {
            self.compile_expr(unit, &values[0]);
            match u8::try_from(targets.len()) {
                Ok(n) => unit.builder.emit_u8(Opcode::Unpack, n),
                Err(_) => self.error("too many assignment targets", pos),
            }
        } else {
            self.error(
                format!(
                    "assignment arity mismatch: {} targets but {} values",
                    targets.len(),
                    values.len()
                ),
                pos,
            );
            return;
        }

        for (symbol, target) in symbols.into_iter().zip(targets).rev() {
            match symbol {
                Some(symbol) => self.emit_store(unit, symbol, target.pos),
                None => unit.builder.emit(Opcode::Pop),
            }
        }
    }

    fn resolve_for_store(&mut self, name: &str, pos: Pos) -> Option<Symbol> {
        match self.symbols.resolve(name) {
            Some(symbol) if symbol.scope == SymbolScope::Builtin => {
                self.error("cannot assign to a builtin", pos);
                None
            }
            Some(symbol) => Some(symbol),
            None => {
                self.error(format!("undefined identifier '{name}'"), pos);
                None
            }
        }
    }

    fn compile_if(
        &mut self,
        unit: &mut Unit,
        init: Option<&StmtNode>,
        cond: &ExprNode,
        then: &[StmtNode],
        otherwise: Option<&ElseArm>,
    ) {
        self.symbols.enter_block();
        if let Some(init) = init {
            self.compile_stmt(unit, init);
        }
        self.compile_expr(unit, cond);
        let jump_else = unit.builder.emit_jump(Opcode::JumpIfFalse);

        self.symbols.enter_block();
        for stmt in then {
            self.compile_stmt(unit, stmt);
        }
        self.symbols.leave_block();

        match otherwise {
            Some(arm) => {
                let jump_end = unit.builder.emit_jump(Opcode::Jump);
                unit.builder.patch_jump(jump_else);
                match arm {
                    ElseArm::Block(stmts) => {
                        self.symbols.enter_block();
                        for stmt in stmts {
                            self.compile_stmt(unit, stmt);
                        }
                        self.symbols.leave_block();
                    }
                    ElseArm::If(stmt) => self.compile_stmt(unit, stmt),
                }
                unit.builder.patch_jump(jump_end);
            }
            None => unit.builder.patch_jump(jump_else),
        }
        self.symbols.leave_block();
    }

    fn compile_for(
        &mut self,
        unit: &mut Unit,
        init: Option<&StmtNode>,
        cond: Option<&ExprNode>,
        post: Option<&StmtNode>,
        body: &[StmtNode],
    ) {
        self.symbols.enter_block();
        if let Some(init) = init {
            self.compile_stmt(unit, init);
        }
        let start = unit.builder.current_offset();
        let exit = cond.map(|cond| {
            self.compile_expr(unit, cond);
            unit.builder.emit_jump(Opcode::JumpIfFalse)
        });

        unit.loops.push(LoopCtx {
            label: self.pending_label.take(),
            start,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            has_iter: false,
        });
        self.symbols.enter_block();
        for stmt in body {
            self.compile_stmt(unit, stmt);
        }
        self.symbols.leave_block();
        let ctx = unit.loops.pop().expect("loop context pushed above");

        // `continue` lands on the post clause (or directly on the back edge).
        for jump in ctx.continue_jumps {
            unit.builder.patch_jump(jump);
        }
        if let Some(post) = post {
            self.compile_stmt(unit, post);
        }
        unit.builder.emit_jump_to(Opcode::Jump, start);

        if let Some(exit) = exit {
            unit.builder.patch_jump(exit);
        }
        for jump in ctx.break_jumps {
            unit.builder.patch_jump(jump);
        }
        self.symbols.leave_block();
    }

    fn compile_for_in(
        &mut self,
        unit: &mut Unit,
        key: &(String, Pos),
        value: Option<&(String, Pos)>,
        iterable: &ExprNode,
        body: &[StmtNode],
    ) {
        self.symbols.enter_block();
        self.compile_expr(unit, iterable);
        unit.builder.emit(Opcode::IterNew);

        let start = unit.builder.current_offset();
        let exit = unit.builder.emit_jump(if value.is_some() {
            Opcode::IterNextPair
        } else {
            Opcode::IterNext
        });

        unit.loops.push(LoopCtx {
            label: self.pending_label.take(),
            start,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            has_iter: true,
        });

        self.symbols.enter_block();
        // Bind in reverse push order: the value sits on top for the pair
        // form.
        let key_symbol = self.define(&key.0, key.1);
        let value_symbol = value.and_then(|(name, pos)| self.define(name, *pos));
        if value.is_some() {
            match value_symbol {
                Some(symbol) => self.emit_store(unit, symbol, key.1),
                None => unit.builder.emit(Opcode::Pop),
            }
        }
        match key_symbol {
            Some(symbol) => self.emit_store(unit, symbol, key.1),
            None => unit.builder.emit(Opcode::Pop),
        }

        for stmt in body {
            self.compile_stmt(unit, stmt);
        }
        self.symbols.leave_block();

        let ctx = unit.loops.pop().expect("loop context pushed above");
        for jump in ctx.continue_jumps {
            unit.builder.patch_jump(jump);
        }
        unit.builder.emit_jump_to(Opcode::Jump, start);

        // Exhaustion lands here: discard the iterator, which closes it.
        unit.builder.patch_jump(exit);
        unit.builder.emit(Opcode::Pop);
        for jump in ctx.break_jumps {
            unit.builder.patch_jump(jump);
        }
        self.symbols.leave_block();
    }

    /// Finds the target loop for a break/continue by optional label.
    fn find_loop(loops: &[LoopCtx], label: Option<&str>) -> Option<usize> {
        match label {
            Some(label) => loops.iter().rposition(|l| l.label.as_deref() == Some(label)),
            None => loops.len().checked_sub(1),
        }
    }

    fn compile_break(&mut self, unit: &mut Unit, label: Option<&str>, pos: Pos) {
        let Some(target) = Self::find_loop(&unit.loops, label) else {
            self.error(
                match label {
                    Some(label) => format!("break label '{label}' not found"),
                    None => "break outside of a loop".to_owned(),
                },
                pos,
            );
            return;
        };
        // Leaving a `for`-`in` loop discards its stacked iterator; breaking
        // through several loops discards each one, innermost first.
        let iter_pops = unit.loops[target..].iter().filter(|l| l.has_iter).count();
        for _ in 0..iter_pops {
            unit.builder.emit(Opcode::Pop);
        }
        let jump = unit.builder.emit_jump(Opcode::Jump);
        unit.loops[target].break_jumps.push(jump);
    }

    fn compile_continue(&mut self, unit: &mut Unit, label: Option<&str>, pos: Pos) {
        let Some(target) = Self::find_loop(&unit.loops, label) else {
            self.error(
                match label {
                    Some(label) => format!("continue label '{label}' not found"),
                    None => "continue outside of a loop".to_owned(),
                },
                pos,
            );
            return;
        };
        // Iterators of loops *inside* the target are discarded; the target
        // loop's own iterator stays live for the next iteration.
        let iter_pops = unit.loops[target + 1..].iter().filter(|l| l.has_iter).count();
        for _ in 0..iter_pops {
            unit.builder.emit(Opcode::Pop);
        }
        let jump = unit.builder.emit_jump(Opcode::Jump);
        unit.loops[target].continue_jumps.push(jump);
    }

    fn compile_return(&mut self, unit: &mut Unit, values: &[ExprNode], pos: Pos) {
        if unit.kind != UnitKind::Function {
            self.error("return outside of a function", pos);
            return;
        }
        match values.len() {
            0 => unit.builder.emit(Opcode::LoadNil),
            1 => self.compile_expr(unit, &values[0]),
            n => {
                for value in values {
                    self.compile_expr(unit, value);
                }
                match u16::try_from(n) {
                    Ok(n) => unit.builder.emit_u16(Opcode::BuildTuple, n),
                    Err(_) => self.error("too many return values", pos),
                }
            }
        }
        unit.builder.emit(Opcode::Return);
    }

    fn compile_defer(&mut self, unit: &mut Unit, call: &ExprNode, pos: Pos) {
        let mut inner = call;
        while let Expr::Paren(next) = &inner.expr {
            inner = next;
        }
        let Expr::Call { callee, args } = &inner.expr else {
            // The parser reported this already.
            return;
        };
        self.compile_expr(unit, callee);
        if args.iter().any(|a| a.splat) {
            self.compile_spread_array(unit, args, pos);
            unit.builder.emit(Opcode::DeferPushSpread);
        } else {
            for arg in args {
                self.compile_expr(unit, &arg.expr);
            }
            match u8::try_from(args.len()) {
                Ok(argc) => unit.builder.emit_u8(Opcode::DeferPush, argc),
                Err(_) => self.error("too many arguments", pos),
            }
        }
    }

    fn compile_export(&mut self, unit: &mut Unit, value: &ExprNode, pos: Pos) {
        if unit.kind == UnitKind::Function {
            self.error("export outside of the module's top level", pos);
            return;
        }
        if unit.export_seen {
            self.error("module already has an export", pos);
            return;
        }
        unit.export_seen = true;
        self.compile_expr(unit, value);
        unit.builder.emit(Opcode::Export);
    }

    // === Expressions ===

    fn compile_expr(&mut self, unit: &mut Unit, node: &ExprNode) {
        self.compile_named_expr(unit, node, None);
    }

    /// Compiles an expression; `binding_name` names function literals bound
    /// directly by a declaration or assignment, for backtraces.
    fn compile_named_expr(&mut self, unit: &mut Unit, node: &ExprNode, binding_name: Option<&str>) {
        unit.builder.set_location(node.pos);
        match &node.expr {
            Expr::Nil => unit.builder.emit(Opcode::LoadNil),
            Expr::Bool(true) => unit.builder.emit(Opcode::LoadTrue),
            Expr::Bool(false) => unit.builder.emit(Opcode::LoadFalse),
            Expr::Int(i) => self.emit_int(unit, *i, node.pos),
            Expr::Float(f) => self.emit_const(unit, Constant::Float(*f), node.pos),
            Expr::Char(c) => self.emit_const(unit, Constant::Char(*c), node.pos),
            Expr::Str(s) => {
                let id = self.interner.intern(s);
                self.emit_const(unit, Constant::Str(id), node.pos);
            }
            Expr::Interp(parts) => self.compile_interp(unit, parts, node.pos),
            Expr::Ident(name) => match self.symbols.resolve(name) {
                Some(symbol) => self.emit_load(unit, symbol, node.pos),
                None => {
                    self.error(format!("undefined identifier '{name}'"), node.pos);
                    unit.builder.emit(Opcode::LoadNil);
                }
            },
            Expr::Unary { op, operand } => self.compile_unary(unit, *op, operand, node.pos),
            Expr::Binary { op, left, right } => {
                self.compile_expr(unit, left);
                self.compile_expr(unit, right);
                unit.builder.set_location(node.pos);
                unit.builder.emit(binary_opcode(*op));
            }
            Expr::Logical { op, left, right } => {
                self.compile_expr(unit, left);
                let jump = unit.builder.emit_jump(match op {
                    LogicalOp::And => Opcode::JumpIfFalseOrPop,
                    LogicalOp::Or => Opcode::JumpIfTrueOrPop,
                });
                self.compile_expr(unit, right);
                unit.builder.patch_jump(jump);
            }
            Expr::Ternary { cond, then, otherwise } => {
                self.compile_expr(unit, cond);
                let jump_else = unit.builder.emit_jump(Opcode::JumpIfFalse);
                self.compile_expr(unit, then);
                let jump_end = unit.builder.emit_jump(Opcode::Jump);
                unit.builder.patch_jump(jump_else);
                self.compile_expr(unit, otherwise);
                unit.builder.patch_jump(jump_end);
            }
            Expr::Index { obj, index } => {
                self.compile_expr(unit, obj);
                self.compile_expr(unit, index);
                unit.builder.set_location(node.pos);
                unit.builder.emit(Opcode::IndexGet);
            }
            Expr::Slice { obj, low, high } => {
                self.compile_expr(unit, obj);
                match low {
                    Some(low) => self.compile_expr(unit, low),
                    None => unit.builder.emit(Opcode::LoadNil),
                }
                match high {
                    Some(high) => self.compile_expr(unit, high),
                    None => unit.builder.emit(Opcode::LoadNil),
                }
                unit.builder.set_location(node.pos);
                unit.builder.emit(Opcode::Slice);
            }
            Expr::Selector { obj, field, field_pos } => {
                self.compile_expr(unit, obj);
                let name = self.intern_operand(field, *field_pos);
                unit.builder.set_location(*field_pos);
                unit.builder.emit_u16(Opcode::FieldGet, name);
            }
            Expr::Call { callee, args } => self.compile_call(unit, callee, args, false, node.pos),
            Expr::Try(inner) => {
                let mut target = inner.as_ref();
                while let Expr::Paren(next) = &target.expr {
                    target = next;
                }
                if let Expr::Call { callee, args } = &target.expr {
                    self.compile_call(unit, callee, args, true, node.pos);
                } else {
                    // The parser reported this; keep the stack shape.
                    self.compile_expr(unit, target);
                }
            }
            Expr::Import(name) => match self.resolve_module(name, node.pos) {
                Some(index) => {
                    unit.builder.set_location(node.pos);
                    unit.builder.emit_u16(Opcode::Import, index);
                }
                None => unit.builder.emit(Opcode::LoadNil),
            },
            Expr::Array(elements) => {
                if elements.iter().any(|e| e.splat) {
                    self.compile_spread_array(unit, elements, node.pos);
                } else {
                    for element in elements {
                        self.compile_expr(unit, &element.expr);
                    }
                    match u16::try_from(elements.len()) {
                        Ok(n) => unit.builder.emit_u16(Opcode::BuildArray, n),
                        Err(_) => self.error("array literal too large", node.pos),
                    }
                }
            }
            Expr::Table(entries) => {
                for entry in entries {
                    match &entry.key {
                        TableKey::Name(name, pos) => {
                            let id = self.interner.intern(name);
                            self.emit_const(unit, Constant::Str(id), *pos);
                        }
                        TableKey::Computed(expr) => self.compile_expr(unit, expr),
                    }
                    self.compile_expr(unit, &entry.value);
                }
                match u16::try_from(entries.len()) {
                    Ok(n) => unit.builder.emit_u16(Opcode::BuildTable, n),
                    Err(_) => self.error("table literal too large", node.pos),
                }
            }
            Expr::Func(lit) => {
                let id = self.compile_function(lit, binding_name);
                unit.builder.set_location(node.pos);
                // The function body lives in the constant pool so identical
                // bodies collapse onto one entry like any other constant.
                match unit.builder.add_const(Constant::Func(id)) {
                    Some(index) => unit.builder.emit_u16(Opcode::MakeClosure, index),
                    None => self.error("constant pool overflow", node.pos),
                }
            }
            Expr::Paren(inner) => self.compile_named_expr(unit, inner, binding_name),
            Expr::Bad => unit.builder.emit(Opcode::LoadNil),
        }
    }

    fn emit_int(&mut self, unit: &mut Unit, value: i64, pos: Pos) {
        match i8::try_from(value) {
            Ok(small) => unit.builder.emit_i8(Opcode::LoadSmallInt, small),
            Err(_) => self.emit_const(unit, Constant::Int(value), pos),
        }
    }

    fn emit_const(&mut self, unit: &mut Unit, constant: Constant, pos: Pos) {
        match unit.builder.add_const(constant) {
            Some(index) => unit.builder.emit_u16(Opcode::LoadConst, index),
            None => self.error("constant pool overflow", pos),
        }
    }

    fn intern_operand(&mut self, name: &str, pos: Pos) -> u16 {
        let id = self.interner.intern(name);
        match u16::try_from(id.index()) {
            Ok(operand) => operand,
            Err(_) => {
                self.error("too many distinct names in one program", pos);
                0
            }
        }
    }

    fn compile_interp(&mut self, unit: &mut Unit, parts: &[InterpPart], pos: Pos) {
        for part in parts {
            match part {
                InterpPart::Fragment(text) => {
                    let id = self.interner.intern(text);
                    self.emit_const(unit, Constant::Str(id), pos);
                }
                InterpPart::Expr(expr) => {
                    self.compile_expr(unit, expr);
                    unit.builder.emit(Opcode::ToString);
                }
            }
        }
        match u16::try_from(parts.len()) {
            Ok(n) => unit.builder.emit_u16(Opcode::BuildString, n),
            Err(_) => self.error("string literal has too many fragments", pos),
        }
    }

    fn compile_unary(&mut self, unit: &mut Unit, op: UnaryOp, operand: &ExprNode, pos: Pos) {
        // Literal folding where semantics cannot change.
        match (op, &operand.expr) {
            (UnaryOp::Not, Expr::Bool(b)) => {
                unit.builder.emit(if *b { Opcode::LoadFalse } else { Opcode::LoadTrue });
                return;
            }
            (UnaryOp::Not, Expr::Nil) => {
                unit.builder.emit(Opcode::LoadTrue);
                return;
            }
            (UnaryOp::Neg, Expr::Int(i)) => {
                if let Some(negated) = i.checked_neg() {
                    self.emit_int(unit, negated, pos);
                    return;
                }
            }
            (UnaryOp::Neg, Expr::Float(f)) => {
                self.emit_const(unit, Constant::Float(-f), pos);
                return;
            }
            _ => {}
        }
        self.compile_expr(unit, operand);
        unit.builder.set_location(pos);
        unit.builder.emit(match op {
            UnaryOp::Neg => Opcode::UnaryMinus,
            UnaryOp::Pos => Opcode::UnaryPlus,
            UnaryOp::Not => Opcode::UnaryNot,
            UnaryOp::BitNot => Opcode::UnaryBitNot,
        });
    }

    fn compile_call(&mut self, unit: &mut Unit, callee: &ExprNode, args: &[SpreadElement], try_call: bool, pos: Pos) {
        self.compile_expr(unit, callee);
        if args.iter().any(|a| a.splat) {
            self.compile_spread_array(unit, args, pos);
            unit.builder.set_location(pos);
            unit.builder
                .emit(if try_call { Opcode::TryCallSpread } else { Opcode::CallSpread });
        } else {
            for arg in args {
                self.compile_expr(unit, &arg.expr);
            }
            unit.builder.set_location(pos);
            match u8::try_from(args.len()) {
                Ok(argc) => unit
                    .builder
                    .emit_u8(if try_call { Opcode::TryCall } else { Opcode::Call }, argc),
                Err(_) => self.error("too many arguments", pos),
            }
        }
    }

    /// Builds an argument array for calls or literals containing `...`.
    fn compile_spread_array(&mut self, unit: &mut Unit, elements: &[SpreadElement], _pos: Pos) {
        unit.builder.emit_u16(Opcode::BuildArray, 0);
        for element in elements {
            self.compile_expr(unit, &element.expr);
            unit.builder.emit(if element.splat {
                Opcode::ArrayExtend
            } else {
                Opcode::ArrayPush
            });
        }
    }

    // === Functions ===

    fn compile_function(&mut self, lit: &FuncLit, binding_name: Option<&str>) -> FunctionId {
        self.symbols.enter_function();
        let mut unit = Unit::new(UnitKind::Function);
        unit.builder.set_location(lit.pos);

        let mut required: u8 = 0;
        let mut optional: u8 = 0;
        for param in &lit.params {
            self.define(&param.name, param.pos);
            if param.optional {
                optional = optional.saturating_add(1);
            } else {
                required = required.saturating_add(1);
            }
        }
        if lit.params.len() > 255 {
            self.error("too many parameters", lit.pos);
        }
        if let Some((name, pos)) = &lit.variadic {
            self.define(name, *pos);
        }
        let signature = Signature {
            required,
            optional,
            variadic: lit.variadic.is_some(),
        };

        match &lit.body {
            FuncBody::Block(stmts) => {
                for stmt in stmts {
                    self.compile_stmt(&mut unit, stmt);
                }
                // Falling off the end returns nil.
                unit.builder.emit(Opcode::LoadNil);
                unit.builder.emit(Opcode::Return);
            }
            FuncBody::Expr(expr) => {
                self.compile_expr(&mut unit, expr);
                unit.builder.emit(Opcode::Return);
            }
        }

        let scope = self.symbols.leave_function();
        unit.builder.promote_cell_slots(&scope.cell_slots);
        let name = self.interner.intern(binding_name.unwrap_or("<anonymous>"));
        let function = Function {
            name,
            signature,
            num_locals: scope.num_locals,
            cell_slots: scope.cell_slots,
            captures: scope.captures,
            code: unit.builder.build(),
        };
        self.add_function(function, lit.pos)
    }

    /// Adds a function to the table, collapsing bodies identical in
    /// instructions, constants, and frame layout onto one id.
    fn add_function(&mut self, function: Function, pos: Pos) -> FunctionId {
        let key = body_hash(&function);
        if let Some(candidates) = self.dedup.get(&key) {
            for &id in candidates {
                if same_body(&self.functions[id.index()], &function) {
                    return id;
                }
            }
        }
        if self.functions.len() >= usize::from(u16::MAX) {
            self.error("too many functions in one program", pos);
            return FunctionId::new(0);
        }
        let id = FunctionId::new(self.functions.len());
        self.functions.push(function);
        self.dedup.entry(key).or_default().push(id);
        id
    }

    // === Modules ===

    fn resolve_module(&mut self, name: &str, pos: Pos) -> Option<u16> {
        if name.is_empty() {
            // The parser reported the malformed path.
            return None;
        }
        if let Some(index) = self.modules.index_of(name) {
            return Some(index);
        }
        if let Some(builtin) = BuiltinModule::lookup(name) {
            return Some(self.modules.insert(name, ModuleDef::Builtin(builtin)));
        }
        if self.import_stack.iter().any(|n| n == name) {
            self.error(format!("import cycle detected through module '{name}'"), pos);
            return None;
        }
        let Some(dir) = self.import_dir.clone() else {
            self.error(format!("unknown module '{name}'"), pos);
            return None;
        };
        let path = dir.join(format!("{name}.toy"));
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(_) => {
                self.error(format!("unknown module '{name}'"), pos);
                return None;
            }
        };
        let unit = self.compile_module(name, &path.display().to_string(), source);
        Some(self.modules.insert(
            name,
            ModuleDef::Source {
                name: name.to_owned(),
                unit,
            },
        ))
    }

    fn compile_module(&mut self, name: &str, file_name: &str, source: String) -> FunctionId {
        self.import_stack.push(name.to_owned());
        let file = self.file_set.add_file(file_name, source);
        let (tokens, lex_errors) = Lexer::new(self.file_set, file).tokenize();
        self.errors.extend(lex_errors);
        let (stmts, parse_errors) = parser::parse(tokens);
        self.errors.extend(parse_errors);

        // A module's top level is a parameterless unit with its own
        // locals, compiled against an isolated scope view: only builtins
        // are visible from the importer's side.
        let detached = self.symbols.detach_scopes();
        self.symbols.enter_function();
        let mut unit = Unit::new(UnitKind::Module);
        for stmt in &stmts {
            self.compile_stmt(&mut unit, stmt);
        }
        unit.builder.emit(Opcode::LoadNil);
        unit.builder.emit(Opcode::Return);
        let scope = self.symbols.leave_function();
        self.symbols.restore_scopes(detached);
        unit.builder.promote_cell_slots(&scope.cell_slots);
        let interned = self.interner.intern(&format!("<module {name}>"));
        let function = Function {
            name: interned,
            signature: Signature::default(),
            num_locals: scope.num_locals,
            cell_slots: scope.cell_slots,
            captures: scope.captures,
            code: unit.builder.build(),
        };
        self.import_stack.pop();
        self.add_function(function, Pos::NONE)
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Rem => Opcode::Rem,
        BinaryOp::BitAnd => Opcode::BitAnd,
        BinaryOp::BitOr => Opcode::BitOr,
        BinaryOp::BitXor => Opcode::BitXor,
        BinaryOp::Shl => Opcode::Shl,
        BinaryOp::Shr => Opcode::Shr,
        BinaryOp::Eq => Opcode::CompareEq,
        BinaryOp::Ne => Opcode::CompareNe,
        BinaryOp::Lt => Opcode::CompareLt,
        BinaryOp::Le => Opcode::CompareLe,
        BinaryOp::Gt => Opcode::CompareGt,
        BinaryOp::Ge => Opcode::CompareGe,
        BinaryOp::In => Opcode::Contains,
    }
}

/// Content hash for function-body deduplication.
fn body_hash(function: &Function) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = ahash::AHasher::default();
    function.code.bytecode().hash(&mut hasher);
    function.code.consts().constants().hash(&mut hasher);
    function.signature.hash(&mut hasher);
    function.num_locals.hash(&mut hasher);
    function.cell_slots.hash(&mut hasher);
    for capture in &function.captures {
        core::mem::discriminant(capture).hash(&mut hasher);
        match capture {
            crate::symbol::Capture::Local(i) | crate::symbol::Capture::Free(i) => i.hash(&mut hasher),
        }
    }
    hasher.finish()
}

/// Body identity for deduplication: everything except the display name.
fn same_body(a: &Function, b: &Function) -> bool {
    a.signature == b.signature
        && a.num_locals == b.num_locals
        && a.cell_slots == b.cell_slots
        && a.captures == b.captures
        && a.code == b.code
}
