//! Interactive session driver.
//!
//! A session keeps the symbol table, interner, compiled functions, heap,
//! globals, and module cache alive across evaluations, so definitions
//! persist line to line. Input is buffered until every bracket and string
//! is balanced; only then does the buffer compile and run.
//!
//! Results echo through a hidden print hook: every top-level expression
//! statement, declaration, and assignment gets a synthetic
//! `__replPrint__(...)` call spliced in after it.

use std::{fmt, path::PathBuf};

use crate::{
    ast::{Expr, ExprNode, SpreadElement, Stmt, StmtNode},
    builtins::{self, Builtin},
    bytecode::{Compiler, Program, Vm},
    error::{CompileErrors, Exception, StackFrame},
    function::Function,
    heap::Heap,
    intern::InternerBuilder,
    io::PrintWriter,
    lexer::Lexer,
    modules::ModuleTable,
    parser,
    resource::{DEFAULT_MAX_FRAMES, DEFAULT_MAX_STACK, InterruptHandle, NoLimitTracker},
    source::FileSet,
    symbol::SymbolTable,
    value::Value,
};

/// A REPL evaluation failure.
#[derive(Debug)]
pub enum ReplError {
    Compile(CompileErrors),
    Runtime(Box<Exception>),
}

impl fmt::Display for ReplError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(errors) => write!(f, "{errors}"),
            Self::Runtime(exception) => write!(f, "{exception}"),
        }
    }
}

impl std::error::Error for ReplError {}

/// Outcome of feeding one line to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplProgress {
    /// The buffer is not yet balanced; feed more lines.
    NeedMore,
    /// The buffer compiled and ran.
    Evaluated,
}

/// A persistent interactive session.
pub struct ReplSession {
    file_set: FileSet,
    symbols: SymbolTable,
    interner: InternerBuilder,
    functions: Vec<Function>,
    modules: ModuleTable,
    universe: Vec<Builtin>,
    heap: Heap<NoLimitTracker>,
    globals: Vec<Value>,
    module_cache: Vec<Option<Value>>,
    buffer: String,
    chunk: usize,
    import_dir: Option<PathBuf>,
}

impl Default for ReplSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplSession {
    pub fn new() -> Self {
        let mut symbols = SymbolTable::new();
        let universe_entries = builtins::universe();
        for (index, (name, _)) in universe_entries.iter().enumerate() {
            symbols.define_builtin(u16::try_from(index).expect("universe fits u16"), name);
        }
        Self {
            file_set: FileSet::new(),
            symbols,
            interner: InternerBuilder::new(),
            functions: Vec::new(),
            modules: ModuleTable::new(),
            universe: universe_entries.into_iter().map(|(_, builtin)| builtin).collect(),
            heap: Heap::new(NoLimitTracker),
            globals: Vec::new(),
            module_cache: Vec::new(),
            buffer: String::new(),
            chunk: 0,
            import_dir: None,
        }
    }

    /// Sets the import directory for `import("name")` source modules.
    #[must_use]
    pub fn with_import_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.import_dir = Some(dir.into());
        self
    }

    /// True when buffered input is waiting for continuation lines.
    #[must_use]
    pub fn needs_more(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Feeds one input line. When the buffer balances, it evaluates and
    /// the buffer resets (also on error, so a bad line never wedges the
    /// session).
    pub fn push_line(&mut self, line: &str, print: &mut impl PrintWriter) -> Result<ReplProgress, ReplError> {
        if !self.buffer.is_empty() {
            self.buffer.push('\n');
        }
        self.buffer.push_str(line);
        if !is_complete(&self.buffer) {
            return Ok(ReplProgress::NeedMore);
        }
        let source = std::mem::take(&mut self.buffer);
        self.eval(&source, print).map(|()| ReplProgress::Evaluated)
    }

    /// Compiles and runs one complete buffer against the session state.
    pub fn eval(&mut self, source: &str, print: &mut impl PrintWriter) -> Result<(), ReplError> {
        let name = format!("<repl-{}>", self.chunk);
        self.chunk += 1;
        let file = self.file_set.add_file(&name, source.to_owned());

        let (tokens, lex_errors) = Lexer::new(&self.file_set, file).tokenize();
        let (mut stmts, parse_errors) = parser::parse(tokens);
        let mut diagnostics = lex_errors;
        diagnostics.extend(parse_errors);
        if !diagnostics.is_empty() {
            return Err(ReplError::Compile(crate::run::resolve_diagnostics(
                diagnostics,
                &self.file_set,
            )));
        }

        splice_auto_print(&mut stmts);

        let compiler = Compiler::new(
            &mut self.symbols,
            &mut self.interner,
            &mut self.functions,
            &mut self.modules,
            &mut self.file_set,
            self.import_dir.clone(),
        );
        let main = compiler.compile_main(&stmts).map_err(|diagnostics| {
            ReplError::Compile(crate::run::resolve_diagnostics(diagnostics, &self.file_set))
        })?;

        let program = Program {
            main,
            functions: self.functions.clone(),
            modules: std::mem::take(&mut self.modules),
            interns: self.interner.clone().build(),
            universe: self.universe.clone(),
            num_globals: self.symbols.num_globals(),
        };
        let vm = Vm::new(
            &program,
            &mut self.heap,
            &mut self.globals,
            &mut self.module_cache,
            print,
            InterruptHandle::new(),
            DEFAULT_MAX_FRAMES,
            DEFAULT_MAX_STACK,
        );
        let result = vm.run(main);
        let outcome = match result {
            Ok(value) => {
                value.drop_with_heap(&mut self.heap);
                Ok(())
            }
            Err(outcome) => Err(ReplError::Runtime(Box::new(Exception {
                error: outcome.error,
                position: self.file_set.position(outcome.pos),
                backtrace: outcome
                    .trace
                    .into_iter()
                    .map(|frame| StackFrame {
                        function: program.interns.get(frame.function).to_owned(),
                        position: self.file_set.position(frame.pos),
                    })
                    .collect(),
            }))),
        };
        let Program { modules, .. } = program;
        self.modules = modules;
        outcome
    }
}

/// Wraps top-level expressions in the echo hook and appends echo calls
/// after declarations and assignments.
fn splice_auto_print(stmts: &mut Vec<StmtNode>) {
    fn echo_call(arg: ExprNode) -> StmtNode {
        let pos = arg.pos;
        StmtNode::new(
            Stmt::Expr(ExprNode::new(
                Expr::Call {
                    callee: Box::new(ExprNode::new(Expr::Ident("__replPrint__".to_owned()), pos)),
                    args: vec![SpreadElement { expr: arg, splat: false }],
                },
                pos,
            )),
            pos,
        )
    }

    let mut result = Vec::with_capacity(stmts.len());
    for stmt in stmts.drain(..) {
        match stmt.stmt {
            Stmt::Expr(expr) => result.push(echo_call(expr)),
            Stmt::Declare { ref names, .. } => {
                let names: Vec<_> = names.clone();
                result.push(stmt);
                for (name, pos) in names {
                    result.push(echo_call(ExprNode::new(Expr::Ident(name), pos)));
                }
            }
            Stmt::Assign { ref targets, op: _, .. } => {
                let idents: Vec<_> = targets
                    .iter()
                    .filter_map(|t| match &t.expr {
                        Expr::Ident(name) => Some((name.clone(), t.pos)),
                        _ => None,
                    })
                    .collect();
                result.push(stmt);
                for (name, pos) in idents {
                    result.push(echo_call(ExprNode::new(Expr::Ident(name), pos)));
                }
            }
            _ => result.push(stmt),
        }
    }
    *stmts = result;
}

/// A buffer is complete when parentheses, brackets, braces, and strings
/// all balance.
fn is_complete(source: &str) -> bool {
    #[derive(PartialEq)]
    enum Open {
        Paren,
        Bracket,
        Brace,
        /// Inside a double-quoted string body.
        Str,
        /// Inside a `{}` interpolation of a string.
        Interp,
    }

    let mut stack: Vec<Open> = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(ch) = chars.next() {
        if matches!(stack.last(), Some(Open::Str)) {
            match ch {
                '\\' => {
                    chars.next();
                }
                '"' => {
                    stack.pop();
                }
                '{' => stack.push(Open::Interp),
                _ => {}
            }
            continue;
        }
        match ch {
            '(' => stack.push(Open::Paren),
            '[' => stack.push(Open::Bracket),
            '{' => stack.push(Open::Brace),
            ')' | ']' => {
                // Mismatches count as complete: the parser reports them.
                if stack.pop().is_none() {
                    return true;
                }
            }
            '}' => match stack.pop() {
                None => return true,
                Some(Open::Interp) => {
                    // Back inside the string body.
                }
                Some(_) => {}
            },
            '"' => stack.push(Open::Str),
            '\'' => loop {
                match chars.next() {
                    None => return false,
                    Some('\\') => {
                        chars.next();
                    }
                    Some('\'') => break,
                    Some('\n') => break,
                    Some(_) => {}
                }
            },
            '`' => loop {
                match chars.next() {
                    None => return false,
                    Some('`') => break,
                    Some(_) => {}
                }
            },
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut star = false;
                let mut closed = false;
                for next in chars.by_ref() {
                    if star && next == '/' {
                        closed = true;
                        break;
                    }
                    star = next == '*';
                }
                if !closed {
                    return false;
                }
            }
            _ => {}
        }
    }

    // An interpolation frame implies its string frame below it.
    while matches!(stack.last(), Some(Open::Interp)) {
        stack.pop();
        if matches!(stack.last(), Some(Open::Str)) {
            // Still inside the string: incomplete.
            return false;
        }
    }
    stack.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::CollectStringPrint;

    #[test]
    fn balance_detection() {
        assert!(is_complete("x := 1"));
        assert!(!is_complete("f := fn(a) {"));
        assert!(!is_complete("x := [1, 2,"));
        assert!(!is_complete("s := \"abc"));
        assert!(is_complete("s := \"a{1 + 2}b\""));
        assert!(is_complete("m := {a: 1}"));
        assert!(!is_complete("/* open"));
        assert!(is_complete("x := 1 // trailing"));
    }

    #[test]
    fn globals_persist_across_evaluations() {
        let mut session = ReplSession::new();
        let mut out = CollectStringPrint::new();
        session.eval("x := 41", &mut out).unwrap();
        session.eval("x + 1", &mut out).unwrap();
        assert!(out.output().contains("42"));
    }

    #[test]
    fn expressions_echo_their_repr() {
        let mut session = ReplSession::new();
        let mut out = CollectStringPrint::new();
        session.eval("[1, 2, 3]", &mut out).unwrap();
        assert_eq!(out.output(), "[1, 2, 3]\n");
    }

    #[test]
    fn declarations_echo_the_bound_value() {
        let mut session = ReplSession::new();
        let mut out = CollectStringPrint::new();
        session.eval("x := 7", &mut out).unwrap();
        assert_eq!(out.output(), "7\n");
    }

    #[test]
    fn multiline_input_buffers_until_balanced() {
        let mut session = ReplSession::new();
        let mut out = CollectStringPrint::new();
        assert_eq!(
            session.push_line("add := fn(a, b) {", &mut out).unwrap(),
            ReplProgress::NeedMore
        );
        assert_eq!(
            session.push_line("  return a + b", &mut out).unwrap(),
            ReplProgress::NeedMore
        );
        assert_eq!(session.push_line("}", &mut out).unwrap(), ReplProgress::Evaluated);
        out = CollectStringPrint::new();
        session.eval("add(20, 22)", &mut out).unwrap();
        assert_eq!(out.output(), "42\n");
    }

    #[test]
    fn errors_do_not_wedge_the_session() {
        let mut session = ReplSession::new();
        let mut out = CollectStringPrint::new();
        assert!(session.eval("1 / 0", &mut out).is_err());
        session.eval("2 + 2", &mut out).unwrap();
        assert!(out.output().contains('4'));
    }
}
