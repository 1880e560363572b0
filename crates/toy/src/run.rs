//! The embedding interface: build a script from source, compile it once,
//! run it any number of times.
//!
//! Compile-time failures ([`CompileErrors`]) and runtime failures
//! ([`Exception`]) are distinct types: the former batch every lex, parse,
//! and codegen diagnostic with resolved positions; the latter carry the
//! error value, the raising position, and a frame backtrace.

use std::path::PathBuf;

use crate::{
    builtins,
    bytecode::{Compiler, Program, Vm},
    error::{CompileError, CompileErrors, Diagnostic, Exception, StackFrame},
    intern::InternerBuilder,
    io::{PrintWriter, StdPrint},
    lexer::Lexer,
    modules::ModuleTable,
    object::{self, Object},
    parser,
    resource::{DEFAULT_MAX_FRAMES, DEFAULT_MAX_STACK, InterruptHandle, NoLimitTracker, ResourceTracker},
    source::FileSet,
    symbol::SymbolTable,
    value::Value,
};

/// A script: source bytes plus compilation options.
#[derive(Debug, Clone)]
pub struct Script {
    source: String,
    name: String,
    import_dir: Option<PathBuf>,
}

impl Script {
    /// Creates a script from source text and a display name for
    /// diagnostics.
    pub fn new(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            import_dir: None,
        }
    }

    /// Sets the directory searched for `import("name")` source modules
    /// (`<dir>/<name>.toy`).
    #[must_use]
    pub fn with_import_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.import_dir = Some(dir.into());
        self
    }

    /// Compiles the script.
    pub fn compile(self) -> Result<CompiledScript, CompileErrors> {
        let mut file_set = FileSet::new();
        let file = file_set.add_file(&self.name, self.source);

        let (tokens, lex_errors) = Lexer::new(&file_set, file).tokenize();
        let (stmts, parse_errors) = parser::parse(tokens);
        let mut diagnostics = lex_errors;
        diagnostics.extend(parse_errors);
        if !diagnostics.is_empty() {
            // Front-end errors stop the pipeline before codegen.
            return Err(resolve_diagnostics(diagnostics, &file_set));
        }

        let mut symbols = SymbolTable::new();
        let universe = builtins::universe();
        for (index, (name, _)) in universe.iter().enumerate() {
            symbols.define_builtin(u16::try_from(index).expect("universe fits u16"), name);
        }
        let mut interner = InternerBuilder::new();
        let mut functions = Vec::new();
        let mut modules = ModuleTable::new();

        let compiler = Compiler::new(
            &mut symbols,
            &mut interner,
            &mut functions,
            &mut modules,
            &mut file_set,
            self.import_dir,
        );
        match compiler.compile_main(&stmts) {
            Ok(main) => Ok(CompiledScript {
                program: Program {
                    main,
                    functions,
                    modules,
                    interns: interner.build(),
                    universe: universe.into_iter().map(|(_, builtin)| builtin).collect(),
                    num_globals: symbols.num_globals(),
                },
                file_set,
            }),
            Err(diagnostics) => Err(resolve_diagnostics(diagnostics, &file_set)),
        }
    }
}

/// Resolves raw diagnostics against the file set for the host.
pub(crate) fn resolve_diagnostics(diagnostics: Vec<Diagnostic>, file_set: &FileSet) -> CompileErrors {
    CompileErrors {
        errors: diagnostics
            .into_iter()
            .map(|d| CompileError {
                message: d.message,
                position: file_set.position(d.pos),
            })
            .collect(),
    }
}

/// A compiled script, ready to run.
#[derive(Debug)]
pub struct CompiledScript {
    program: Program,
    file_set: FileSet,
}

impl CompiledScript {
    /// Runs with no resource limits, printing to stdout.
    ///
    /// The result is the script's exported value, `Object::Nil` when it
    /// never exports.
    pub fn run(&self) -> Result<Object, Exception> {
        self.run_with(NoLimitTracker, &mut StdPrint::new(), InterruptHandle::new())
    }

    /// Runs with an explicit tracker, print writer, and interrupt handle.
    pub fn run_with<T: ResourceTracker, P: PrintWriter>(
        &self,
        tracker: T,
        print: &mut P,
        interrupt: InterruptHandle,
    ) -> Result<Object, Exception> {
        let mut heap = crate::heap::Heap::new(tracker);
        let mut globals: Vec<Value> = Vec::new();
        let mut module_cache = Vec::new();
        let vm = Vm::new(
            &self.program,
            &mut heap,
            &mut globals,
            &mut module_cache,
            print,
            interrupt,
            DEFAULT_MAX_FRAMES,
            DEFAULT_MAX_STACK,
        );
        match vm.run(self.program.main) {
            Ok(value) => {
                let object = object::object_from_value(&value, &heap, &self.program.interns);
                value.drop_with_heap(&mut heap);
                release_globals(&mut heap, &mut globals, &mut module_cache);
                Ok(object)
            }
            Err(outcome) => {
                release_globals(&mut heap, &mut globals, &mut module_cache);
                Err(self.resolve_outcome(*outcome))
            }
        }
    }

    fn resolve_outcome(&self, outcome: crate::bytecode::RunOutcome) -> Exception {
        Exception {
            error: outcome.error,
            position: self.file_set.position(outcome.pos),
            backtrace: outcome
                .trace
                .into_iter()
                .map(|frame| StackFrame {
                    function: self.program.interns.get(frame.function).to_owned(),
                    position: self.file_set.position(frame.pos),
                })
                .collect(),
        }
    }
}

/// Drops run-scoped values so the heap's counts balance.
fn release_globals<T: ResourceTracker>(
    heap: &mut crate::heap::Heap<T>,
    globals: &mut Vec<Value>,
    module_cache: &mut Vec<Option<Value>>,
) {
    for value in globals.drain(..) {
        value.drop_with_heap(heap);
    }
    for slot in module_cache.drain(..) {
        if let Some(value) = slot {
            value.drop_with_heap(heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::CollectStringPrint;

    fn run_source(source: &str) -> Result<Object, Exception> {
        Script::new(source, "test.toy")
            .compile()
            .expect("compiles cleanly")
            .run_with(NoLimitTracker, &mut CollectStringPrint::new(), InterruptHandle::new())
    }

    #[test]
    fn export_is_the_result() {
        assert_eq!(run_source("export 20 + 22").unwrap(), Object::Int(42));
    }

    #[test]
    fn no_export_yields_nil() {
        assert_eq!(run_source("x := 1").unwrap(), Object::Nil);
    }

    #[test]
    fn compile_errors_are_batched_with_positions() {
        let err = Script::new("x := ]\ny := )", "bad.toy").compile().unwrap_err();
        assert!(err.errors.len() >= 2);
        assert!(err.errors[0].position.is_some());
        assert_eq!(err.errors[0].position.as_ref().unwrap().name, "bad.toy");
    }

    #[test]
    fn runtime_error_carries_position_and_kind() {
        let err = run_source("export 1 / 0").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DivisionByZero);
        assert!(err.position.is_some());
    }
}
