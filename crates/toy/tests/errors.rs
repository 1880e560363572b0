//! Compile-error and runtime-error behavior.

use toy::{CollectStringPrint, ErrorKind, Exception, InterruptHandle, NoLimitTracker, Object, Script};

fn compile_err(source: &str) -> Vec<String> {
    let errors = Script::new(source, "test.toy")
        .compile()
        .expect_err("expected compile errors");
    errors.errors.into_iter().map(|e| e.message).collect()
}

fn run_err(source: &str) -> Exception {
    Script::new(source, "test.toy")
        .compile()
        .unwrap_or_else(|errors| panic!("compile failed:\n{errors}"))
        .run_with(NoLimitTracker, &mut CollectStringPrint::new(), InterruptHandle::new())
        .expect_err("expected a runtime error")
}

// === Compile errors ===

#[test]
fn undefined_identifier() {
    let messages = compile_err("export missing_name");
    assert!(messages.iter().any(|m| m.contains("undefined identifier 'missing_name'")));
}

#[test]
fn duplicate_declaration_in_one_scope() {
    let messages = compile_err("x := 1\nx := 2");
    assert!(messages.iter().any(|m| m.contains("already declared")));
}

#[test]
fn shadowing_in_inner_scope_is_fine() {
    assert!(Script::new("x := 1\nif true { x := 2\nfmt.println(x) }", "t.toy").compile().is_ok());
}

#[test]
fn break_and_continue_outside_loops() {
    let messages = compile_err("break");
    assert!(messages.iter().any(|m| m.contains("break outside")));
    let messages = compile_err("continue");
    assert!(messages.iter().any(|m| m.contains("continue outside")));
}

#[test]
fn unknown_break_label() {
    let messages = compile_err("for { break nope }");
    assert!(messages.iter().any(|m| m.contains("label 'nope' not found")));
}

#[test]
fn return_outside_function() {
    let messages = compile_err("return 1");
    assert!(messages.iter().any(|m| m.contains("return outside")));
}

#[test]
fn export_inside_function() {
    let messages = compile_err("f := fn() { export 1 }");
    assert!(messages.iter().any(|m| m.contains("export outside")));
}

#[test]
fn duplicate_export() {
    let messages = compile_err("export 1\nexport 2");
    assert!(messages.iter().any(|m| m.contains("already has an export")));
}

#[test]
fn assigning_to_a_builtin() {
    let messages = compile_err("len = 3");
    assert!(messages.iter().any(|m| m.contains("cannot assign to a builtin")));
}

#[test]
fn unknown_module() {
    let messages = compile_err(r#"export import("nope")"#);
    assert!(messages.iter().any(|m| m.contains("unknown module 'nope'")));
}

#[test]
fn multiple_errors_reported_in_one_pass() {
    let messages = compile_err("export a + b");
    assert_eq!(
        messages
            .iter()
            .filter(|m| m.contains("undefined identifier"))
            .count(),
        2
    );
}

// === Runtime errors ===

#[test]
fn division_by_zero() {
    let err = run_err("export 1 / 0");
    assert_eq!(err.kind(), ErrorKind::DivisionByZero);
    assert!(err.position.is_some());
}

#[test]
fn index_out_of_range() {
    let err = run_err("x := [1]\nexport x[5]");
    assert_eq!(err.kind(), ErrorKind::IndexError);
}

#[test]
fn slice_bounds() {
    let err = run_err("export [1, 2][0:9]");
    assert_eq!(err.kind(), ErrorKind::SliceError);
}

#[test]
fn type_mismatch_in_operator() {
    let err = run_err("export 1 + nil");
    assert_eq!(err.kind(), ErrorKind::TypeError);
    assert!(err.error.message.contains("int"));
    assert!(err.error.message.contains("nil"));
}

#[test]
fn calling_a_non_callable() {
    let err = run_err("x := 3\nexport x()");
    assert_eq!(err.kind(), ErrorKind::NotCallable);
}

#[test]
fn wrong_arity() {
    let err = run_err("f := fn(a, b) a + b\nexport f(1)");
    assert_eq!(err.kind(), ErrorKind::ArityError);
    assert!(err.error.message.contains('f'));
}

#[test]
fn unhashable_table_key() {
    let err = run_err("m := {}\nm[[1]] = 2");
    assert_eq!(err.kind(), ErrorKind::NotHashable);
}

#[test]
fn not_iterable() {
    let err = run_err("for x in 5 { }");
    assert_eq!(err.kind(), ErrorKind::NotIterable);
}

#[test]
fn invalid_conversion_vs_absent_conversion() {
    let err = run_err(r#"export int("abc")"#);
    assert_eq!(err.kind(), ErrorKind::ConversionError);
    let err = run_err("export int([])");
    assert_eq!(err.kind(), ErrorKind::TypeError);
}

#[test]
fn stack_overflow_is_catchable() {
    let source = r"
f := fn() f()
r, e := try f()
export e.kind
";
    let compiled = Script::new(source, "t.toy").compile().unwrap();
    let result = compiled
        .run_with(NoLimitTracker, &mut CollectStringPrint::new(), InterruptHandle::new())
        .unwrap();
    assert_eq!(result, Object::String("stack-overflow".to_owned()));
}

#[test]
fn unhandled_panic_reports_a_backtrace() {
    let source = r#"
inner := fn() { fail("deep") }
outer := fn() { inner() }
outer()
"#;
    let err = run_err(source);
    assert_eq!(err.kind(), ErrorKind::UserError);
    assert_eq!(err.error.message, "deep");
    let names: Vec<&str> = err.backtrace.iter().map(|f| f.function.as_str()).collect();
    assert_eq!(names, vec!["inner", "outer", "<module>"]);
    assert!(err.backtrace[0].position.is_some());
}

#[test]
fn formatter_reports_instead_of_panicking() {
    let err = run_err(r#"export format("%d", "nope")"#);
    assert_eq!(err.kind(), ErrorKind::TypeError);
    assert!(err.error.message.contains("%d"));
}

#[test]
fn module_runtime_errors_propagate_to_the_importer() {
    let dir = std::env::temp_dir().join(format!("toy-module-err-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("bad.toy"), "export 1 / 0\n").unwrap();
    let compiled = Script::new(r#"export import("bad")"#, "main.toy")
        .with_import_dir(&dir)
        .compile()
        .unwrap();
    let err = compiled
        .run_with(NoLimitTracker, &mut CollectStringPrint::new(), InterruptHandle::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DivisionByZero);
    std::fs::remove_dir_all(&dir).ok();
}
