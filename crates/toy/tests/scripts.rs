//! End-to-end script execution tests.
//!
//! Each test compiles a source snippet, runs it with a collecting print
//! writer, and checks the exported value and/or the printed output.

use pretty_assertions::assert_eq;
use toy::{CollectStringPrint, ErrorKind, InterruptHandle, NoLimitTracker, Object, Script};

fn run(source: &str) -> Object {
    run_with_output(source).0
}

fn run_with_output(source: &str) -> (Object, String) {
    let compiled = Script::new(source, "test.toy")
        .compile()
        .unwrap_or_else(|errors| panic!("compile failed:\n{errors}"));
    let mut print = CollectStringPrint::new();
    let result = compiled
        .run_with(NoLimitTracker, &mut print, InterruptHandle::new())
        .unwrap_or_else(|exception| panic!("run failed:\n{exception}"));
    (result, print.into_output())
}

// === The language reference's end-to-end scenarios ===

#[test]
fn println_prints_space_separated() {
    let (result, output) = run_with_output(r#"export fmt.println("hello", "world")"#);
    assert_eq!(output, "hello world\n");
    assert_eq!(result, Object::Nil);
}

#[test]
fn array_index_assignment() {
    let result = run("x := [1, 2, 3]\nx[1] = 20\nexport x");
    assert_eq!(
        result,
        Object::Array(vec![Object::Int(1), Object::Int(20), Object::Int(3)])
    );
}

#[test]
fn optional_parameters_default_to_nil() {
    let source = r"
add := fn(a, b?) { return a + (b == nil ? 0 : b) }
export [add(3), add(3, 4)]
";
    assert_eq!(run(source), Object::Array(vec![Object::Int(3), Object::Int(7)]));
}

#[test]
fn try_catches_fail_into_a_tuple() {
    let result = run(r#"export try (fn() { fail("boom") })()"#);
    let Object::Tuple(parts) = result else {
        panic!("try yields a tuple, got {result:?}");
    };
    assert_eq!(parts[0], Object::Nil);
    let Object::Error(error) = &parts[1] else {
        panic!("second slot is the error, got {:?}", parts[1]);
    };
    assert_eq!(error.message, "boom");
}

#[test]
fn recursive_factorial() {
    let source = r"
f := fn(n) { if n == 0 { return 1 }; return n * f(n-1) }
export f(5)
";
    assert_eq!(run(source), Object::Int(120));
}

#[test]
fn for_in_over_table_sums_values() {
    let source = r"
m := {a: 1, b: 2}
sum := 0
for k, v in m { sum = sum + v }
export sum
";
    assert_eq!(run(source), Object::Int(3));
}

// === Values and operators ===

#[test]
fn string_interpolation() {
    assert_eq!(
        run(r#"name := "toy"
n := 2
export "hi {name}, {n + 1}!""#),
        Object::String("hi toy, 3!".to_owned())
    );
}

#[test]
fn short_circuit_yields_last_evaluated_operand() {
    assert_eq!(run(r#"export nil || "fallback""#), Object::String("fallback".to_owned()));
    assert_eq!(run("export 0 && 1"), Object::Int(0));
    assert_eq!(run(r#"export 1 && "kept""#), Object::String("kept".to_owned()));
}

#[test]
fn slices() {
    assert_eq!(
        run("export [1, 2, 3, 4][1:3]"),
        Object::Array(vec![Object::Int(2), Object::Int(3)])
    );
    assert_eq!(run(r#"export "hello"[1:3]"#), Object::String("el".to_owned()));
    assert_eq!(
        run("export [1, 2, 3][:]"),
        Object::Array(vec![Object::Int(1), Object::Int(2), Object::Int(3)])
    );
}

#[test]
fn compound_assignment_through_index() {
    assert_eq!(run("x := [10]\nx[0] += 5\nexport x[0]"), Object::Int(15));
}

#[test]
fn multi_assignment_swaps() {
    assert_eq!(
        run("a, b := 1, 2\na, b = b, a\nexport [a, b]"),
        Object::Array(vec![Object::Int(2), Object::Int(1)])
    );
}

#[test]
fn tuple_destructuring_from_multi_return() {
    let source = r"
pair := fn() { return 1, 2 }
a, b := pair()
export a + b
";
    assert_eq!(run(source), Object::Int(3));
}

#[test]
fn table_keeps_insertion_order() {
    let source = r#"
m := {}
m["b"] = 1
m["a"] = 2
export keys(m)
"#;
    assert_eq!(
        run(source),
        Object::Array(vec![Object::String("b".to_owned()), Object::String("a".to_owned())])
    );
}

#[test]
fn missing_table_key_reads_nil() {
    assert_eq!(run("m := {a: 1}\nexport m.missing"), Object::Nil);
}

#[test]
fn numeric_cross_type_equality_and_keys() {
    assert_eq!(run("export 1 == 1.0"), Object::Bool(true));
    // A float key that equals an int key hits the same table slot.
    assert_eq!(run("m := {}\nm[1] = \"a\"\nm[1.0] = \"b\"\nexport [len(m), m[1]]"),
        Object::Array(vec![Object::Int(1), Object::String("b".to_owned())]));
}

// === Functions, closures, splat ===

#[test]
fn closures_capture_by_reference() {
    let source = r"
counter := fn() {
    n := 0
    return fn() { n += 1; return n }
}
c := counter()
c()
c()
export c()
";
    assert_eq!(run(source), Object::Int(3));
}

#[test]
fn two_closures_share_one_cell() {
    let source = r"
make := fn() {
    n := 0
    inc := fn() { n += 1 }
    get := fn() n
    return inc, get
}
i, g := make()
i()
i()
export g()
";
    assert_eq!(run(source), Object::Int(2));
}

#[test]
fn splat_expands_arguments_and_arrays() {
    let source = r"
f := fn(a, b, c) a + b + c
args := [1, 2, 3]
export [f(...args), len([0, ...args])]
";
    assert_eq!(run(source), Object::Array(vec![Object::Int(6), Object::Int(4)]));
}

#[test]
fn variadic_collects_a_tuple() {
    let source = r"
f := fn(a, ...rest) [a, len(rest)]
export [f(1), f(1, 2, 3)]
";
    assert_eq!(
        run(source),
        Object::Array(vec![
            Object::Array(vec![Object::Int(1), Object::Int(0)]),
            Object::Array(vec![Object::Int(1), Object::Int(2)]),
        ])
    );
}

#[test]
fn expression_bodied_functions() {
    assert_eq!(run("double := fn(x) x * 2\nexport double(21)"), Object::Int(42));
}

#[test]
fn bound_methods_prepend_the_receiver() {
    let source = r"
a := []
append := bind(push, a)
append(1)
append(2)
export a
";
    assert_eq!(run(source), Object::Array(vec![Object::Int(1), Object::Int(2)]));
}

// === Control flow ===

#[test]
fn c_style_for_loop() {
    let source = r"
s := 0
for i := 0; i < 5; i += 1 { s += i }
export s
";
    assert_eq!(run(source), Object::Int(10));
}

#[test]
fn while_style_and_infinite_loops() {
    let source = r"
n := 0
for n < 3 { n += 1 }
for { break }
export n
";
    assert_eq!(run(source), Object::Int(3));
}

#[test]
fn labeled_break_and_continue() {
    let source = r"
total := 0
outer: for i in range(3) {
    for j in range(3) {
        if j == 2 { continue outer }
        if i == 2 { break outer }
        total += 1
    }
}
export total
";
    assert_eq!(run(source), Object::Int(4));
}

#[test]
fn range_iteration() {
    assert_eq!(run("s := 0\nfor i in range(5) { s += i }\nexport s"), Object::Int(10));
    assert_eq!(run("s := 0\nfor i in range(2, 10, 3) { s += i }\nexport s"), Object::Int(15));
}

#[test]
fn string_iteration_yields_chars() {
    let source = r#"
out := []
for c in "héj" { push(out, string(c)) }
export out
"#;
    assert_eq!(
        run(source),
        Object::Array(vec![
            Object::String("h".to_owned()),
            Object::String("é".to_owned()),
            Object::String("j".to_owned()),
        ])
    );
}

#[test]
fn if_with_initializer() {
    let source = r#"
classify := fn(x) {
    if y := x * 2; y > 10 { return "big" } else { return "small" }
}
export [classify(3), classify(6)]
"#;
    assert_eq!(
        run(source),
        Object::Array(vec![
            Object::String("small".to_owned()),
            Object::String("big".to_owned()),
        ])
    );
}

// === Defer, try, recover ===

#[test]
fn deferred_calls_run_lifo_on_return() {
    let source = r"
order := []
f := fn() {
    defer push(order, 1)
    defer push(order, 2)
    push(order, 0)
}
f()
export order
";
    assert_eq!(
        run(source),
        Object::Array(vec![Object::Int(0), Object::Int(2), Object::Int(1)])
    );
}

#[test]
fn deferred_calls_run_during_unwinding() {
    let source = r#"
order := []
f := fn() {
    defer push(order, "deferred")
    fail("down")
}
r, e := try f()
export [order, e.message]
"#;
    assert_eq!(
        run(source),
        Object::Array(vec![
            Object::Array(vec![Object::String("deferred".to_owned())]),
            Object::String("down".to_owned()),
        ])
    );
}

#[test]
fn defer_captures_arguments_eagerly() {
    let source = r"
out := []
f := fn() {
    x := 1
    defer push(out, x)
    x = 99
}
f()
export out
";
    assert_eq!(run(source), Object::Array(vec![Object::Int(1)]));
}

#[test]
fn recover_clears_the_panic() {
    let source = r#"
r := nil
handle := fn() { r = recover() }
f := fn() {
    defer handle()
    fail("boom")
}
result := f()
export [result == nil, r.message, r.kind]
"#;
    assert_eq!(
        run(source),
        Object::Array(vec![
            Object::Bool(true),
            Object::String("boom".to_owned()),
            Object::String("user-error".to_owned()),
        ])
    );
}

#[test]
fn try_wraps_normal_results() {
    let source = r"
f := fn() 42
export try f()
";
    assert_eq!(run(source), Object::Tuple(vec![Object::Int(42), Object::Nil]));
}

#[test]
fn try_catches_runtime_errors_from_inside_the_call() {
    let source = r"
f := fn(xs) xs[10]
r, e := try f([1])
export [r == nil, e.kind]
";
    assert_eq!(
        run(source),
        Object::Array(vec![Object::Bool(true), Object::String("index-error".to_owned())])
    );
}

#[test]
fn error_cause_chains() {
    let source = r#"
inner := error("disk offline")
outer := error(inner, "loading %s", "config")
export [outer.message, outer.cause.message]
"#;
    assert_eq!(
        run(source),
        Object::Array(vec![
            Object::String("loading config".to_owned()),
            Object::String("disk offline".to_owned()),
        ])
    );
}

// === Iteration safety and freezing ===

#[test]
fn mutation_while_iterating_fails_and_leaves_container_unchanged() {
    let source = r"
x := [1, 2]
r, e := try (fn() { for v in x { push(x, 9) } })()
export [len(x), e.kind]
";
    assert_eq!(
        run(source),
        Object::Array(vec![
            Object::Int(2),
            Object::String("mutated-while-iterating".to_owned())
        ])
    );
}

#[test]
fn mutation_allowed_after_iteration_closes() {
    let source = r"
x := [1, 2]
for v in x { }
push(x, 3)
export len(x)
";
    assert_eq!(run(source), Object::Int(3));
}

#[test]
fn frozen_containers_reject_every_mutation() {
    let source = r#"
a := freeze([1])
m := freeze({k: 1})
e1 := (try (fn() { a[0] = 2 })())[1]
e2 := (try (fn() { m["k"] = 2 })())[1]
e3 := (try (fn() { push(a, 3) })())[1]
export [e1.kind, e2.kind, e3.kind, is_frozen(a)]
"#;
    assert_eq!(
        run(source),
        Object::Array(vec![
            Object::String("frozen".to_owned()),
            Object::String("frozen".to_owned()),
            Object::String("frozen".to_owned()),
            Object::Bool(true),
        ])
    );
}

#[test]
fn clone_detaches_a_frozen_array() {
    let source = r"
a := freeze([1, 2])
b := clone(a)
push(b, 3)
export [len(a), len(b)]
";
    assert_eq!(run(source), Object::Array(vec![Object::Int(2), Object::Int(3)]));
}

// === Builtins and modules ===

#[test]
fn builtin_type_values_convert() {
    assert_eq!(run(r#"export int("42")"#), Object::Int(42));
    assert_eq!(run("export string(3.5)"), Object::String("3.5".to_owned()));
    assert_eq!(run("export char(65)"), Object::Char('A'));
    assert_eq!(run("export bool([])"), Object::Bool(false));
    assert_eq!(run(r#"export int(type(1) == int)"#), Object::Int(1));
}

#[test]
fn format_builtin() {
    assert_eq!(
        run(r#"export format("%d-%s-%.1f", 7, "x", 2.25)"#),
        Object::String("7-x-2.2".to_owned())
    );
}

#[test]
fn fmt_printf_and_sprintf() {
    let (result, output) = run_with_output(r#"export fmt.sprintf("[%04v]", 9)"#);
    assert_eq!(output, "");
    assert_eq!(result, Object::String("[   9]".to_owned()));
    let (_, output) = run_with_output(r#"fmt.printf("%d%%", 99)"#);
    assert_eq!(output, "99%");
}

#[test]
fn math_module() {
    assert_eq!(run("export math.abs(-3)"), Object::Int(3));
    assert_eq!(run("export math.sqrt(9.0)"), Object::Float(3.0));
    assert_eq!(run("export math.min(3, 1, 2)"), Object::Int(1));
    assert_eq!(run("export math.max([4, 9, 7])"), Object::Int(9));
    assert_eq!(run("m := import(\"math\")\nexport m.floor(2.9)"), Object::Float(2.0));
}

#[test]
fn min_max_len() {
    assert_eq!(run("export min(3, 1, 2)"), Object::Int(1));
    assert_eq!(run("export max([4, 9, 7])"), Object::Int(9));
    assert_eq!(run(r#"export len("héllo")"#), Object::Int(5));
}

#[test]
fn membership_operator() {
    assert_eq!(run("export 2 in [1, 2, 3]"), Object::Bool(true));
    assert_eq!(run(r#"export "ell" in "hello""#), Object::Bool(true));
    assert_eq!(run(r#"export "x" in {a: 1}"#), Object::Bool(false));
    assert_eq!(run(r#"export "a" in {a: 1}"#), Object::Bool(true));
}

#[test]
fn bytes_values() {
    assert_eq!(run(r#"export len(bytes("abc"))"#), Object::Int(3));
    assert_eq!(run(r#"b := bytes("abc")
export b[0]"#), Object::Int(97));
    let source = r#"
b := bytes(3)
b[0] = 255
export b
"#;
    assert_eq!(run(source), Object::Bytes(vec![255, 0, 0]));
}

// === Source modules ===

#[test]
fn source_modules_import_run_once_and_cache() {
    let dir = std::env::temp_dir().join(format!("toy-import-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("doubler.toy"),
        "fmt.println(\"loading\")\nexport { double: fn(x) x * 2 }\n",
    )
    .unwrap();

    let source = r#"
a := import("doubler")
b := import("doubler")
export a.double(21) + b.double(0)
"#;
    let compiled = Script::new(source, "main.toy")
        .with_import_dir(&dir)
        .compile()
        .unwrap_or_else(|errors| panic!("compile failed:\n{errors}"));
    let mut print = CollectStringPrint::new();
    let result = compiled
        .run_with(NoLimitTracker, &mut print, InterruptHandle::new())
        .unwrap();
    assert_eq!(result, Object::Int(42));
    // The module body executed exactly once; the second import was cached.
    assert_eq!(print.output(), "loading\n");
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn import_cycles_are_compile_errors() {
    let dir = std::env::temp_dir().join(format!("toy-cycle-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("a.toy"), "export import(\"b\")\n").unwrap();
    std::fs::write(dir.join("b.toy"), "export import(\"a\")\n").unwrap();

    let errors = Script::new("export import(\"a\")", "main.toy")
        .with_import_dir(&dir)
        .compile()
        .unwrap_err();
    assert!(
        errors.errors.iter().any(|e| e.message.contains("cycle")),
        "expected a cycle diagnostic, got: {errors}"
    );
    std::fs::remove_dir_all(&dir).ok();
}

// === Properties ===

#[test]
fn evaluation_is_deterministic() {
    let source = r#"
m := {one: 1, two: 2, three: 3}
out := []
for k, v in m { push(out, "{k}={v}") }
fmt.println(out)
export out
"#;
    let first = run_with_output(source);
    let second = run_with_output(source);
    assert_eq!(first, second);
}

#[test]
fn interrupt_cancels_a_running_loop() {
    let compiled = Script::new("for { }", "spin.toy").compile().unwrap();
    let interrupt = InterruptHandle::new();
    // The flag is observed on the loop back-edge, so a pre-set flag
    // cancels on the first iteration.
    interrupt.interrupt();
    let mut print = CollectStringPrint::new();
    let err = compiled
        .run_with(NoLimitTracker, &mut print, interrupt)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}
