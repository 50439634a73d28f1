//! End-to-end scenarios: source text in, captured stdout + exit classification out.

use lox::{GcConfig, LoxError};

fn run_with(source: &str, config: GcConfig) -> (String, Result<(), LoxError>) {
    let mut out = Vec::new();
    let result = lox::run_source(source, &mut out, config);
    (String::from_utf8(out).expect("VM output must be valid UTF-8"), result)
}

fn run(source: &str) -> String {
    let (out, result) = run_with(source, GcConfig::default());
    result.unwrap_or_else(|e| panic!("expected {source:?} to run cleanly, got: {e}"));
    out
}

#[test]
fn while_loop_counts_up() {
    let out = run("var i = 0; while (i < 3) { echo i; i = i + 1; }");
    assert_eq!(out, "0\n1\n2\n");
}

#[test]
fn closure_shares_mutable_captured_state() {
    let out = run(
        "fun makeCounter(start) { \
             var count = start; \
             fun counter() { count = count + 1; return count; } \
             return counter; \
         } \
         var c = makeCounter(10); \
         echo c(); \
         echo c();",
    );
    assert_eq!(out, "11\n12\n");
}

#[test]
fn super_call_dispatches_to_parent_method() {
    let out = run(
        "class A { method() { println(\"A\"); } } \
         class B : A { method() { super.method(); println(\"B\"); } } \
         B().method();",
    );
    assert_eq!(out, "A\nB\n");
}

#[test]
fn list_index_assignment() {
    let out = run("var x = [1, 2, 3]; x[1] = 42; echo x;");
    assert_eq!(out, "[1, 42, 3]\n");
}

#[test]
fn map_len_delete_and_has() {
    let out = run(
        "var m = {\"a\":1,\"b\":2}; \
         echo len(m); \
         delete(m,\"a\"); \
         echo has(m,\"a\");",
    );
    assert_eq!(out, "2\nfalse\n");
}

#[test]
fn const_reassignment_is_a_compile_error() {
    let (out, result) = run_with("const x = 10; x = 20;", GcConfig::default());
    assert_eq!(out, "");
    match result {
        Err(LoxError::Compile(diagnostics)) => assert!(!diagnostics.is_empty()),
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn closures_book_25_4_1_sees_updated_upvalue_after_outer_returns() {
    let out = run(
        "var globalSet; \
         var globalGet; \
         fun main() { \
             var a = \"initial\"; \
             fun set() { a = \"updated\"; } \
             fun get() { echo a; } \
             globalSet = set; \
             globalGet = get; \
         } \
         main(); \
         globalSet(); \
         globalGet();",
    );
    assert_eq!(out, "updated\n");
}

#[test]
fn switch_case_scopes_do_not_leak_locals() {
    let out = run(
        "var x = 1; \
         switch (x) { \
             case 1: { var local = \"one\"; echo local; } \
             case 2: { var local = \"two\"; echo local; } \
             default: { echo \"other\"; } \
         }",
    );
    assert_eq!(out, "one\n");
}

#[test]
fn switch_falls_to_default_with_no_match() {
    let out = run(
        "var x = 99; \
         switch (x) { \
             case 1: { echo \"one\"; } \
             default: { echo \"other\"; } \
         }",
    );
    assert_eq!(out, "other\n");
}

#[test]
fn division_by_zero_of_two_ints_is_a_runtime_error() {
    let (_out, result) = run_with("echo 1 / 0;", GcConfig::default());
    match result {
        Err(LoxError::Runtime(e)) => assert!(e.message.contains("zero")),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn double_division_by_zero_yields_infinity_not_an_error() {
    let out = run("echo 1.0 / 0.0;");
    assert_eq!(out, "inf\n");
}

#[test]
fn stress_gc_does_not_change_observable_output() {
    let config = GcConfig { stress_gc: true, initial_threshold: 1024 };
    let (out, result) = run_with("var i = 0; while (i < 3) { echo i; i = i + 1; }", config);
    result.expect("stress-gc run should still complete cleanly");
    assert_eq!(out, "0\n1\n2\n");
}

#[test]
fn gc_counters_are_internally_consistent() {
    let out = run(
        "echo sys__mem_get_net_bytes() == sys__mem_get_bytes_allocated() - sys__mem_get_bytes_freed(); \
         echo sys__mem_get_net_bytes() >= 0; \
         echo sys__mem_get_next_gc() >= sys__mem_get_net_bytes();",
    );
    assert_eq!(out, "true\ntrue\ntrue\n");
}

#[test]
fn live_closure_keeps_its_captured_locals_reachable_across_a_stress_collection() {
    let config = GcConfig { stress_gc: true, initial_threshold: 0 };
    let out = run_with(
        "fun makeCounter() { var count = 0; fun counter() { count = count + 1; return count; } return counter; } \
         var c = makeCounter(); \
         echo c(); \
         echo c(); \
         echo c();",
        config,
    )
    .0;
    assert_eq!(out, "1\n2\n3\n");
}
