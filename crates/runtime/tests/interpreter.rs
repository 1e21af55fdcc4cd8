//! End-to-end interpreter tests: source in, observable output and result
//! code out.

use quill_runtime::{InterpretError, SharedBuffer, Vm};

fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let buffer = SharedBuffer::new();
    let mut vm = Vm::with_output(Box::new(buffer.clone()));
    let result = vm.interpret(source);
    (result, buffer.contents())
}

fn expect_output(source: &str, expected: &str) {
    let (result, output) = run(source);
    assert_eq!(result, Ok(()), "script failed: {source}");
    assert_eq!(output, expected, "script: {source}");
}

fn expect_runtime_error(source: &str) {
    let (result, _) = run(source);
    assert_eq!(result, Err(InterpretError::Runtime), "script: {source}");
}

#[test]
fn test_arithmetic_precedence() {
    expect_output("let x = 1 + 2 * 3; print(x);", "7\n");
}

#[test]
fn test_closure_shares_upvalue_and_closes_on_return() {
    expect_output(
        "fun mk(){ let a=0; fun inc(){ a+=1; return a; } return inc; } \
         let f=mk(); print(f()); print(f());",
        "1\n2\n",
    );
}

#[test]
fn test_map_literal_and_lookup() {
    expect_output("let m={1:'a','b':2}; print(m[1]); print(m['b']);", "a\n2\n");
}

#[test]
fn test_list_store_and_index() {
    expect_output(
        "let xs=[1,2,3]; xs[1]=9; print(xs[0]); print(xs[1]); print(xs[2]);",
        "1\n9\n3\n",
    );
}

#[test]
fn test_for_loop_with_continue() {
    expect_output(
        "for (let i=0;i<3;i+=1){ if (i==1) continue; print(i); }",
        "0\n2\n",
    );
}

#[test]
fn test_adding_number_and_string_fails() {
    expect_runtime_error("print(1+'x');");
}

#[test]
fn test_two_closures_share_one_upvalue() {
    // Both closures capture the same stack slot, so writes through one are
    // visible through the other — before and after the slot is closed.
    expect_output(
        "fun pair() { \
           let shared = 0; \
           fun bump() { shared += 10; } \
           fun read() { return shared; } \
           bump(); \
           print(read()); \
           return [bump, read]; \
         } \
         let fns = pair(); \
         fns[0](); \
         print(fns[1]());",
        "10\n20\n",
    );
}

#[test]
fn test_string_interning_makes_equal_literals_identical() {
    // Equality on strings is handle identity; it only holds for separately
    // built strings because of interning.
    expect_output("print('ab' == 'ab'); print('ab' == 'a' + 'b');", "true\ntrue\n");
}

#[test]
fn test_string_flavors_agree() {
    expect_output("print('x' == \"x\"); print('x' == `x`);", "true\ntrue\n");
}

#[test]
fn test_escapes_and_raw_strings() {
    expect_output("write('a\\tb\\n');", "a\tb\n");
    expect_output("print(len(`a\\tb`));", "4\n");
}

#[test]
fn test_truthiness() {
    expect_output(
        "if (0) { print('zero'); } else { print('no'); } \
         if ('') { print('empty'); } \
         if (nil) { print('nil'); } else { print('not nil'); }",
        "no\nempty\nnot nil\n",
    );
}

#[test]
fn test_comparisons_and_equality() {
    expect_output(
        "print(1 < 2); print(2 <= 2); print(3 > 4); print(1 == 1.0); print(1 != 2); \
         print(nil == nil); print(nil == false);",
        "true\ntrue\nfalse\ntrue\ntrue\ntrue\nfalse\n",
    );
}

#[test]
fn test_modulo_and_power() {
    expect_output("print(7 % 3); print(2 ** 10); print(2 ** 3 ** 2);", "1\n1024\n512\n");
}

#[test]
fn test_division_is_ieee() {
    expect_output("print(1 / 0 > 0);", "true\n");
    expect_output("print(7 / 2);", "3.5\n");
}

#[test]
fn test_negate_and_not() {
    expect_output("print(-(3)); print(!true); print(!nil); print(!0);", "-3\nfalse\ntrue\nfalse\n");
}

#[test]
fn test_and_or_short_circuit() {
    expect_output(
        "print(false and missing()); print(true or missing()); print(1 and 2); print(nil or 3);",
        "false\ntrue\n2\n3\n",
    );
}

#[test]
fn test_while_with_break() {
    expect_output(
        "let i = 0; while (true) { i += 1; if (i == 3) { break; } } print(i);",
        "3\n",
    );
}

#[test]
fn test_nested_loops_break_inner_only() {
    expect_output(
        "for (let i = 0; i < 2; i += 1) { \
           for (let j = 0; j < 10; j += 1) { \
             if (j == 1) { break; } \
             print(i * 10 + j); \
           } \
         }",
        "0\n10\n",
    );
}

#[test]
fn test_break_discards_loop_locals() {
    expect_output(
        "let total = 0; \
         for (let i = 0; i < 5; i += 1) { \
           let doubled = i * 2; \
           total += doubled; \
           if (i == 2) { break; } \
         } \
         print(total);",
        "6\n",
    );
}

#[test]
fn test_recursion() {
    expect_output(
        "fun fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } print(fib(10));",
        "55\n",
    );
}

#[test]
fn test_functions_are_first_class() {
    expect_output(
        "fun twice(f, x) { return f(f(x)); } fun inc(n) { return n + 1; } print(twice(inc, 5));",
        "7\n",
    );
}

#[test]
fn test_dot_desugars_to_string_subscript() {
    expect_output(
        "let m = {'name': 'quill'}; print(m.name); m.name = 'still quill'; print(m['name']);",
        "quill\nstill quill\n",
    );
}

#[test]
fn test_subscript_assignment_evaluates_to_value() {
    expect_output("let xs = [0]; print(xs[0] = 5);", "5\n");
}

#[test]
fn test_string_indexing() {
    expect_output("let s = 'abc'; print(s[0]); print(s[2]);", "a\nc\n");
    expect_runtime_error("'abc'[3];");
    expect_runtime_error("'abc'[0.5];");
}

#[test]
fn test_list_index_errors() {
    expect_runtime_error("[1, 2][2];");
    expect_runtime_error("[1, 2][-1];");
    expect_runtime_error("[1, 2]['x'];");
    expect_runtime_error("let xs = [1]; xs[1] = 0;");
}

#[test]
fn test_subscript_on_wrong_type() {
    expect_runtime_error("let n = 4; n[0];");
    expect_runtime_error("true[0] = 1;");
}

#[test]
fn test_map_key_kinds() {
    expect_output(
        "let m = {}; m[1] = 'one'; m[true] = 'yes'; m[nil] = 'nothing'; \
         fun f() {} m[f] = 'callable'; \
         print(m[1]); print(m[true]); print(m[nil]); print(m[f]);",
        "one\nyes\nnothing\ncallable\n",
    );
}

#[test]
fn test_unhashable_map_keys_fail() {
    expect_runtime_error("let m = {}; m[[1]] = 1;");
    expect_runtime_error("let m = {}; m[{}] = 1;");
    expect_runtime_error("let m = {[1]: 2};");
}

#[test]
fn test_map_get_of_deleted_key_fails() {
    expect_runtime_error("let m = {'k': 1}; delete(m, 'k'); m['k'];");
}

#[test]
fn test_map_reinsert_after_delete() {
    expect_output(
        "let m = {'k': 1}; delete(m, 'k'); m['k'] = 2; print(m['k']);",
        "2\n",
    );
}

#[test]
fn test_trailing_commas_in_displays() {
    expect_output("print(len([1, 2,])); print(len({1: 2,}));", "2\n1\n");
}

#[test]
fn test_nested_data_structures() {
    expect_output(
        "let grid = [[1, 2], [3, 4]]; print(grid[1][0]); \
         let m = {'xs': [9]}; print(m['xs'][0]);",
        "3\n9\n",
    );
}

#[test]
fn test_wide_constants_execute() {
    // More than 256 constants in the script chunk; the later loads go
    // through the WIDE prefix and must still find the right values.
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("let v{i} = {i};"));
    }
    source.push_str("print(v0); print(v255); print(v299);");
    expect_output(&source, "0\n255\n299\n");
}

#[test]
fn test_scope_shadowing() {
    expect_output(
        "let x = 'outer'; { let x = 'inner'; print(x); } print(x);",
        "inner\nouter\n",
    );
}

#[test]
fn test_block_scoped_locals_disappear() {
    expect_runtime_error("{ let hidden = 1; } hidden;");
}

#[test]
fn test_upvalue_from_two_levels_up() {
    expect_output(
        "fun outer() { \
           let x = 'captured'; \
           fun middle() { \
             fun inner() { return x; } \
             return inner; \
           } \
           return middle(); \
         } \
         print(outer()());",
        "captured\n",
    );
}

#[test]
fn test_loop_variable_capture() {
    // Each iteration's closure sees the same loop variable slot until it
    // closes at scope exit.
    expect_output(
        "let fns = []; \
         for (let i = 0; i < 3; i += 1) { \
           let n = i; \
           fun get() { return n; } \
           append(fns, get); \
         } \
         print(fns[0]()); print(fns[1]()); print(fns[2]());",
        "0\n1\n2\n",
    );
}

#[test]
fn test_gc_survives_heavy_churn() {
    // Allocate far past the first-collection threshold so several cycles
    // run mid-script; everything still reachable must survive.
    expect_output(
        "let keep = []; \
         let s = 'x'; \
         for (let i = 0; i < 20; i += 1) { s = s + s; } \
         for (let i = 0; i < 50; i += 1) { append(keep, [i, {'n': i}]); } \
         let total = 0; \
         for (let i = 0; i < 50; i += 1) { total += keep[i][1]['n']; } \
         print(len(s)); print(total);",
        "1048576\n1225\n",
    );
}

#[test]
fn test_interned_strings_survive_collection() {
    expect_output(
        "let s = 'x'; \
         for (let i = 0; i < 20; i += 1) { s = s + s; } \
         print('x' == 'x'); print(len('x'));",
        "true\n1\n",
    );
}

#[test]
fn test_runtime_error_reports_and_recovers() {
    let buffer = SharedBuffer::new();
    let mut vm = Vm::with_output(Box::new(buffer.clone()));
    assert_eq!(vm.interpret("fun f() { return 1 + nil; } f();"), Err(InterpretError::Runtime));
    // The same VM keeps working afterwards.
    assert_eq!(vm.interpret("print('still alive');"), Ok(()));
    assert!(buffer.contents().ends_with("still alive\n"));
}

#[test]
fn test_compile_error_result() {
    let (result, output) = run("let = 3;");
    assert_eq!(result, Err(InterpretError::Compile));
    assert_eq!(output, "");
}

#[test]
fn test_returned_closure_outlives_frame() {
    expect_output(
        "fun counter(start) { \
           fun next() { start += 1; return start; } \
           return next; \
         } \
         let a = counter(10); \
         let b = counter(100); \
         print(a()); print(a()); print(b()); print(a());",
        "11\n12\n101\n13\n",
    );
}

#[test]
fn test_native_calls_inside_expressions() {
    expect_output("let xs = [1, 2, 3]; print(len(xs) + 1);", "4\n");
}

#[test]
fn test_print_value_forms() {
    expect_output(
        "fun named() {} print(named); print(print); print(nil); print(true); print(1.5);",
        "<fn named>\n<native fn>\nnil\ntrue\n1.5\n",
    );
}

#[test]
fn test_deep_expression_nesting() {
    expect_output("print(((((1 + 2) * 3) - 4) / 5));", "1\n");
}

#[test]
fn test_empty_list_and_map() {
    expect_output("print(len([])); print(len({})); print([]);", "0\n0\n[]\n");
}
