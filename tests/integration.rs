//! End-to-end scenarios driving whole programs through the public `Vm`
//! embedding API, covering the concrete scenarios and testable properties
//! this crate's core is meant to satisfy.

use wispvm::native::Directive;
use wispvm::Vm;

fn as_bytes(vm: &Vm, v: wispvm::Value) -> Vec<u8> {
    v.read_string_owned(&vm.state.heap).unwrap_or_default()
}

#[test]
fn arithmetic_precedence() {
    let mut vm = Vm::new();
    let results = vm.run("return 2 + 3 * 4;").unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(as_bytes(&vm, results[0]), b"14");
}

#[test]
fn division_by_zero_returns_zero_not_a_panic() {
    let mut vm = Vm::new();
    let results = vm.run("return 1 / 0;").unwrap();
    assert_eq!(as_bytes(&vm, results[0]), b"0");
}

#[test]
fn recursive_named_function_resolves_itself() {
    let mut vm = Vm::new();
    let src = r#"
        fn fib(n) {
            if (n < 2) { return n; }
            return fib(n - 1) + fib(n - 2);
        }
        return fib(10);
    "#;
    let results = vm.run(src).unwrap();
    assert_eq!(as_bytes(&vm, results[0]), b"55");
}

#[test]
fn closure_captures_mutable_upvalue_across_calls() {
    let mut vm = Vm::new();
    let src = r#"
        fn make() {
            let i = 0;
            return fn() { i = i + 1; return i; };
        }
        let c = make();
        let a = c();
        let b = c();
        let d = c();
        return [a, b, d];
    "#;
    let results = vm.run(src).unwrap();
    let arr = results[0];
    let a = vm.get_field(arr, b"0").unwrap();
    let b = vm.get_field(arr, b"1").unwrap();
    let d = vm.get_field(arr, b"2").unwrap();
    assert_eq!(as_bytes(&vm, a), b"1");
    assert_eq!(as_bytes(&vm, b), b"2");
    assert_eq!(as_bytes(&vm, d), b"3");
}

#[test]
fn coroutine_yields_are_consumed_in_order_by_for_in() {
    let mut vm = Vm::new();
    let src = r#"
        let co = (coroutine() { yield 1; yield 2; yield 3; })();
        let total = 0;
        for (v in co) {
            total = total + v;
        }
        return total;
    "#;
    let results = vm.run(src).unwrap();
    assert_eq!(as_bytes(&vm, results[0]), b"6");
}

#[test]
fn object_field_delete_removes_the_key() {
    let mut vm = Vm::new();
    let src = r#"
        let obj = { a -> 1, b -> 2 };
        obj.a = null;
        return obj;
    "#;
    let results = vm.run(src).unwrap();
    let obj = results[0];
    assert!(vm.get_field(obj, b"a").is_none());
    assert_eq!(as_bytes(&vm, vm.get_field(obj, b"b").unwrap()), b"2");
}

#[test]
fn try_catch_recovers_a_thrown_panic() {
    let mut vm = Vm::new();
    let src = r#"
        fn boom() { throw "kaboom"; }
        let result = null;
        try {
            boom();
        } catch (e) {
            result = e;
        }
        return result;
    "#;
    let results = vm.run(src).unwrap();
    let err_obj = results[0];
    let message = vm.get_field(err_obj, b"message").unwrap();
    assert_eq!(as_bytes(&vm, message), b"kaboom");
}

#[test]
fn unhandled_panic_surfaces_last_error_and_a_trace() {
    let mut vm = Vm::new();
    let src = r#"
        fn boom() { throw "unhandled"; }
        return boom();
    "#;
    let err = vm.run(src).unwrap_err();
    assert_eq!(err.to_string(), "unhandled");
    assert!(vm.last_error().is_some());
    assert!(vm.stack_trace().unwrap().contains("boom"));
}

#[test]
fn command_dispatch_prefers_a_matching_global_over_the_dispatcher() {
    let mut vm = Vm::new();
    vm.set_command_dispatcher(wispvm::Value::Null);
    vm.register_native("greet", 0, 0, false, |_state, _argc, _step| {
        Ok(Directive::Return(vec![wispvm::Value::null()]))
    });
    // `greet()` is an unresolved bareword call, compiled as CMD; a global of
    // that name must be tried before falling through to the dispatcher.
    let results = vm.run("return greet();").unwrap();
    assert_eq!(results[0], wispvm::Value::Null);
}

#[test]
fn registered_native_function_is_callable_from_script() {
    let mut vm = Vm::new();
    vm.register_native("double", 1, 0, false, |state, _argc, _step| {
        let n = state.arg(0).coerce_int(&state.heap).unwrap_or(0);
        let v = wispvm::Value::from_int(&mut state.heap, n * 2);
        Ok(Directive::Return(vec![v]))
    });
    let results = vm.run("return double(21);").unwrap();
    assert_eq!(as_bytes(&vm, results[0]), b"42");
}

#[test]
fn destructuring_let_folds_a_trailing_call_to_two_returns() {
    let mut vm = Vm::new();
    let src = r#"
        fn pair() { return 1, 2; }
        let a, b = pair();
        return a + b;
    "#;
    let results = vm.run(src).unwrap();
    assert_eq!(as_bytes(&vm, results[0]), b"3");
}

#[test]
fn destructuring_let_unpacks_an_array_when_rhs_is_not_a_bare_call() {
    let mut vm = Vm::new();
    let src = r#"
        fn pair() { return [1, 2]; }
        let a, b = pair().x;
        return a;
    "#;
    // `pair().x` isn't a bare call (it's a field read following one), so the
    // destructuring target list falls back to an explicit `UNPACK` of the
    // single value left on the stack; `.x` on an array-form object is a miss
    // and yields `NULL`, so both targets come back `NULL`.
    let results = vm.run(src).unwrap();
    assert_eq!(results[0], wispvm::Value::Null);
}

#[test]
fn question_operator_short_circuits_on_null() {
    let mut vm = Vm::new();
    let src = r#"
        fn find(obj) {
            let v = obj.missing?;
            return "unreachable";
        }
        return find({ a -> 1 });
    "#;
    let results = vm.run(src).unwrap();
    assert_eq!(results[0], wispvm::Value::Null);
}

#[test]
fn question_operator_passes_through_non_null() {
    let mut vm = Vm::new();
    let src = r#"
        fn find(obj) {
            let v = obj.a?;
            return v + 1;
        }
        return find({ a -> 1 });
    "#;
    let results = vm.run(src).unwrap();
    assert_eq!(as_bytes(&vm, results[0]), b"2");
}

#[test]
fn reading_a_field_off_a_non_object_yields_null() {
    let mut vm = Vm::new();
    let results = vm.run(r#"return null.foo;"#).unwrap();
    assert_eq!(results[0], wispvm::Value::Null);
}

#[test]
fn arithmetic_on_a_non_coercible_value_raises_coerce_failure() {
    let mut vm = Vm::new();
    let err = vm.run(r#"return { a -> 1 } + 1;"#).unwrap_err();
    assert!(matches!(err, wispvm::VmError::CoerceFailure { .. }), "got {err:?}");
}

#[test]
fn concat_on_a_non_string_readable_operand_raises_coerce_failure() {
    let mut vm = Vm::new();
    let src = r#"
        let obj = { a -> 1 };
        return "x${obj}";
    "#;
    let err = vm.run(src).unwrap_err();
    assert!(matches!(err, wispvm::VmError::CoerceFailure { .. }), "got {err:?}");
}

#[test]
fn loading_an_undefined_global_raises_undefined_global() {
    let mut vm = Vm::new();
    let err = vm.run(r#"let x = totallyUndefinedName; return x;"#).unwrap_err();
    assert!(matches!(err, wispvm::VmError::UndefinedGlobal { .. }), "got {err:?}");
}

#[test]
fn command_with_no_matching_global_and_no_dispatcher_raises_no_command_handler() {
    let mut vm = Vm::new();
    vm.set_command_dispatcher(wispvm::Value::Null);
    let err = vm.run(r#"return thisCommandDoesNotExist();"#).unwrap_err();
    assert!(matches!(err, wispvm::VmError::NoCommandHandler { .. }), "got {err:?}");
}

#[test]
fn command_dispatcher_receives_capture_and_pipe_flags() {
    let mut vm = Vm::new();
    vm.register_native("dispatch", 3, 0, false, |state, argc, _step| {
        // args: [name, pipe_in, capture_output]
        let pipe_in = state.arg(1);
        let capture_output = state.arg(2);
        assert_eq!(argc, 3);
        Ok(Directive::Return(vec![pipe_in, capture_output]))
    });
    let dispatcher = vm.get_global("dispatch");
    vm.set_command_dispatcher(dispatcher);
    let results = vm.run(r#"return thisCommandDoesNotExist();"#).unwrap();
    // No surface syntax sets the capture/pipe bits yet; the compiler's
    // `CMD` emission defaults both to `false`.
    assert_eq!(results[0], wispvm::Value::from_bool(false));
}

#[test]
fn garbage_collection_reclaims_unreachable_objects() {
    let mut vm = Vm::new();
    vm.run("let a = { x -> 1 }; let b = { y -> 2 };").unwrap();
    let before = vm.heap_live_count();
    vm.collect_garbage_now();
    // Nothing here is reachable from globals once the call returns (locals
    // went out of scope with the frame), so a full collection should shrink
    // the live set rather than grow or merely hold it.
    assert!(vm.heap_live_count() <= before);
}
