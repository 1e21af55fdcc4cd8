//! The native function library
//!
//! Host functions installed into the globals of every new VM. The calling
//! contract: a native receives the heap and output sink through
//! [`NativeCtx`] plus its argument slice, and either returns a result
//! value or an error message that becomes a runtime error.
//!
//! Natives may allocate freely — collection only happens at the VM's own
//! allocation points, so nothing created inside a native can be swept
//! before it is returned and rooted.

use std::sync::OnceLock;
use std::time::Instant;

use quill_core::object::{ListData, NativeCtx, NativeFn, Obj};
use quill_core::value::{display_value, hash_value};
use quill_core::{Heap, Value};

use crate::vm::Vm;

static STARTED: OnceLock<Instant> = OnceLock::new();

const NATIVES: &[(&str, NativeFn)] = &[
    ("append", append),
    ("assert", assert_native),
    ("clock", clock),
    ("delete", delete),
    ("has", has),
    ("input", input),
    ("items", items),
    ("keys", keys),
    ("len", len),
    ("num", num),
    ("print", print),
    ("values", values),
    ("write", write_native),
];

pub(crate) fn install(vm: &mut Vm) {
    STARTED.get_or_init(Instant::now);
    for (name, function) in NATIVES {
        vm.define_native(name, *function);
    }
}

fn expect_args(name: &str, expected: usize, args: &[Value]) -> Result<(), String> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(format!(
            "{name} expected {expected} arguments but got {}.",
            args.len()
        ))
    }
}

/// Strings print as their raw contents; everything else uses the display
/// form.
fn printable(heap: &Heap, value: Value) -> String {
    if let Value::Obj(id) = value {
        if let Obj::String(s) = heap.get(id) {
            return s.chars.to_string();
        }
    }
    display_value(value, heap)
}

/// Append a value to the end of a list, growing it by one.
fn append(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("append", 2, args)?;
    let list = match args[0] {
        Value::Obj(id) if matches!(ctx.heap.get(id), Obj::List(_)) => id,
        _ => return Err("append expected the first argument to be a list.".to_string()),
    };
    ctx.heap.list_mut(list).items.push(args[1]);
    Ok(Value::Nil)
}

/// Raise a runtime error if the argument is falsey.
fn assert_native(_ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("assert", 1, args)?;
    if args[0].is_falsey() {
        return Err("failed assertion.".to_string());
    }
    Ok(Value::Nil)
}

/// Seconds the process has been alive, as a number.
fn clock(_ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("clock", 0, args)?;
    let started = STARTED.get_or_init(Instant::now);
    Ok(Value::Number(started.elapsed().as_secs_f64()))
}

/// Remove an index from a list (shifting the tail down) or a key from a
/// map.
fn delete(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("delete", 2, args)?;
    let Value::Obj(id) = args[0] else {
        return Err("delete expected the first argument to be a list or map.".to_string());
    };
    match ctx.heap.get(id) {
        Obj::List(list) => {
            let len = list.items.len();
            let Value::Number(n) = args[1] else {
                return Err("delete expected the second argument to be a number.".to_string());
            };
            if n.fract() != 0.0 || n < 0.0 || (n as usize) >= len {
                return Err("index you are trying to delete is out of range.".to_string());
            }
            ctx.heap.list_mut(id).items.remove(n as usize);
            Ok(Value::Nil)
        }
        Obj::Map(_) => {
            let Some(hash) = hash_value(args[1], ctx.heap) else {
                return Err("Map key is not hashable.".to_string());
            };
            if !ctx.heap.map_mut(id).entries.delete(args[1], hash) {
                return Err("key you are trying to delete does not exist.".to_string());
            }
            Ok(Value::Nil)
        }
        _ => Err("delete expected the first argument to be a list or map.".to_string()),
    }
}

/// Membership: a value in a list, or a key in a map.
fn has(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("has", 2, args)?;
    let Value::Obj(id) = args[0] else {
        return Err("has expected the first argument to be a list or map.".to_string());
    };
    match ctx.heap.get(id) {
        Obj::List(list) => Ok(Value::Bool(list.items.iter().any(|&item| item == args[1]))),
        Obj::Map(map) => {
            let Some(hash) = hash_value(args[1], ctx.heap) else {
                return Err("Map key is not hashable.".to_string());
            };
            Ok(Value::Bool(map.entries.get(args[1], hash).is_some()))
        }
        _ => Err("has expected the first argument to be a list or map.".to_string()),
    }
}

/// Read one line from stdin, without the trailing newline.
fn input(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("input", 0, args)?;
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(_) => {
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(Value::Obj(ctx.heap.intern_owned(line)))
        }
        Err(err) => Err(format!("input failed to read from stdin: {err}.")),
    }
}

fn expect_map(ctx: &NativeCtx, name: &str, value: Value) -> Result<quill_core::ObjId, String> {
    match value {
        Value::Obj(id) if matches!(ctx.heap.get(id), Obj::Map(_)) => Ok(id),
        _ => Err(format!("{name} expected a map.")),
    }
}

/// List of two-element `[key, value]` lists, one per map entry.
fn items(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("items", 1, args)?;
    let map = expect_map(ctx, "items", args[0])?;
    let pairs: Vec<(Value, Value)> = ctx.heap.map(map).entries.iter().collect();
    let mut result = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        let pair = ctx.heap.alloc(Obj::List(ListData {
            items: vec![key, value],
        }));
        result.push(Value::Obj(pair));
    }
    Ok(Value::Obj(ctx.heap.alloc(Obj::List(ListData { items: result }))))
}

fn keys(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("keys", 1, args)?;
    let map = expect_map(ctx, "keys", args[0])?;
    let items: Vec<Value> = ctx.heap.map(map).entries.iter().map(|(k, _)| k).collect();
    Ok(Value::Obj(ctx.heap.alloc(Obj::List(ListData { items }))))
}

fn values(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("values", 1, args)?;
    let map = expect_map(ctx, "values", args[0])?;
    let items: Vec<Value> = ctx.heap.map(map).entries.iter().map(|(_, v)| v).collect();
    Ok(Value::Obj(ctx.heap.alloc(Obj::List(ListData { items }))))
}

/// Length of a string (in characters), list, or map.
fn len(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("len", 1, args)?;
    if let Value::Obj(id) = args[0] {
        match ctx.heap.get(id) {
            Obj::String(s) => return Ok(Value::Number(s.chars.chars().count() as f64)),
            Obj::List(list) => return Ok(Value::Number(list.items.len() as f64)),
            Obj::Map(map) => return Ok(Value::Number(map.entries.len() as f64)),
            _ => {}
        }
    }
    Err("len expected a string, list, or map.".to_string())
}

/// Convert a boolean, number, or numeric string to a number.
fn num(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("num", 1, args)?;
    match args[0] {
        Value::Bool(b) => Ok(Value::Number(if b { 1.0 } else { 0.0 })),
        Value::Number(_) => Ok(args[0]),
        Value::Obj(id) => {
            let Obj::String(s) = ctx.heap.get(id) else {
                return Err("num was passed an unexpected type.".to_string());
            };
            match s.chars.trim().parse::<f64>() {
                Ok(value) => Ok(Value::Number(value)),
                Err(_) => Err(format!("Cannot convert '{}' to a number.", s.chars)),
            }
        }
        Value::Nil => Err("num was passed an unexpected type.".to_string()),
    }
}

/// Write a value and a newline to the program output.
fn print(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("print", 1, args)?;
    let rendered = printable(ctx.heap, args[0]);
    let _ = writeln!(ctx.out, "{rendered}");
    Ok(Value::Nil)
}

/// Write a value to the program output with no newline.
fn write_native(ctx: &mut NativeCtx, args: &[Value]) -> Result<Value, String> {
    expect_args("write", 1, args)?;
    let rendered = printable(ctx.heap, args[0]);
    let _ = write!(ctx.out, "{rendered}");
    Ok(Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::SharedBuffer;

    fn run_with_output(source: &str) -> (Result<(), crate::InterpretError>, String) {
        let buffer = SharedBuffer::new();
        let mut vm = Vm::with_output(Box::new(buffer.clone()));
        let result = vm.interpret(source);
        (result, buffer.contents())
    }

    #[test]
    fn test_print_strings_without_quotes() {
        let (result, output) = run_with_output("print('plain'); print([1, 'quoted']);");
        assert!(result.is_ok());
        assert_eq!(output, "plain\n[1, 'quoted']\n");
    }

    #[test]
    fn test_write_omits_newline() {
        let (result, output) = run_with_output("write(1); write('x'); write(2);");
        assert!(result.is_ok());
        assert_eq!(output, "1x2");
    }

    #[test]
    fn test_len_across_kinds() {
        let (result, output) =
            run_with_output("print(len('abc')); print(len([1, 2])); print(len({1: 2}));");
        assert!(result.is_ok());
        assert_eq!(output, "3\n2\n1\n");
    }

    #[test]
    fn test_append_and_delete() {
        let (result, output) = run_with_output(
            "let xs = [1, 2]; append(xs, 3); print(len(xs)); delete(xs, 0); print(xs[0]);",
        );
        assert!(result.is_ok());
        assert_eq!(output, "3\n2\n");
    }

    #[test]
    fn test_delete_map_key() {
        let (result, output) = run_with_output(
            "let m = {'a': 1, 'b': 2}; delete(m, 'a'); print(len(m)); print(has(m, 'a'));",
        );
        assert!(result.is_ok());
        assert_eq!(output, "1\nfalse\n");
    }

    #[test]
    fn test_delete_missing_key_errors() {
        let (result, _) = run_with_output("delete({}, 'ghost');");
        assert!(result.is_err());
    }

    #[test]
    fn test_has_on_lists_and_maps() {
        let (result, output) = run_with_output(
            "print(has([1, 2], 2)); print(has([1, 2], 9)); print(has({'k': 1}, 'k'));",
        );
        assert!(result.is_ok());
        assert_eq!(output, "true\nfalse\ntrue\n");
    }

    #[test]
    fn test_keys_values_items() {
        let (result, output) = run_with_output(
            "let m = {'k': 7}; print(keys(m)); print(values(m)); print(items(m));",
        );
        assert!(result.is_ok());
        assert_eq!(output, "['k']\n[7]\n[['k', 7]]\n");
    }

    #[test]
    fn test_num_conversions() {
        let (result, output) = run_with_output(
            "print(num(true)); print(num(false)); print(num(3.5)); print(num('42'));",
        );
        assert!(result.is_ok());
        assert_eq!(output, "1\n0\n3.5\n42\n");
    }

    #[test]
    fn test_num_rejects_bad_strings() {
        let (result, _) = run_with_output("num('not a number');");
        assert!(result.is_err());
    }

    #[test]
    fn test_assert_passes_and_fails() {
        let (result, _) = run_with_output("assert(1 == 1);");
        assert!(result.is_ok());
        let (result, _) = run_with_output("assert(1 == 2);");
        assert!(result.is_err());
    }

    #[test]
    fn test_arity_messages() {
        let (result, _) = run_with_output("len();");
        assert!(result.is_err());
        let (result, _) = run_with_output("clock(1);");
        assert!(result.is_err());
    }

    #[test]
    fn test_clock_is_a_number() {
        let (result, output) = run_with_output("print(clock() >= 0);");
        assert!(result.is_ok());
        assert_eq!(output, "true\n");
    }
}
