//! Quill runtime
//!
//! The stack-based virtual machine that executes compiled chunks, the
//! garbage-collection scheduling around it, and the native function
//! library. One [`Vm`] is one execution context: fully synchronous, with
//! globals that persist across [`Vm::interpret`] calls (the REPL relies on
//! this).

pub mod error;
pub mod natives;
pub mod vm;

pub use error::InterpretError;
pub use vm::{SharedBuffer, Vm};

use quill_core::{Heap, Obj, Table, Value};

/// Compile a source string and dump the disassembly of every function in
/// it, outermost first. Used by the `dis` CLI subcommand.
pub fn disassemble_source(source: &str) -> Result<(), InterpretError> {
    let mut heap = Heap::new();
    let globals = Table::new();
    let script =
        quill_compiler::compile(source, &mut heap, &globals).ok_or(InterpretError::Compile)?;

    let mut pending = vec![script];
    while let Some(function) = pending.pop() {
        let data = heap.function(function);
        let name = match data.name {
            Some(name) => heap.as_str(name).to_string(),
            None => "<script>".to_string(),
        };
        quill_core::debug::disassemble_chunk(&heap, &data.chunk, &name);

        for constant in &data.chunk.constants {
            if let Value::Obj(id) = constant {
                if matches!(heap.get(*id), Obj::Function(_)) {
                    pending.push(*id);
                }
            }
        }
    }
    Ok(())
}
