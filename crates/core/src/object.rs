//! Heap object kinds
//!
//! Every heap-allocated thing in Quill is one variant of [`Obj`], stored in
//! a slot of the heap arena and referred to by [`ObjId`]. The VM exclusively
//! owns the arena; objects refer to each other only through ids, so cyclic
//! graphs (closure -> upvalue -> stack -> closure) need no ownership
//! gymnastics and are collected by mark-and-sweep.

use std::io::Write;

use crate::chunk::Chunk;
use crate::heap::{Heap, ObjId};
use crate::table::Table;
use crate::value::Value;

#[derive(Debug)]
pub enum Obj {
    String(StringData),
    Function(FunctionData),
    Closure(ClosureData),
    Upvalue(UpvalueData),
    Native(NativeData),
    List(ListData),
    Map(MapData),
}

impl Obj {
    /// Estimated heap footprint in bytes, used for collection scheduling.
    /// Owned buffers are counted by capacity; the estimate is recomputed at
    /// sweep time so mutation between allocation and collection only skews
    /// the trigger, never correctness.
    pub fn size_estimate(&self) -> usize {
        let payload = match self {
            Obj::String(s) => s.chars.len(),
            Obj::Function(f) => {
                f.chunk.code.capacity()
                    + f.chunk.constants.capacity() * std::mem::size_of::<Value>()
                    + f.chunk.lines.capacity() * std::mem::size_of::<u32>()
            }
            Obj::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjId>(),
            Obj::Upvalue(_) | Obj::Native(_) => 0,
            Obj::List(l) => l.items.capacity() * std::mem::size_of::<Value>(),
            Obj::Map(m) => m.entries.byte_size(),
        };
        std::mem::size_of::<Obj>() + payload
    }
}

/// Immutable byte sequence plus its cached FNV-1a hash. One canonical
/// instance exists per distinct content (see [`Heap::intern`]).
#[derive(Debug)]
pub struct StringData {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function: arity, captured-variable count, optional name, and
/// the bytecode chunk the compiler built for it. The chunk is immutable
/// once compilation of the function ends.
#[derive(Debug)]
pub struct FunctionData {
    pub arity: usize,
    pub upvalue_count: usize,
    pub name: Option<ObjId>,
    pub chunk: Chunk,
}

impl FunctionData {
    pub fn new() -> Self {
        FunctionData {
            arity: 0,
            upvalue_count: 0,
            name: None,
            chunk: Chunk::new(),
        }
    }
}

impl Default for FunctionData {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime pairing of a function with its captured upvalues.
#[derive(Debug)]
pub struct ClosureData {
    pub function: ObjId,
    pub upvalues: Vec<ObjId>,
}

/// A captured variable. While the variable's stack slot is live the upvalue
/// is *open* and points at it; when the slot is about to go out of scope
/// the value moves inline and the upvalue is *closed*.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct UpvalueData {
    pub state: UpvalueState,
    /// Link in the VM's open-upvalue chain, ordered by descending stack
    /// slot. `None` once closed or at the chain tail.
    pub next: Option<ObjId>,
}

/// Context handed to native functions: heap access for reading and
/// creating objects, and the VM's output sink.
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub out: &'a mut dyn Write,
}

/// The host calling convention. `Err(message)` raises a runtime error with
/// that message; `Ok(value)` replaces the callee and arguments with the
/// result.
pub type NativeFn = fn(&mut NativeCtx<'_>, &[Value]) -> Result<Value, String>;

pub struct NativeData {
    pub function: NativeFn,
}

impl std::fmt::Debug for NativeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<native fn>")
    }
}

/// Growable sequence of values.
#[derive(Debug, Default)]
pub struct ListData {
    pub items: Vec<Value>,
}

/// Hash table keyed by any hashable value.
#[derive(Debug, Default)]
pub struct MapData {
    pub entries: Table,
}
