//! The virtual machine
//!
//! A register-less stack machine: one value stack, a fixed-depth frame
//! stack, and a dispatch loop that reads one opcode at a time. Each call
//! frame windows into the value stack at `slots`, so locals are plain
//! stack slots and calls never copy arguments.
//!
//! Collection scheduling lives here: every allocation made while
//! executing goes through [`Vm::alloc`] / [`Vm::intern_owned`], which
//! first mark the VM roots (value stack, frame closures, open upvalues,
//! globals) and collect if the heap asks for it. Operands therefore stay
//! on the stack until their result object exists.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use quill_core::object::{ClosureData, ListData, MapData, NativeCtx, NativeFn, Obj, UpvalueData, UpvalueState};
use quill_core::value::{display_value, hash_value};
use quill_core::{Heap, ObjId, OpCode, Table, Value};

use crate::error::InterpretError;
use crate::natives;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = 65536;

/// One record on the call stack.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjId,
    /// Cursor into the function's code, pointing at the next byte.
    ip: usize,
    /// Base of this frame's stack window: `stack[slots]` is the callee,
    /// `stack[slots + 1..]` the arguments and locals.
    slots: usize,
}

pub struct Vm {
    heap: Heap,
    globals: Table,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Head of the open-upvalue chain, ordered by descending stack slot.
    open_upvalues: Option<ObjId>,
    /// WIDE prefix state: 2 right after the prefix executes, 1 while the
    /// next instruction must consume it, 0 otherwise.
    next_op_wide: u8,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(std::io::stdout()))
    }

    /// A VM whose program output goes to `out` instead of stdout; tests
    /// pass a [`SharedBuffer`].
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            globals: Table::new(),
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: None,
            next_op_wide: 0,
            out,
        };
        natives::install(&mut vm);
        vm
    }

    /// Compile and execute a source string. Globals persist across calls
    /// on the same VM, so a REPL can feed lines one at a time.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function =
            quill_compiler::compile(source, &mut self.heap, &self.globals)
                .ok_or(InterpretError::Compile)?;

        // Keep the function visible to the collector while the closure is
        // allocated.
        self.stack.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ClosureData {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.stack.push(Value::Obj(closure));
        self.call_value(Value::Obj(closure), 0)?;

        self.run()
    }

    /// Look up a global by name; mainly for tests and embedding.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let hash = quill_core::value::hash_bytes(name.as_bytes());
        let id = self.heap.find_string(name, hash)?;
        self.globals.get(Value::Obj(id), hash)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // ---- the dispatch loop ----

    fn run(&mut self) -> Result<(), InterpretError> {
        loop {
            // Every instruction grows the stack by at most one, so one
            // check per dispatch keeps the whole loop in bounds.
            if self.stack.len() >= STACK_MAX {
                return Err(self.runtime_error("Stack overflow."));
            }

            #[cfg(feature = "trace-execution")]
            self.trace_instruction();

            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(_) => {
                    return Err(self.runtime_error(format!("Unknown opcode {byte}.")));
                }
            };

            match op {
                OpCode::Constant => {
                    let index = self.read_index();
                    let constant = self.constant(index);
                    self.stack.push(constant);
                }
                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopN => {
                    let count = usize::from(self.read_byte());
                    let len = self.stack.len() - count;
                    self.stack.truncate(len);
                }
                OpCode::GetLocal => {
                    let slot = self.read_index();
                    let base = self.current_frame().slots;
                    let value = self.stack[base + slot];
                    self.stack.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_index();
                    let base = self.current_frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let index = self.read_index();
                    let name = self.constant(index);
                    let hash = self.name_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.stack.push(value),
                        None => {
                            let text = self.name_text(name);
                            return Err(self
                                .runtime_error(format!("Undefined variable '{text}'.")));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let index = self.read_index();
                    let name = self.constant(index);
                    let hash = self.name_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let index = self.read_index();
                    let name = self.constant(index);
                    let hash = self.name_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Assignment may not create a global; undo and fail.
                        self.globals.delete(name, hash);
                        let text = self.name_text(name);
                        return Err(self
                            .runtime_error(format!("Undefined variable '{text}'.")));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = usize::from(self.read_byte());
                    let closure = self.current_frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(stack_slot) => self.stack[stack_slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.stack.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = usize::from(self.read_byte());
                    let value = self.peek(0);
                    let closure = self.current_frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(stack_slot) => self.stack[stack_slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number(|a, b| a - b)?,
                OpCode::Multiply => self.binary_number(|a, b| a * b)?,
                OpCode::Divide => self.binary_number(|a, b| a / b)?,
                OpCode::Modulo => self.binary_number(|a, b| a % b)?,
                OpCode::Power => self.binary_number(f64::powf)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.stack.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.stack.push(Value::Number(-n));
                }
                OpCode::Jump => {
                    let offset = usize::from(self.read_u16());
                    self.jump_forward(offset);
                }
                OpCode::JumpIfFalse => {
                    let offset = usize::from(self.read_u16());
                    if self.peek(0).is_falsey() {
                        self.jump_forward(offset);
                    }
                }
                OpCode::Loop => {
                    let offset = usize::from(self.read_u16());
                    self.jump_back(offset);
                }
                OpCode::Call => {
                    let arg_count = usize::from(self.read_byte());
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Closure => {
                    let index = self.read_index();
                    let constant = self.constant(index);
                    let Value::Obj(function) = constant else {
                        panic!("closure constant is not a function");
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ClosureData {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.stack.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte();
                        let upvalue_index = usize::from(self.read_byte());
                        let captured = if is_local == 1 {
                            let base = self.current_frame().slots;
                            self.capture_upvalue(base + upvalue_index)
                        } else {
                            let enclosing = self.current_frame().closure;
                            self.heap.closure(enclosing).upvalues[upvalue_index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(captured);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::BuildList => {
                    let count = self.read_index();
                    let list = self.alloc(Obj::List(ListData {
                        items: Vec::with_capacity(count),
                    }));
                    let base = self.stack.len() - count;
                    let items: Vec<Value> = self.stack[base..].to_vec();
                    self.heap.list_mut(list).items = items;
                    self.stack.truncate(base);
                    self.stack.push(Value::Obj(list));
                }
                OpCode::BuildMap => {
                    let count = self.read_index();
                    let map = self.alloc(Obj::Map(MapData::default()));
                    let base = self.stack.len() - count * 2;
                    for pair in 0..count {
                        let key = self.stack[base + pair * 2];
                        let value = self.stack[base + pair * 2 + 1];
                        let Some(hash) = hash_value(key, &self.heap) else {
                            return Err(self.runtime_error("Map key is not hashable."));
                        };
                        self.heap.map_mut(map).entries.set(key, hash, value);
                    }
                    self.stack.truncate(base);
                    self.stack.push(Value::Obj(map));
                }
                OpCode::IndexSubscr => {
                    let index = self.peek(0);
                    let target = self.peek(1);
                    let result = self.subscript_get(target, index)?;
                    self.pop();
                    self.pop();
                    self.stack.push(result);
                }
                OpCode::StoreSubscr => {
                    let value = self.peek(0);
                    let index = self.peek(1);
                    let target = self.peek(2);
                    self.subscript_set(target, index, value)?;
                    self.pop();
                    self.pop();
                    self.pop();
                    // A store is an expression; it evaluates to the value.
                    self.stack.push(value);
                }
                OpCode::Wide => {
                    self.next_op_wide = 2;
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = *self.current_frame();
                    self.close_upvalues(frame.slots);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // The script closure is still on the stack.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.stack.push(result);
                }
            }

            if self.next_op_wide == 1 {
                return Err(self.runtime_error("OP_WIDE used on an invalid opcode."));
            } else if self.next_op_wide == 2 {
                self.next_op_wide -= 1;
            }
        }
    }

    // ---- instruction stream ----

    fn current_frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn read_byte(&mut self) -> u8 {
        let index = self.frames.len() - 1;
        let (closure, ip) = {
            let frame = &self.frames[index];
            (frame.closure, frame.ip)
        };
        let function = self.heap.closure(closure).function;
        let byte = self.heap.function(function).chunk.code[ip];
        self.frames[index].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        (u16::from(hi) << 8) | u16::from(lo)
    }

    /// Read an operand that honors the WIDE prefix: two bytes if a prefix
    /// is pending, one otherwise.
    fn read_index(&mut self) -> usize {
        if self.next_op_wide == 1 {
            self.next_op_wide = 0;
            usize::from(self.read_u16())
        } else {
            usize::from(self.read_byte())
        }
    }

    fn constant(&self, index: usize) -> Value {
        let frame = self.current_frame();
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    fn jump_forward(&mut self, offset: usize) {
        let index = self.frames.len() - 1;
        self.frames[index].ip += offset;
    }

    fn jump_back(&mut self, offset: usize) {
        let index = self.frames.len() - 1;
        self.frames[index].ip -= offset;
    }

    // ---- stack ----

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => panic!("stack underflow"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- globals helpers ----

    fn name_hash(&self, name: Value) -> u32 {
        let Value::Obj(id) = name else {
            panic!("global name constant is not a string");
        };
        self.heap.string_data(id).hash
    }

    fn name_text(&self, name: Value) -> String {
        let Value::Obj(id) = name else {
            panic!("global name constant is not a string");
        };
        self.heap.as_str(id).to_string()
    }

    // ---- arithmetic ----

    fn binary_number(&mut self, op: fn(f64, f64) -> f64) -> Result<(), InterpretError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.stack.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_compare(&mut self, op: fn(f64, f64) -> bool) -> Result<(), InterpretError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.stack.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn is_string(&self, value: Value) -> bool {
        matches!(value, Value::Obj(id) if matches!(self.heap.get(id), Obj::String(_)))
    }

    fn add(&mut self) -> Result<(), InterpretError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            self.pop();
            self.pop();
            self.stack.push(Value::Number(x + y));
        } else if self.is_string(a) && self.is_string(b) {
            self.concatenate()?;
        } else {
            return Err(self.runtime_error("Operands must be two numbers or two strings."));
        }
        Ok(())
    }

    fn concatenate(&mut self) -> Result<(), InterpretError> {
        // Operands stay on the stack until the result exists, so a
        // collection triggered by the allocation cannot free them.
        let (Value::Obj(a), Value::Obj(b)) = (self.peek(1), self.peek(0)) else {
            panic!("concatenate called without string operands");
        };
        let mut result =
            String::with_capacity(self.heap.as_str(a).len() + self.heap.as_str(b).len());
        result.push_str(self.heap.as_str(a));
        result.push_str(self.heap.as_str(b));
        let id = self.intern_owned(result);
        self.pop();
        self.pop();
        self.stack.push(Value::Obj(id));
        Ok(())
    }

    // ---- calls ----

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), InterpretError> {
        if let Value::Obj(id) = callee {
            match self.heap.get(id) {
                Obj::Closure(_) => return self.call_closure(id, arg_count),
                Obj::Native(native) => {
                    let function: NativeFn = native.function;
                    return self.call_native(function, arg_count);
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn call_closure(&mut self, closure: ObjId, arg_count: usize) -> Result<(), InterpretError> {
        let arity = self.heap.function(self.heap.closure(closure).function).arity;
        if arg_count != arity {
            return Err(
                self.runtime_error(format!("Expected {arity} arguments but got {arg_count}."))
            );
        }

        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_native(&mut self, function: NativeFn, arg_count: usize) -> Result<(), InterpretError> {
        let base = self.stack.len() - arg_count;
        let args: Vec<Value> = self.stack[base..].to_vec();

        // Settle any pending collection while the arguments are still
        // rooted; natives allocate without triggering collection.
        self.maybe_collect();

        let mut ctx = NativeCtx {
            heap: &mut self.heap,
            out: &mut *self.out,
        };
        match function(&mut ctx, &args) {
            Ok(result) => {
                self.stack.truncate(base - 1);
                self.stack.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    // ---- upvalues ----

    /// Find the open upvalue for `slot`, or insert a new one keeping the
    /// chain sorted by descending slot. All closures capturing one slot
    /// share one upvalue.
    fn capture_upvalue(&mut self, slot: usize) -> ObjId {
        let mut prev: Option<ObjId> = None;
        let mut current = self.open_upvalues;
        while let Some(id) = current {
            match self.heap.upvalue(id).state {
                UpvalueState::Open(s) if s > slot => {
                    prev = Some(id);
                    current = self.heap.upvalue(id).next;
                }
                UpvalueState::Open(s) if s == slot => return id,
                _ => break,
            }
        }

        let created = self.alloc(Obj::Upvalue(UpvalueData {
            state: UpvalueState::Open(slot),
            next: current,
        }));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `last`: move the stack value
    /// inline and unlink from the chain.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(id) = self.open_upvalues {
            let UpvalueState::Open(slot) = self.heap.upvalue(id).state else {
                break;
            };
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            let next = self.heap.upvalue(id).next;
            let upvalue = self.heap.upvalue_mut(id);
            upvalue.state = UpvalueState::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }

    // ---- subscripts ----

    fn list_index(
        &mut self,
        len: usize,
        index: Value,
        kind: &str,
    ) -> Result<usize, InterpretError> {
        let Value::Number(n) = index else {
            return Err(self.runtime_error(format!("{kind} index must be a number.")));
        };
        if n.fract() != 0.0 || n < 0.0 || (n as usize) >= len {
            return Err(self.runtime_error(format!("{kind} index out of range.")));
        }
        Ok(n as usize)
    }

    fn subscript_get(&mut self, target: Value, index: Value) -> Result<Value, InterpretError> {
        let Value::Obj(id) = target else {
            return Err(self.runtime_error("Can only subscript lists, maps, and strings."));
        };
        match self.heap.get(id) {
            Obj::List(list) => {
                let len = list.items.len();
                let slot = self.list_index(len, index, "List")?;
                Ok(self.heap.list(id).items[slot])
            }
            Obj::Map(_) => {
                let Some(hash) = hash_value(index, &self.heap) else {
                    return Err(self.runtime_error("Map key is not hashable."));
                };
                match self.heap.map(id).entries.get(index, hash) {
                    Some(value) => Ok(value),
                    None => {
                        let text = display_value(index, &self.heap);
                        Err(self.runtime_error(format!("Undefined key {text} in map.")))
                    }
                }
            }
            Obj::String(s) => {
                let len = s.chars.chars().count();
                let slot = self.list_index(len, index, "String")?;
                let ch = match self.heap.as_str(id).chars().nth(slot) {
                    Some(ch) => ch,
                    None => panic!("string index validated but out of range"),
                };
                let result = self.intern_owned(ch.to_string());
                Ok(Value::Obj(result))
            }
            _ => Err(self.runtime_error("Can only subscript lists, maps, and strings.")),
        }
    }

    fn subscript_set(
        &mut self,
        target: Value,
        index: Value,
        value: Value,
    ) -> Result<(), InterpretError> {
        let Value::Obj(id) = target else {
            return Err(self.runtime_error("Can only store into lists and maps."));
        };
        match self.heap.get(id) {
            Obj::List(list) => {
                let len = list.items.len();
                let slot = self.list_index(len, index, "List")?;
                self.heap.list_mut(id).items[slot] = value;
                Ok(())
            }
            Obj::Map(_) => {
                let Some(hash) = hash_value(index, &self.heap) else {
                    return Err(self.runtime_error("Map key is not hashable."));
                };
                self.heap.map_mut(id).entries.set(index, hash, value);
                Ok(())
            }
            _ => Err(self.runtime_error("Can only store into lists and maps.")),
        }
    }

    // ---- collection scheduling ----

    /// Mark the VM roots and collect if the heap asks for it. Called
    /// before every allocation the dispatch loop makes.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }

        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(id) = upvalue {
            self.heap.mark_object(id);
            upvalue = self.heap.upvalue(id).next;
        }
        self.heap.mark_table(&self.globals);

        self.heap.collect();
    }

    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjId {
        self.maybe_collect();
        self.heap.alloc(obj)
    }

    fn intern_owned(&mut self, text: String) -> ObjId {
        self.maybe_collect();
        self.heap.intern_owned(text)
    }

    pub(crate) fn intern(&mut self, text: &str) -> ObjId {
        self.maybe_collect();
        self.heap.intern(text)
    }

    /// Register a host function under `name`. Both objects ride the stack
    /// across the second allocation, keeping them rooted.
    pub(crate) fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_id = self.intern(name);
        self.stack.push(Value::Obj(name_id));
        let native = self.alloc(Obj::Native(quill_core::object::NativeData { function }));
        self.stack.push(Value::Obj(native));
        let hash = self.heap.string_data(name_id).hash;
        self.globals
            .set(Value::Obj(name_id), hash, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // ---- errors ----

    /// Report a runtime error with a stack trace and reset the machine.
    /// Returns the error value so call sites read `return Err(self.runtime_error(...))`.
    fn runtime_error(&mut self, message: impl AsRef<str>) -> InterpretError {
        eprintln!("{}", message.as_ref());

        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            // The ip already advanced past the failing instruction.
            let line = function.chunk.line_for(frame.ip.saturating_sub(1));
            match function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, self.heap.as_str(name)),
                None => eprintln!("[line {line}] in script"),
            }
        }

        self.reset_stack();
        InterpretError::Runtime
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        self.next_op_wide = 0;
    }

    #[cfg(feature = "trace-execution")]
    fn trace_instruction(&self) {
        print!("          ");
        for value in &self.stack {
            print!("[ {} ]", display_value(*value, &self.heap));
        }
        println!();

        let frame = self.current_frame();
        let function = self.heap.closure(frame.closure).function;
        let chunk = &self.heap.function(function).chunk;
        let mut wide = self.next_op_wide == 1;
        quill_core::debug::disassemble_instruction(&self.heap, chunk, frame.ip, &mut wide);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable in-memory sink for program output, used by tests to assert
/// on what a script printed.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Rc<RefCell<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
