//! Chunk disassembler
//!
//! Per-instruction printing for compiler output (`print-code`) and the
//! execution trace (`trace-execution`). Offsets are printed in 4 digits, a
//! `|` marks instructions on the same source line as their predecessor, and
//! WIDE prefixes widen the next instruction's printed operand just as they
//! do at runtime.

use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::opcode::OpCode;
use crate::value::{Value, display_value};

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) {
    println!("== {name} ==");

    let mut wide = false;
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut wide);
    }
}

/// Print one instruction and return the offset of the next. `wide` carries
/// the WIDE-prefix state between calls.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    wide: &mut bool,
) -> usize {
    print!("{offset:04} ");
    if offset > 0 && chunk.line_for(offset) == chunk.line_for(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.line_for(offset));
    }

    let byte = chunk.code[offset];
    let Ok(op) = OpCode::try_from(byte) else {
        println!("Unknown opcode {byte}");
        return offset + 1;
    };

    match op {
        OpCode::Constant => constant_instruction("OP_CONSTANT", heap, chunk, offset, wide),
        OpCode::Nil => simple_instruction("OP_NIL", offset),
        OpCode::True => simple_instruction("OP_TRUE", offset),
        OpCode::False => simple_instruction("OP_FALSE", offset),
        OpCode::Pop => simple_instruction("OP_POP", offset),
        OpCode::PopN => byte_instruction("OP_POP_N", chunk, offset, wide),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset, wide),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset, wide),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", heap, chunk, offset, wide),
        OpCode::DefineGlobal => {
            constant_instruction("OP_DEFINE_GLOBAL", heap, chunk, offset, wide)
        }
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", heap, chunk, offset, wide),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset, wide),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset, wide),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset),
        OpCode::Greater => simple_instruction("OP_GREATER", offset),
        OpCode::Less => simple_instruction("OP_LESS", offset),
        OpCode::Add => simple_instruction("OP_ADD", offset),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset),
        OpCode::Modulo => simple_instruction("OP_MODULO", offset),
        OpCode::Power => simple_instruction("OP_POWER", offset),
        OpCode::Not => simple_instruction("OP_NOT", offset),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset, wide),
        OpCode::Closure => closure_instruction(heap, chunk, offset, wide),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        OpCode::BuildList => byte_instruction("OP_BUILD_LIST", chunk, offset, wide),
        OpCode::BuildMap => byte_instruction("OP_BUILD_MAP", chunk, offset, wide),
        OpCode::IndexSubscr => simple_instruction("OP_INDEX_SUBSCR", offset),
        OpCode::StoreSubscr => simple_instruction("OP_STORE_SUBSCR", offset),
        OpCode::Wide => {
            *wide = true;
            simple_instruction("OP_WIDE", offset)
        }
        OpCode::Return => simple_instruction("OP_RETURN", offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{name}");
    offset + 1
}

fn read_operand(chunk: &Chunk, offset: usize, wide: &mut bool) -> (usize, usize) {
    if std::mem::take(wide) {
        let operand =
            (usize::from(chunk.code[offset + 1]) << 8) | usize::from(chunk.code[offset + 2]);
        (operand, offset + 3)
    } else {
        (usize::from(chunk.code[offset + 1]), offset + 2)
    }
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, wide: &mut bool) -> usize {
    let (operand, next) = read_operand(chunk, offset, wide);
    println!("{name:<16} {operand:5}");
    next
}

fn constant_instruction(
    name: &str,
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    wide: &mut bool,
) -> usize {
    let (constant, next) = read_operand(chunk, offset, wide);
    println!(
        "{name:<16} {constant:5} '{}'",
        display_value(chunk.constants[constant], heap)
    );
    next
}

fn jump_instruction(name: &str, sign: isize, chunk: &Chunk, offset: usize) -> usize {
    let jump =
        (usize::from(chunk.code[offset + 1]) << 8) | usize::from(chunk.code[offset + 2]);
    let target = (offset as isize + 3) + sign * jump as isize;
    println!("{name:<16} {offset:5} -> {target}");
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, wide: &mut bool) -> usize {
    let (constant, mut next) = read_operand(chunk, offset, wide);
    let value = chunk.constants[constant];
    println!("{:<16} {constant:4} {}", "OP_CLOSURE", display_value(value, heap));

    if let Value::Obj(id) = value {
        let upvalue_count = heap.function(id).upvalue_count;
        for _ in 0..upvalue_count {
            let is_local = chunk.code[next];
            let index = chunk.code[next + 1];
            println!(
                "{:04}      |                     {} {}",
                next,
                if is_local == 1 { "local" } else { "upvalue" },
                index
            );
            next += 2;
        }
    }
    next
}
