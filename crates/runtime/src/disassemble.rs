//! Bytecode disassembler, wired in only under the `trace-execution` feature.
//!
//! Mirrors the VM's own decode logic closely enough that the two can't
//! silently drift apart without a test noticing: every opcode here has a
//! matching arm in `vm::Vm::run`, and `disassemble_chunk` is exercised by
//! compiler tests that dump bytecode for known-good programs.

use crate::chunk::Chunk;
use crate::opcode::OpCode;
use lox_core::ObjString;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

/// Prints one instruction and returns the offset of the next one.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{offset:04} ");
    let line = chunk.line_for(offset);
    if offset > 0 && line == chunk.line_for(offset - 1) {
        print!("   | ");
    } else {
        print!("{line:4} ");
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_u8(byte) else {
        println!("Unknown opcode {byte}");
        return offset + 1;
    };

    match op {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, offset),
        OpCode::Nil => simple_instruction("OP_NIL", offset),
        OpCode::True => simple_instruction("OP_TRUE", offset),
        OpCode::False => simple_instruction("OP_FALSE", offset),
        OpCode::Pop => simple_instruction("OP_POP", offset),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset),
        OpCode::DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset),
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset),
        OpCode::GetProperty => constant_instruction("OP_GET_PROPERTY", chunk, offset),
        OpCode::SetProperty => constant_instruction("OP_SET_PROPERTY", chunk, offset),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset),
        OpCode::Greater => simple_instruction("OP_GREATER", offset),
        OpCode::Less => simple_instruction("OP_LESS", offset),
        OpCode::Add => simple_instruction("OP_ADD", offset),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset),
        OpCode::Not => simple_instruction("OP_NOT", offset),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset),
        OpCode::Print => simple_instruction("OP_PRINT", offset),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset),
        OpCode::Invoke => invoke_instruction("OP_INVOKE", chunk, offset),
        OpCode::SuperInvoke => invoke_instruction("OP_SUPER_INVOKE", chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        OpCode::Return => simple_instruction("OP_RETURN", offset),
        OpCode::Class => constant_instruction("OP_CLASS", chunk, offset),
        OpCode::Inherit => simple_instruction("OP_INHERIT", offset),
        OpCode::Method => constant_instruction("OP_METHOD", chunk, offset),
        OpCode::GetSuper => constant_instruction("OP_GET_SUPER", chunk, offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{name}");
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{name:-16} {slot:4}");
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let hi = chunk.code[offset + 1] as u16;
    let lo = chunk.code[offset + 2] as u16;
    let jump = ((hi << 8) | lo) as i32;
    let target = offset as i32 + 3 + sign * jump;
    println!("{name:-16} {offset:4} -> {target}");
    offset + 3
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let rendered = render_constant(chunk, idx);
    println!("{name:-16} {idx:4} '{rendered}'");
    offset + 2
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let argc = chunk.code[offset + 2];
    let rendered = render_constant(chunk, idx);
    println!("{name:-16} ({argc} args) {idx:4} '{rendered}'");
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let idx = chunk.code[offset] as usize;
    offset += 1;
    let rendered = render_constant(chunk, idx);
    println!("{:-16} {idx:4} '{rendered}'", "OP_CLOSURE");

    let function = chunk.constants[idx].as_object().cast::<crate::objects::ObjFunction>();
    let upvalue_count = unsafe { function.as_ref().upvalue_count };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset] != 0;
        let index = chunk.code[offset + 1];
        let kind = if is_local { "local" } else { "upvalue" };
        println!("{offset:04}      |                     {kind} {index}");
        offset += 2;
    }
    offset
}

fn render_constant(chunk: &Chunk, idx: usize) -> String {
    let v = chunk.constants[idx];
    if v.is_object() && unsafe { v.as_object().as_ref().kind } == lox_core::ObjKind::String {
        unsafe { v.as_object().cast::<ObjString>().as_ref() }
            .as_str()
            .to_string()
    } else {
        crate::vm::render_value(v)
    }
}
