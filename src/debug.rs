//! Disassembler for [Chunk]s, used by `print_code` and `trace_execution`.

use std::fmt::{self, Write};

use crate::chunk::{Chunk, OpCode, UPVALUE_IS_LOCAL};
use crate::gc::Heap;
use crate::value::{NumericKind, Value};

/// Writes a listing of every instruction in the chunk.
pub fn disassemble_chunk<W: Write>(
    out: &mut W,
    heap: &Heap,
    chunk: &Chunk,
    name: &str,
) -> fmt::Result {
    writeln!(out, "== {name} ==")?;

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(out, heap, chunk, offset)?;
    }
    Ok(())
}

/// Writes the instruction at `offset`, and returns the offset of the next one.
pub fn disassemble_instruction<W: Write>(
    out: &mut W,
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
) -> Result<usize, fmt::Error> {
    write!(out, "{:04} ", offset)?;

    let line = chunk.line_number_for(offset);
    if offset > 0 && line == chunk.line_number_for(offset - 1) {
        write!(out, "   | ")?;
    } else {
        write!(out, "{:4} ", line.unwrap_or_default())?;
    }

    let Some(instruction) = chunk.opcode_at(offset) else {
        writeln!(out, "Unknown opcode {}", chunk.read_byte(offset))?;
        return Ok(offset + 1);
    };

    use OpCode::*;
    let name = instruction.name();
    match instruction {
        Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty | GetSuper
        | GetLayer | Class | Method | Struct | Member | Enum => {
            let index = chunk.read_byte(offset + 1) as usize;
            constant_instruction(out, heap, chunk, name, index)?;
            Ok(offset + 2)
        }
        ConstantLong => {
            let index = chunk.read_short(offset + 1) as usize;
            constant_instruction(out, heap, chunk, name, index)?;
            Ok(offset + 3)
        }
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call | VecNew | EnumBind => {
            writeln!(out, "{name:<16} {:4}", chunk.read_byte(offset + 1))?;
            Ok(offset + 2)
        }
        Convert => {
            let byte = chunk.read_byte(offset + 1);
            let kind = NumericKind::try_from(byte).map_or("?", NumericKind::name);
            writeln!(out, "{name:<16} {byte:4} ({kind})")?;
            Ok(offset + 2)
        }
        Jump | JumpIfFalse | JumpIfNotEqual => {
            let distance = chunk.read_short(offset + 1) as usize;
            writeln!(out, "{name:<16} {:4} -> {}", offset, offset + 3 + distance)?;
            Ok(offset + 3)
        }
        Loop => {
            let distance = chunk.read_short(offset + 1) as usize;
            let target = (offset + 3).saturating_sub(distance);
            writeln!(out, "{name:<16} {:4} -> {}", offset, target)?;
            Ok(offset + 3)
        }
        Invoke | SuperInvoke | LayerCall => {
            let index = chunk.read_byte(offset + 1) as usize;
            let argc = chunk.read_byte(offset + 2);
            writeln!(
                out,
                "{name:<16} ({argc} args) {index:4} '{}'",
                display_constant(heap, chunk, index)
            )?;
            Ok(offset + 3)
        }
        EnumMember => {
            let index = chunk.read_byte(offset + 1) as usize;
            let arity = chunk.read_byte(offset + 2);
            writeln!(
                out,
                "{name:<16} {index:4} '{}' ({arity} values)",
                display_constant(heap, chunk, index)
            )?;
            Ok(offset + 3)
        }
        EnumMatch => {
            let index = chunk.read_byte(offset + 1) as usize;
            let distance = chunk.read_short(offset + 2) as usize;
            writeln!(
                out,
                "{name:<16} {index:4} '{}' else -> {}",
                display_constant(heap, chunk, index),
                offset + 4 + distance
            )?;
            Ok(offset + 4)
        }
        Closure => closure_instruction(out, heap, chunk, offset),
        _ => {
            writeln!(out, "{name}")?;
            Ok(offset + 1)
        }
    }
}

fn constant_instruction<W: Write>(
    out: &mut W,
    heap: &Heap,
    chunk: &Chunk,
    name: &str,
    index: usize,
) -> fmt::Result {
    writeln!(
        out,
        "{name:<16} {index:4} '{}'",
        display_constant(heap, chunk, index)
    )
}

/// `Closure` is followed by one descriptor byte per captured variable.
fn closure_instruction<W: Write>(
    out: &mut W,
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
) -> Result<usize, fmt::Error> {
    let index = chunk.read_short(offset + 1) as usize;
    let function = chunk.constant(index);
    writeln!(
        out,
        "{:<16} {index:4} {}",
        OpCode::Closure.name(),
        heap.display(function)
    )?;

    let upvalue_count = match function {
        Value::Obj(reference) => heap.function(reference).upvalue_count,
        _ => 0,
    };

    let mut offset = offset + 3;
    for _ in 0..upvalue_count {
        let descriptor = chunk.read_byte(offset);
        let kind = if descriptor & UPVALUE_IS_LOCAL != 0 {
            "local"
        } else {
            "upvalue"
        };
        writeln!(
            out,
            "{offset:04}    |                  {kind} {}",
            descriptor & !UPVALUE_IS_LOCAL
        )?;
        offset += 1;
    }
    Ok(offset)
}

/// Constants are displayed the way `print` would show them.
fn display_constant(heap: &Heap, chunk: &Chunk, index: usize) -> String {
    match chunk.constants.get(index) {
        Some(&value) => heap.display(value).to_string(),
        None => "<invalid constant>".to_owned(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::object::{Obj, ObjString};

    #[test]
    fn listing_shows_lines_and_operands() {
        let mut heap = Heap::default();
        let mut chunk = Chunk::new();
        let name = heap.insert(Obj::String(ObjString {
            chars: "answer".into(),
            hash: 0,
        }));

        let value = chunk.add_constant(Value::I32(42)) as u8;
        let global = chunk.add_constant(name.into()) as u8;
        chunk.write_opcode(OpCode::Constant, 1).with_operand(value);
        chunk.write_opcode(OpCode::DefineGlobal, 1).with_operand(global);
        chunk.write_opcode(OpCode::Jump, 2).with_short(1);
        chunk.write_opcode(OpCode::None, 2);
        chunk.write_opcode(OpCode::Return, 2);

        let mut listing = String::new();
        disassemble_chunk(&mut listing, &heap, &chunk, "test").unwrap();

        let expected = "\
== test ==
0000    1 Constant            0 '42'
0002    | DefineGlobal        1 'answer'
0004    2 Jump                4 -> 8
0007    | None
0008    | Return
";
        assert_eq!(expected, listing);
    }

    #[test]
    fn unknown_bytes_are_reported() {
        let heap = Heap::default();
        let mut chunk = Chunk::new();
        chunk.write_byte(0xff, 1);

        let mut listing = String::new();
        let next = disassemble_instruction(&mut listing, &heap, &chunk, 0).unwrap();
        assert_eq!(1, next);
        assert_eq!("0000    1 Unknown opcode 255\n", listing);
    }
}
