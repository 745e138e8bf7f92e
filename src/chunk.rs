//! Contains a [Chunk] of [OpCode].

use crate::value::Value;
use crate::with_try_from_u8;

with_try_from_u8! {
    /// A one-byte operation code for Joker.
    ///
    /// Operands follow the opcode inline. Single-byte operands are constant or slot indices;
    /// two-byte operands (`u16`, big-endian) are jump distances or long constant indices.
    #[repr(u8)]
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum OpCode {
        /// `[index: u8]` pushes a constant.
        Constant,
        /// `[index: u16]` pushes a constant.
        ConstantLong,
        None,
        True,
        False,
        Pop,
        Dup,
        /// `[slot: u8]`
        GetLocal,
        /// `[slot: u8]`
        SetLocal,
        /// `[name: u8]`
        GetGlobal,
        /// `[name: u8]`
        DefineGlobal,
        /// `[name: u8]`
        SetGlobal,
        /// `[index: u8]`
        GetUpvalue,
        /// `[index: u8]`
        SetUpvalue,
        /// `[name: u8]`
        GetProperty,
        /// `[name: u8]`
        SetProperty,
        /// `[name: u8]`
        GetSuper,
        /// `[name: u8]` for `Type::name`.
        GetLayer,
        Equal,
        NotEqual,
        Greater,
        GreaterEqual,
        Less,
        LessEqual,
        Add,
        Subtract,
        Multiply,
        Divide,
        Modulo,
        BitAnd,
        BitOr,
        BitXor,
        ShiftLeft,
        ShiftRight,
        Not,
        Negate,
        BitNot,
        /// `[kind: u8]` converts the top of the stack to a numeric kind.
        Convert,
        /// `[distance: u16]`
        Jump,
        /// `[distance: u16]` pops nothing.
        JumpIfFalse,
        /// `[distance: u16]` pops the pattern and jumps if it differs from the value below it.
        JumpIfNotEqual,
        /// `[distance: u16]` jumps backwards.
        Loop,
        /// `[argc: u8]`
        Call,
        /// `[name: u8] [argc: u8]`
        Invoke,
        /// `[name: u8] [argc: u8]`
        SuperInvoke,
        /// `[name: u8] [argc: u8]` for `Type::name(args)`.
        LayerCall,
        /// `[function: u16]` followed by one descriptor byte per upvalue.
        Closure,
        CloseUpvalue,
        Return,
        /// `[name: u8]`
        Class,
        /// `[name: u8]`
        Method,
        Inherit,
        /// `[name: u8]`
        Struct,
        /// `[name: u8]`
        Member,
        StructInherit,
        /// `[name: u8]`
        Enum,
        /// `[name: u8] [arity: u8]`
        EnumMember,
        /// `[member: u8] [distance: u16]` pops the enum; jumps if the value below it is not that
        /// member.
        EnumMatch,
        /// `[count: u8]` pushes the payload of the enum instance on top of the stack.
        EnumBind,
        /// `[count: u8]`
        VecNew,
        IndexGet,
        IndexSet,
    }
}

/// Bit 7 of a closure descriptor byte: the upvalue captures a local of the enclosing function,
/// rather than one of its upvalues.
pub const UPVALUE_IS_LOCAL: u8 = 0x80;

/// A chunk of code, with metadata.
#[derive(Default, Debug)]
pub struct Chunk {
    code: Vec<u8>,
    pub constants: Vec<Value>,
    lines: Vec<LineNumberRun>,
}

/// An [OpCode] that has already been written to the bytestream.
///
/// This opcode can be augmented with operands.
pub struct WrittenOpcode<'a> {
    line: usize,
    provenance: &'a mut Chunk,
}

/// An entry of run-length encoded line numbers.
/// Every entry signifies that the next [length] bytes have the same line number
#[derive(Debug, Clone)]
struct LineNumberRun {
    /// The actual line number
    line_number: usize,
    /// How many consecutive bytes came from this line
    length: usize,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl Chunk {
    /// Return a new, empty [Chunk].
    pub fn new() -> Self {
        Chunk::default()
    }

    /// Append a single [OpCode] to the chunk.
    pub fn write_opcode(&mut self, opcode: OpCode, line: usize) -> WrittenOpcode {
        self.write(opcode as u8, line);

        WrittenOpcode {
            line,
            provenance: self,
        }
    }

    /// Append a raw byte, such as a closure descriptor.
    pub fn write_byte(&mut self, byte: u8, line: usize) {
        self.write(byte, line);
    }

    /// Adds a constant to the constant pool, and returns its index. Constants are not
    /// deduplicated; the caller decides whether the index fits its operand.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Returns the constant at `index`.
    ///
    /// # Panics
    ///
    /// Panics if the index was never handed out by [Chunk::add_constant].
    #[inline]
    pub fn constant(&self, index: usize) -> Value {
        self.constants[index]
    }

    /// Overwrites the two bytes at `offset` with a big-endian `u16`.
    pub fn patch_short(&mut self, offset: usize, value: u16) {
        let [high, low] = value.to_be_bytes();
        self.code[offset] = high;
        self.code[offset + 1] = low;
    }

    #[inline(always)]
    pub fn read_byte(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    /// Reads a big-endian `u16`.
    #[inline(always)]
    pub fn read_short(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    /// Decodes the byte at `offset` as an [OpCode].
    /// Returns `None` if it is out of range or not a valid opcode.
    #[inline]
    pub fn opcode_at(&self, offset: usize) -> Option<OpCode> {
        self.code.get(offset).and_then(|&b| OpCode::try_from(b).ok())
    }

    /// Returns the line number for whatever is at the given offset.
    pub fn line_number_for(&self, offset: usize) -> Option<usize> {
        let mut base_offset = 0;
        for run in self.lines.iter() {
            if (base_offset..base_offset + run.length).contains(&offset) {
                return Some(run.line_number);
            }

            base_offset += run.length;
        }

        None
    }

    /// Returns the length of the byte stream.
    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns true if nothing has been appended to the byte stream.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Actually writes to the byte stream.
    fn write(&mut self, payload: u8, line_number: usize) {
        self.code.push(payload);

        // Figure out the line number
        match self.lines.last_mut() {
            Some(run) if run.line_number == line_number => run.increment(),
            // Must create new run
            _ => self.lines.push(LineNumberRun::new(line_number)),
        }
    }
}

impl LineNumberRun {
    fn new(line_number: usize) -> Self {
        Self {
            line_number,
            length: 1,
        }
    }

    fn increment(&mut self) {
        self.length += 1;
    }
}

impl<'a> WrittenOpcode<'a> {
    /// Appends a one-byte operand to the last written instruction.
    #[inline]
    pub fn with_operand(self, operand: u8) -> Self {
        self.provenance.write(operand, self.line);
        self
    }

    /// Appends a big-endian two-byte operand to the last written instruction.
    #[inline]
    pub fn with_short(self, operand: u16) -> Self {
        let [high, low] = operand.to_be_bytes();
        self.with_operand(high).with_operand(low)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boring_test_of_chunk() {
        let c = Chunk::default();
        assert_eq!(0, c.code.len());
    }

    #[test]
    fn mess_around_with_bytecode() {
        let mut c = Chunk::new();
        let i = c.add_constant(Value::F64(1.0));
        c.write_opcode(OpCode::Constant, 123).with_operand(i as u8);
        c.write_opcode(OpCode::Return, 123);

        assert_eq!(3, c.len());

        // Constant
        assert_eq!(Some(OpCode::Constant), c.opcode_at(0));
        assert_eq!(0, c.read_byte(1));
        assert_eq!(Value::F64(1.0), c.constant(c.read_byte(1) as usize));

        // Return
        assert_eq!(Some(OpCode::Return), c.opcode_at(2));
        assert_eq!(None, c.opcode_at(3));
    }

    #[test]
    fn short_operands_are_big_endian() {
        let mut c = Chunk::new();
        c.write_opcode(OpCode::Jump, 1).with_short(0xffff);
        c.patch_short(1, 0x1234);
        assert_eq!(0x12, c.read_byte(1));
        assert_eq!(0x34, c.read_byte(2));
        assert_eq!(0x1234, c.read_short(1));
    }

    #[test]
    fn operands_chain() {
        let mut c = Chunk::new();
        c.write_opcode(OpCode::EnumMatch, 7)
            .with_operand(3)
            .with_short(258);
        assert_eq!(4, c.len());
        assert_eq!(3, c.read_byte(1));
        assert_eq!(258, c.read_short(2));
        assert_eq!(Some(7), c.line_number_for(3));
    }

    #[test]
    fn every_opcode_round_trips_through_its_byte() {
        for byte in 0..OpCode::COUNT as u8 {
            let opcode = OpCode::try_from(byte).unwrap();
            assert_eq!(byte, opcode as u8);
        }
        assert!(OpCode::try_from(OpCode::COUNT as u8).is_err());
        assert_eq!("ConstantLong", OpCode::ConstantLong.name());
    }

    #[test]
    fn line_numbers() {
        let mut c = Chunk::new();

        let idx = c.add_constant(Value::F64(1.2)) as u8;

        // Write a bunch of opcodes on the same line.
        c.write_opcode(OpCode::Constant, 1).with_operand(idx);
        c.write_opcode(OpCode::Constant, 1).with_operand(idx);
        c.write_opcode(OpCode::Constant, 1).with_operand(idx);
        assert_eq!(6, c.len());

        // Write a bunch of opcodes on a different line.
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        c.write_opcode(OpCode::Constant, 2).with_operand(idx);
        assert_eq!(14, c.len());

        // Write an opcode on yet a different line
        c.write_opcode(OpCode::Return, 4);
        assert_eq!(15, c.len());

        // Check line numbers.
        assert_eq!(Some(1), c.line_number_for(2));
        assert_eq!(Some(2), c.line_number_for(10));
        assert_eq!(Some(4), c.line_number_for(c.len() - 1));
        assert_eq!(None, c.line_number_for(c.len()));
    }
}
