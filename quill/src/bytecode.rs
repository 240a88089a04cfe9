//! Instruction set.
//!
//! Every instruction is one opcode byte followed by zero, one or two
//! little-endian `u32` operands. The number and kind of operands is fixed
//! per opcode (see [`Op::operands`]); tooling relies on that table to walk
//! the stream without executing it.

use core::fmt;

/// How an operand is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Index into the constant pool.
    Constant,
    /// Byte offset into the instruction stream. Rewritten by the linker.
    Address,
    /// Raw immediate (counts, local slots, exit codes, import indices).
    Numeric,
}

pub const OPERAND_SIZE: usize = 4;

/// Bytecode opcodes. The discriminant is the encoded byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Stop execution with a halt error.
    Halt = 0x00,
    /// Pop `a`, `b`; push `a && b`.
    And,
    /// Pop `a`, `b`; push `a || b`.
    Or,
    /// Pop `a`; push `!a`.
    Not,
    Mul,
    Div,
    /// Integer remainder of the truncated operands.
    Mod,
    Add,
    Sub,
    Neg,
    /// Duplicate the top value.
    Dup1,
    /// Duplicate the top two values, keeping their order.
    Dup2,
    /// Swap the top two values.
    Rot2,
    CmpEqual,
    CmpNotEqual,
    CmpLessThan,
    CmpMoreThan,
    CmpLessThanOrEqual,
    CmpMoreThanOrEqual,
    /// Push a constant.
    /// Operands: `const`
    PushValue,
    Pop1,
    Pop2,
    /// Operands: `address`
    Jump,
    /// Pop a bool, jump when it is false.
    /// Operands: `address`
    JumpIfFalse,
    /// Stop execution, returning the operand as a number.
    /// Operands: `code`
    Exit,
    /// Push the return pc and jump to a function's `MakeFrame`.
    /// Operands: `address`
    Call,
    /// Jump to the default entry. Pushes the host return sentinel when the
    /// target is a `MakeFrame`.
    /// Operands: `address`
    EntryPoint,
    /// Operands: `num_args`, `num_locals`
    MakeFrame,
    ReturnNothing,
    ReturnValue,
    /// Operands: `local`
    StoreLocal,
    /// Operands: `local`
    LoadLocal,
    /// Pop a value and write it to the VM output.
    Print,
    /// Pop a count, then that many values, and push a new heap array.
    MakeArray,
    ArrayLength,
    MakeIter,
    /// Push the next element, or pop the exhausted iterator and jump.
    /// Operands: `exit address`
    IterNext,
    /// Operands: `import index`
    CallNative,
}

use OperandKind::{Address as A, Constant as C, Numeric as N};

impl Op {
    pub const COUNT: usize = Op::CallNative as usize + 1;

    pub const ALL: [Op; Op::COUNT] = [
        Op::Halt,
        Op::And,
        Op::Or,
        Op::Not,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::Add,
        Op::Sub,
        Op::Neg,
        Op::Dup1,
        Op::Dup2,
        Op::Rot2,
        Op::CmpEqual,
        Op::CmpNotEqual,
        Op::CmpLessThan,
        Op::CmpMoreThan,
        Op::CmpLessThanOrEqual,
        Op::CmpMoreThanOrEqual,
        Op::PushValue,
        Op::Pop1,
        Op::Pop2,
        Op::Jump,
        Op::JumpIfFalse,
        Op::Exit,
        Op::Call,
        Op::EntryPoint,
        Op::MakeFrame,
        Op::ReturnNothing,
        Op::ReturnValue,
        Op::StoreLocal,
        Op::LoadLocal,
        Op::Print,
        Op::MakeArray,
        Op::ArrayLength,
        Op::MakeIter,
        Op::IterNext,
        Op::CallNative,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Op::Halt => "HALT",
            Op::And => "AND",
            Op::Or => "OR",
            Op::Not => "NOT",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Mod => "MOD",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Neg => "NEG",
            Op::Dup1 => "DUP_1",
            Op::Dup2 => "DUP_2",
            Op::Rot2 => "ROT_2",
            Op::CmpEqual => "CMP_EQUAL",
            Op::CmpNotEqual => "CMP_NOT_EQUAL",
            Op::CmpLessThan => "CMP_LESS_THAN",
            Op::CmpMoreThan => "CMP_MORE_THAN",
            Op::CmpLessThanOrEqual => "CMP_LESS_THAN_OR_EQUAL",
            Op::CmpMoreThanOrEqual => "CMP_MORE_THAN_OR_EQUAL",
            Op::PushValue => "PUSH_VALUE",
            Op::Pop1 => "POP_1",
            Op::Pop2 => "POP_2",
            Op::Jump => "JUMP",
            Op::JumpIfFalse => "JUMP_IF_FALSE",
            Op::Exit => "EXIT",
            Op::Call => "CALL",
            Op::EntryPoint => "ENTRY_POINT",
            Op::MakeFrame => "MAKE_FRAME",
            Op::ReturnNothing => "RETURN_NOTHING",
            Op::ReturnValue => "RETURN_VALUE",
            Op::StoreLocal => "STORE_LOCAL",
            Op::LoadLocal => "LOAD_LOCAL",
            Op::Print => "PRINT",
            Op::MakeArray => "MAKE_ARRAY",
            Op::ArrayLength => "ARRAY_LENGTH",
            Op::MakeIter => "MAKE_ITER",
            Op::IterNext => "ITER_NEXT",
            Op::CallNative => "CALL_NATIVE",
        }
    }

    /// Operand kinds, in encoding order.
    pub const fn operands(self) -> &'static [OperandKind] {
        match self {
            Op::PushValue => &[C],
            Op::Jump | Op::JumpIfFalse | Op::Call | Op::EntryPoint | Op::IterNext => &[A],
            Op::Exit | Op::StoreLocal | Op::LoadLocal | Op::CallNative => &[N],
            Op::MakeFrame => &[N, N],
            _ => &[],
        }
    }

    pub const fn operand_count(self) -> usize {
        self.operands().len()
    }

    /// Encoded size in bytes, opcode included.
    pub const fn encoded_len(self) -> usize {
        1 + self.operand_count() * OPERAND_SIZE
    }

    /// Whether the first operand is an instruction address.
    pub const fn has_address_operand(self) -> bool {
        matches!(self.operands().first(), Some(OperandKind::Address))
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Op::ALL.get(byte as usize).copied().ok_or(byte)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[inline(always)]
pub fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + OPERAND_SIZE)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

// ── Decoding ──────────────────────────────────────────────────────────

/// A decoded instruction together with its byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: u32,
    pub op: Op,
    pub operands: [u32; 2],
}

impl Instruction {
    pub fn operand(&self, index: usize) -> u32 {
        self.operands[index]
    }

    /// Offset of the instruction that follows this one.
    pub fn next_offset(&self) -> u32 {
        self.offset + self.op.encoded_len() as u32
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.name())?;
        for (kind, value) in self.op.operands().iter().zip(self.operands) {
            match kind {
                OperandKind::Constant => write!(f, " #{value}")?,
                OperandKind::Address => write!(f, " @{value}")?,
                OperandKind::Numeric => write!(f, " {value}")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOpcode { offset: usize, byte: u8 },
    Truncated { offset: usize, op: Op },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { offset, byte } => {
                write!(f, "unknown opcode 0x{byte:02x} at {offset}")
            }
            Self::Truncated { offset, op } => {
                write!(f, "{op} at {offset} is missing operand bytes")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Walks an instruction stream one instruction at a time.
///
/// Unlike the interpreter this never trusts the stream: malformed input
/// yields a [`DecodeError`] and ends the iteration.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            failed: false,
        }
    }

    /// Current byte offset in the stream.
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the instruction at `offset`.
    pub fn decode_at(bytes: &[u8], offset: usize) -> Result<Instruction, DecodeError> {
        let byte = *bytes.get(offset).ok_or(DecodeError::UnknownOpcode {
            offset,
            byte: 0,
        })?;
        let op = Op::try_from(byte).map_err(|byte| DecodeError::UnknownOpcode { offset, byte })?;
        let mut operands = [0u32; 2];
        for (i, slot) in operands.iter_mut().take(op.operand_count()).enumerate() {
            *slot = read_u32(bytes, offset + 1 + i * OPERAND_SIZE)
                .ok_or(DecodeError::Truncated { offset, op })?;
        }
        Ok(Instruction {
            offset: offset as u32,
            op,
            operands,
        })
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.is_at_end() {
            return None;
        }
        match Self::decode_at(self.bytes, self.pos) {
            Ok(instruction) => {
                self.pos = instruction.next_offset() as usize;
                Some(Ok(instruction))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_discriminants() {
        for (i, op) in Op::ALL.iter().enumerate() {
            assert_eq!(*op as usize, i, "{op} is out of place");
            assert_eq!(Op::try_from(i as u8), Ok(*op));
        }
        assert_eq!(Op::try_from(Op::COUNT as u8), Err(Op::COUNT as u8));
    }

    #[test]
    fn operand_kinds_are_fixed_per_opcode() {
        assert_eq!(Op::PushValue.operands(), &[OperandKind::Constant]);
        assert_eq!(
            Op::MakeFrame.operands(),
            &[OperandKind::Numeric, OperandKind::Numeric]
        );
        assert_eq!(Op::CallNative.operands(), &[OperandKind::Numeric]);
        assert_eq!(Op::Add.operand_count(), 0);
        assert_eq!(Op::MakeFrame.encoded_len(), 9);
        assert!(Op::IterNext.has_address_operand());
        assert!(!Op::Exit.has_address_operand());
    }

    #[test]
    fn decoder_walks_mixed_widths() {
        let mut bytes = vec![Op::PushValue as u8];
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.push(Op::MakeFrame as u8);
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.push(Op::ReturnValue as u8);

        let decoded: Vec<_> = BytecodeDecoder::new(&bytes)
            .collect::<Result<_, _>>()
            .expect("well formed");
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].to_string(), "PUSH_VALUE #7");
        assert_eq!(decoded[1].offset, 5);
        assert_eq!(decoded[1].operands, [2, 3]);
        assert_eq!(decoded[2].offset, 14);
    }

    #[test]
    fn decoder_reports_truncation_and_stops() {
        let bytes = [Op::Jump as u8, 1, 0];
        let mut decoder = BytecodeDecoder::new(&bytes);
        assert_eq!(
            decoder.next(),
            Some(Err(DecodeError::Truncated {
                offset: 0,
                op: Op::Jump
            }))
        );
        assert_eq!(decoder.next(), None);
    }

    #[test]
    fn decoder_rejects_unknown_bytes() {
        let bytes = [0xEE];
        let err = BytecodeDecoder::decode_at(&bytes, 0).unwrap_err();
        assert_eq!(err, DecodeError::UnknownOpcode { offset: 0, byte: 0xEE });
    }
}
