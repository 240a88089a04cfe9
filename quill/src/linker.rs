//! Index-space instruction list and the linking pass.
//!
//! Code generation works on instruction *indices*: an address operand holds
//! the index of the instruction it targets. Once every instruction exists,
//! [`CodeBuilder::link`] computes the byte offset of each instruction and
//! rewrites address operands to those offsets while serializing.

use core::fmt;

use crate::bytecode::Op;

/// Position of an instruction in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrIndex(pub u32);

/// A placeholder operand waiting for its target.
///
/// Created by [`CodeBuilder::emit_forward`]; resolve it with
/// [`CodeBuilder::bind`].
#[derive(Debug)]
#[must_use = "an unbound fixup leaves a jump to instruction 0"]
pub struct Fixup {
    at: InstrIndex,
}

impl Fixup {
    pub fn index(&self) -> InstrIndex {
        self.at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrInstruction {
    pub op: Op,
    pub operands: [u32; 2],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    OutOfMemory,
    /// An address operand names an instruction that does not exist.
    TargetOutOfRange { at: u32, target: u32 },
    /// The encoded program does not fit 32-bit addresses.
    TooLarge,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory while growing the instruction list"),
            Self::TargetOutOfRange { at, target } => {
                write!(f, "instruction {at} targets missing instruction {target}")
            }
            Self::TooLarge => write!(f, "program exceeds the 32-bit address range"),
        }
    }
}

impl std::error::Error for LinkError {}

/// Result of linking: the byte stream plus the byte offset of every
/// instruction index (one extra entry for the end of the stream).
#[derive(Debug)]
pub struct Linked {
    pub code: Vec<u8>,
    pub addresses: Vec<u32>,
}

impl Linked {
    pub fn address_of(&self, index: InstrIndex) -> Option<u32> {
        self.addresses.get(index.0 as usize).copied()
    }
}

#[derive(Debug, Default)]
pub struct CodeBuilder {
    instructions: Vec<IrInstruction>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next emitted instruction will get.
    pub fn next_index(&self) -> InstrIndex {
        InstrIndex(self.instructions.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, index: InstrIndex) -> Option<&IrInstruction> {
        self.instructions.get(index.0 as usize)
    }

    pub fn emit(&mut self, op: Op, operands: [u32; 2]) -> Result<InstrIndex, LinkError> {
        let index = self.next_index();
        self.instructions
            .try_reserve(1)
            .map_err(|_| LinkError::OutOfMemory)?;
        self.instructions.push(IrInstruction { op, operands });
        log::trace!("emit {:4} {} {:?}", index.0, op, &operands[..op.operand_count()]);
        Ok(index)
    }

    pub fn emit_op(&mut self, op: Op) -> Result<InstrIndex, LinkError> {
        self.emit(op, [0, 0])
    }

    pub fn emit_arg(&mut self, op: Op, arg: u32) -> Result<InstrIndex, LinkError> {
        self.emit(op, [arg, 0])
    }

    /// Emit `op` with a placeholder first operand.
    pub fn emit_forward(&mut self, op: Op) -> Result<Fixup, LinkError> {
        let at = self.emit(op, [0, 0])?;
        Ok(Fixup { at })
    }

    /// Point `fixup` at the next instruction to be emitted.
    pub fn bind(&mut self, fixup: Fixup) {
        let target = self.next_index();
        self.bind_to(fixup, target);
    }

    pub fn bind_to(&mut self, fixup: Fixup, target: InstrIndex) {
        self.patch(fixup.at, 0, target.0);
    }

    /// Overwrite one operand of an already emitted instruction.
    pub fn patch(&mut self, at: InstrIndex, slot: usize, value: u32) {
        if let Some(instruction) = self.instructions.get_mut(at.0 as usize) {
            instruction.operands[slot] = value;
        }
    }

    /// Swap an emitted instruction for another one. The encoded length may
    /// change; that is fine until [`link`](Self::link) runs.
    pub fn replace(&mut self, at: InstrIndex, op: Op, operands: [u32; 2]) {
        if let Some(instruction) = self.instructions.get_mut(at.0 as usize) {
            *instruction = IrInstruction { op, operands };
        }
    }

    /// Lay out the instructions and rewrite address operands from
    /// instruction indices to byte offsets. Consumes the builder, so the
    /// rewrite happens exactly once.
    pub fn link(self) -> Result<Linked, LinkError> {
        let mut addresses = Vec::new();
        addresses
            .try_reserve_exact(self.instructions.len() + 1)
            .map_err(|_| LinkError::OutOfMemory)?;

        let mut offset: u64 = 0;
        for instruction in &self.instructions {
            addresses.push(offset as u32);
            offset += instruction.op.encoded_len() as u64;
            if offset > u32::MAX as u64 {
                return Err(LinkError::TooLarge);
            }
        }
        addresses.push(offset as u32);

        let mut code = Vec::new();
        code.try_reserve_exact(offset as usize)
            .map_err(|_| LinkError::OutOfMemory)?;

        for (at, instruction) in self.instructions.iter().enumerate() {
            let mut operands = instruction.operands;
            if instruction.op.has_address_operand() {
                let target = operands[0];
                operands[0] = *addresses.get(target as usize).ok_or(
                    LinkError::TargetOutOfRange {
                        at: at as u32,
                        target,
                    },
                )?;
            }
            code.push(instruction.op as u8);
            for operand in &operands[..instruction.op.operand_count()] {
                code.extend_from_slice(&operand.to_le_bytes());
            }
        }

        debug_assert_eq!(code.len() as u64, offset);
        log::debug!(
            "linked {} instructions into {} bytes",
            self.instructions.len(),
            code.len()
        );
        Ok(Linked { code, addresses })
    }
}
