//! Linked programs and their in-memory blob encoding.

use core::fmt;

use crate::bytecode::{BytecodeDecoder, DecodeError, Instruction, Op, OperandKind};
use crate::value::Value;

/// Longest import or export name a blob can carry.
pub const MAX_NAME_LENGTH: usize = u16::MAX as usize;

/// A native function the program expects the host to supply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub name: String,
    pub arity: u8,
}

/// A script function callable from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub arity: u8,
    /// Byte offset of the function's `MAKE_FRAME`.
    pub address: u32,
}

/// An executable program. Instruction operands refer to the constant pool
/// and import table by position, so the parts only travel together.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
    /// Address of `main`'s frame instruction, when the script declares one.
    pub entry: Option<u32>,
}

impl Program {
    pub fn find_export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|export| export.name == name)
    }

    pub fn find_import(&self, name: &str) -> Option<usize> {
        self.imports.iter().position(|import| import.name == name)
    }

    pub fn instructions(&self) -> BytecodeDecoder<'_> {
        BytecodeDecoder::new(&self.code)
    }

    /// Whether `address` is the first byte of some instruction.
    pub fn is_instruction_boundary(&self, address: u32) -> bool {
        self.instructions()
            .map_while(Result::ok)
            .any(|instruction| instruction.offset == address)
    }

    fn write_instruction(&self, f: &mut fmt::Formatter<'_>, ins: &Instruction) -> fmt::Result {
        let mut operands = String::new();
        for (kind, value) in ins.op.operands().iter().zip(ins.operands) {
            let rendered = match kind {
                OperandKind::Constant => match self.constants.get(value as usize) {
                    Some(constant) => format!("#{value} ({constant})"),
                    None => format!("#{value} (?)"),
                },
                OperandKind::Address => format!("@{value}"),
                OperandKind::Numeric if ins.op == Op::CallNative => {
                    match self.imports.get(value as usize) {
                        Some(import) => format!("{value} ({})", import.name),
                        None => format!("{value} (?)"),
                    }
                }
                OperandKind::Numeric => value.to_string(),
            };
            if !operands.is_empty() {
                operands.push(' ');
            }
            operands.push_str(&rendered);
        }
        writeln!(f, "#{:5}| {:<22} {}", ins.offset, ins.op.name(), operands)
    }
}

/// Disassembly listing followed by the constant, import and export tables.
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "code ({} bytes):", self.code.len())?;
        for decoded in self.instructions() {
            match decoded {
                Ok(ins) => self.write_instruction(f, &ins)?,
                Err(err) => writeln!(f, "  <{err}>")?,
            }
        }
        writeln!(f, "constants ({}):", self.constants.len())?;
        for (i, constant) in self.constants.iter().enumerate() {
            writeln!(f, "  #{i:<4} {constant}")?;
        }
        if !self.imports.is_empty() {
            writeln!(f, "imports:")?;
            for (i, import) in self.imports.iter().enumerate() {
                writeln!(f, "  {i:<4} {}/{}", import.name, import.arity)?;
            }
        }
        if !self.exports.is_empty() {
            writeln!(f, "exports:")?;
            for export in &self.exports {
                writeln!(f, "  @{:<5} {}/{}", export.address, export.name, export.arity)?;
            }
        }
        Ok(())
    }
}

// ── Blob encoding ─────────────────────────────────────────────────────

const MAGIC: &[u8; 4] = b"QUIL";
const VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    BadMagic,
    UnsupportedVersion(u16),
    Truncated,
    BadConstant { index: usize, bits: u64 },
    BadName,
    NameTooLong(usize),
    TrailingBytes(usize),
    Code(DecodeError),
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not a program blob"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported blob version {v}"),
            Self::Truncated => write!(f, "program blob is truncated"),
            Self::BadConstant { index, bits } => {
                write!(f, "constant #{index} has invalid encoding 0x{bits:016x}")
            }
            Self::BadName => write!(f, "symbol name is not valid utf-8"),
            Self::NameTooLong(len) => {
                write!(f, "symbol name of {len} bytes does not fit a blob")
            }
            Self::TrailingBytes(n) => write!(f, "{n} unexpected bytes after program"),
            Self::Code(err) => write!(f, "malformed code: {err}"),
        }
    }
}

impl std::error::Error for ProgramError {}

impl From<DecodeError> for ProgramError {
    fn from(err: DecodeError) -> Self {
        Self::Code(err)
    }
}

struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn name(&mut self, name: &str) -> Result<(), ProgramError> {
        let len = u16::try_from(name.len()).map_err(|_| ProgramError::NameTooLong(name.len()))?;
        self.u16(len);
        self.0.extend_from_slice(name.as_bytes());
        Ok(())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ProgramError> {
        let end = self.pos.checked_add(n).ok_or(ProgramError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(ProgramError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProgramError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProgramError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ProgramError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProgramError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ProgramError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn name(&mut self) -> Result<String, ProgramError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProgramError::BadName)
    }
}

impl Program {
    /// Serialize into a single byte blob.
    ///
    /// Constants use the packed 64-bit value layout. Names longer than
    /// [`MAX_NAME_LENGTH`] bytes are rejected.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProgramError> {
        let mut w = Writer(Vec::with_capacity(16 + self.code.len() + self.constants.len() * 8));
        w.0.extend_from_slice(MAGIC);
        w.u16(VERSION);

        w.u32(self.constants.len() as u32);
        for constant in &self.constants {
            w.u64(constant.to_bits());
        }

        w.u32(self.code.len() as u32);
        w.0.extend_from_slice(&self.code);

        w.u32(self.imports.len() as u32);
        for import in &self.imports {
            w.name(&import.name)?;
            w.u8(import.arity);
        }

        w.u32(self.exports.len() as u32);
        for export in &self.exports {
            w.name(&export.name)?;
            w.u8(export.arity);
            w.u32(export.address);
        }

        match self.entry {
            Some(entry) => {
                w.u8(1);
                w.u32(entry);
            }
            None => w.u8(0),
        }
        Ok(w.0)
    }

    /// Parse a blob produced by [`Program::to_bytes`]. The instruction
    /// stream is decoded once to reject malformed code up front.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProgramError> {
        let mut r = Reader { bytes, pos: 0 };
        if r.take(MAGIC.len())? != MAGIC {
            return Err(ProgramError::BadMagic);
        }
        let version = r.u16()?;
        if version != VERSION {
            return Err(ProgramError::UnsupportedVersion(version));
        }

        let count = r.u32()? as usize;
        let mut constants = Vec::with_capacity(count.min(bytes.len() / 8));
        for index in 0..count {
            let bits = r.u64()?;
            let value = Value::from_bits(bits).ok_or(ProgramError::BadConstant { index, bits })?;
            constants.push(value);
        }

        let len = r.u32()? as usize;
        let code = r.take(len)?.to_vec();

        let count = r.u32()? as usize;
        let mut imports = Vec::new();
        for _ in 0..count {
            let name = r.name()?;
            let arity = r.u8()?;
            imports.push(Import { name, arity });
        }

        let count = r.u32()? as usize;
        let mut exports = Vec::new();
        for _ in 0..count {
            let name = r.name()?;
            let arity = r.u8()?;
            let address = r.u32()?;
            exports.push(Export {
                name,
                arity,
                address,
            });
        }

        let entry = match r.u8()? {
            0 => None,
            _ => Some(r.u32()?),
        };

        if r.pos != bytes.len() {
            return Err(ProgramError::TrailingBytes(bytes.len() - r.pos));
        }

        for decoded in BytecodeDecoder::new(&code) {
            decoded?;
        }

        Ok(Self {
            code,
            constants,
            imports,
            exports,
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::value::Array;

    fn sample() -> Program {
        let mut code = vec![Op::EntryPoint as u8];
        code.extend_from_slice(&5u32.to_le_bytes());
        code.push(Op::MakeFrame as u8);
        code.extend_from_slice(&0u32.to_le_bytes());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(Op::PushValue as u8);
        code.extend_from_slice(&1u32.to_le_bytes());
        code.push(Op::CallNative as u8);
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(Op::ReturnValue as u8);
        Program {
            code,
            constants: vec![
                Value::Char('h'),
                Value::Array(Array::new(Address::Const(0), 1)),
            ],
            imports: vec![Import {
                name: "print_line".into(),
                arity: 1,
            }],
            exports: vec![Export {
                name: "main".into(),
                arity: 0,
                address: 5,
            }],
            entry: Some(5),
        }
    }

    #[test]
    fn blob_preserves_every_section() {
        let program = sample();
        let decoded = Program::from_bytes(&program.to_bytes().unwrap()).expect("valid blob");
        assert_eq!(decoded, program);
    }

    #[test]
    fn blob_rejects_garbage() {
        assert_eq!(Program::from_bytes(b"NOPE"), Err(ProgramError::BadMagic));
        let mut bytes = sample().to_bytes().unwrap();
        bytes.truncate(bytes.len() - 2);
        assert_eq!(Program::from_bytes(&bytes), Err(ProgramError::Truncated));
    }

    #[test]
    fn blob_rejects_malformed_code() {
        let mut program = sample();
        program.code.push(0xEE);
        let err = Program::from_bytes(&program.to_bytes().unwrap()).unwrap_err();
        assert!(
            matches!(err, ProgramError::Code(DecodeError::UnknownOpcode { byte: 0xEE, .. })),
            "got {err:?}"
        );
    }

    #[test]
    fn oversized_names_are_not_encoded() {
        let mut program = sample();
        program.exports[0].name = "x".repeat(MAX_NAME_LENGTH + 1);
        assert_eq!(
            program.to_bytes(),
            Err(ProgramError::NameTooLong(MAX_NAME_LENGTH + 1))
        );

        program.exports[0].name = "x".repeat(MAX_NAME_LENGTH);
        let decoded = Program::from_bytes(&program.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.exports[0].name.len(), MAX_NAME_LENGTH);
    }

    #[test]
    fn disassembly_annotates_operands() {
        let listing = sample().to_string();
        assert!(listing.contains("#    0| ENTRY_POINT"), "{listing}");
        assert!(listing.contains("@5"), "{listing}");
        assert!(listing.contains("MAKE_FRAME             0 0"), "{listing}");
        assert!(listing.contains("CALL_NATIVE            0 (print_line)"), "{listing}");
        assert!(listing.contains("main/0"), "{listing}");
    }

    #[test]
    fn boundaries_follow_encoded_lengths() {
        let program = sample();
        assert!(program.is_instruction_boundary(0));
        assert!(program.is_instruction_boundary(5));
        assert!(!program.is_instruction_boundary(6));
        assert!(program.is_instruction_boundary(14));
    }
}
