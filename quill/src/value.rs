//! Runtime values.
//!
//! Every value is a small `Copy` tagged union. Arrays, frames and iterators
//! only describe memory; they never own it.
//!
//! The packed form (see [`Value::to_bits`]) is what the program blob stores:
//!
//! ```text
//!  63  60 59        40 39       32 31                    0
//! ┌──────┬────────────┬───────────┬───────────────────────┐
//! │ type │   (payload high bits)  │  payload low 32 bits  │
//! └──────┴────────────┴───────────┴───────────────────────┘
//! ```

use core::fmt;

use crate::address::Address;

/// Largest length an [`Array`] or [`Iter`] can describe (24 bits).
pub const MAX_ARRAY_LENGTH: u32 = 0x00FF_FFFF;

const TYPE_SHIFT: u32 = 60;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    None = 0,
    Number = 1,
    // 2 is reserved
    Bool = 3,
    Char = 4,
    Array = 5,
    Frame = 6,
    Iter = 7,
}

impl ValueType {
    fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::None,
            1 => Self::Number,
            3 => Self::Bool,
            4 => Self::Char,
            5 => Self::Array,
            6 => Self::Frame,
            7 => Self::Iter,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Char => "char",
            Self::Array => "array",
            Self::Frame => "frame",
            Self::Iter => "iterator",
        }
    }
}

/// A contiguous run of slots in the constant pool or in mutable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Array {
    pub address: Address,
    pub length: u32,
}

impl Array {
    pub const EMPTY: Self = Self {
        address: Address::Null,
        length: 0,
    };

    pub fn new(address: Address, length: u32) -> Self {
        Self { address, length }
    }
}

/// Frame marker stored inline in the stack at a call's base slot.
///
/// A negative `return_pc` marks the outermost call: returning from it
/// hands control back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub return_pc: i32,
    pub num_args: u8,
    pub num_locals: u8,
}

impl Frame {
    pub fn returns_to_host(&self) -> bool {
        self.return_pc < 0
    }

    /// Slots reserved above the marker for arguments and locals.
    pub fn reserved(&self) -> usize {
        self.num_args as usize + self.num_locals as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iter {
    pub current: Address,
    pub remaining: u32,
}

impl From<Array> for Iter {
    fn from(array: Array) -> Self {
        Self {
            current: array.address,
            remaining: array.length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Number(f32),
    Bool(bool),
    Char(char),
    Array(Array),
    Frame(Frame),
    Iter(Iter),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::None => ValueType::None,
            Self::Number(_) => ValueType::Number,
            Self::Bool(_) => ValueType::Bool,
            Self::Char(_) => ValueType::Char,
            Self::Array(_) => ValueType::Array,
            Self::Frame(_) => ValueType::Frame,
            Self::Iter(_) => ValueType::Iter,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    pub fn as_number(&self) -> Option<f32> {
        match *self {
            Self::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_char(&self) -> Option<char> {
        match *self {
            Self::Char(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<Array> {
        match *self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_frame(&self) -> Option<Frame> {
        match *self {
            Self::Frame(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_iter(&self) -> Option<Iter> {
        match *self {
            Self::Iter(i) => Some(i),
            _ => None,
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, Self::Frame(_))
    }

    /// Pack into the 64-bit layout used by the program blob.
    pub fn to_bits(&self) -> u64 {
        let tag = (self.value_type() as u64) << TYPE_SHIFT;
        let payload = match *self {
            Self::None => 0,
            Self::Number(n) => n.to_bits() as u64,
            Self::Bool(b) => {
                if b {
                    0xFF
                } else {
                    0x00
                }
            }
            Self::Char(c) => c as u64,
            Self::Array(a) => pack_span(a.address, a.length),
            Self::Iter(i) => pack_span(i.current, i.remaining),
            Self::Frame(f) => {
                ((f.num_args as u64) << 40)
                    | ((f.num_locals as u64) << 32)
                    | (f.return_pc as u32 as u64)
            }
        };
        tag | payload
    }

    /// Unpack a 64-bit word. Fails on unknown type ids, invalid address
    /// tags and code points that are not valid `char`s.
    pub fn from_bits(bits: u64) -> Option<Self> {
        let ty = ValueType::from_id((bits >> TYPE_SHIFT) as u8)?;
        let low = bits as u32;
        Some(match ty {
            ValueType::None => Self::None,
            ValueType::Number => Self::Number(f32::from_bits(low)),
            ValueType::Bool => Self::Bool((bits & 0xFF) > 0x80),
            ValueType::Char => Self::Char(char::from_u32(low)?),
            ValueType::Array => {
                let (address, length) = unpack_span(bits)?;
                Self::Array(Array { address, length })
            }
            ValueType::Iter => {
                let (current, remaining) = unpack_span(bits)?;
                Self::Iter(Iter { current, remaining })
            }
            ValueType::Frame => Self::Frame(Frame {
                return_pc: low as i32,
                num_args: (bits >> 40) as u8,
                num_locals: (bits >> 32) as u8,
            }),
        })
    }
}

fn pack_span(address: Address, length: u32) -> u64 {
    (((length & MAX_ARRAY_LENGTH) as u64) << 32) | address.to_raw() as u64
}

fn unpack_span(bits: u64) -> Option<(Address, u32)> {
    let address = Address::from_raw(bits as u32)?;
    let length = ((bits >> 32) as u32) & MAX_ARRAY_LENGTH;
    Some((address, length))
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Self::Char(c)
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Self::Array(a)
    }
}

/// Shallow rendering. Arrays print as descriptors; resolving their
/// contents needs memory, see `VM::render`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Char(c) => write!(f, "'{c}'"),
            Self::Array(a) => write!(f, "[{} x{}]", a.address, a.length),
            Self::Frame(fr) => write!(
                f,
                "<pc: {}, nargs: {}, nlocals: {}>",
                fr.return_pc, fr.num_args, fr.num_locals
            ),
            Self::Iter(i) => write!(f, "{{curr: {}, rem: {}}}", i.current, i.remaining),
        }
    }
}
