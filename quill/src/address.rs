//! Address: a 32-bit word split into a 2-bit space tag and a 30-bit offset.
//!
//! ```text
//!  31 30 29                                 0
//! ┌─────┬───────────────────────────────────┐
//! │ tag │              offset               │
//! └─────┴───────────────────────────────────┘
//!   00 = null, 01 = constant pool, 10 = mutable memory
//! ```
//!
//! Mutable offsets index the VM's backing memory: `0..stack_size` is the
//! stack region, `stack_size..` is the heap.

use core::fmt;

pub const ADDRESS_OFFSET_BITS: u32 = 30;
pub const MAX_ADDRESS_OFFSET: u32 = (1 << ADDRESS_OFFSET_BITS) - 1;

const CONST_TAG: u32 = 0b01;
const MUTABLE_TAG: u32 = 0b10;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Null = 0b00,
    Const = 0b01,
    Mutable = 0b10,
}

/// A tagged address into either the constant pool or mutable memory.
///
/// Offsets are guaranteed to fit in 30 bits: the only way to build a
/// non-null address is through [`Address::constant`] / [`Address::mutable`]
/// (or [`Address::from_raw`]), all of which reject larger offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Address {
    #[default]
    Null,
    Const(u32),
    Mutable(u32),
}

impl Address {
    pub const fn constant(offset: u32) -> Option<Self> {
        if offset > MAX_ADDRESS_OFFSET {
            return None;
        }
        Some(Self::Const(offset))
    }

    pub const fn mutable(offset: u32) -> Option<Self> {
        if offset > MAX_ADDRESS_OFFSET {
            return None;
        }
        Some(Self::Mutable(offset))
    }

    pub const fn space(self) -> Space {
        match self {
            Self::Null => Space::Null,
            Self::Const(_) => Space::Const,
            Self::Mutable(_) => Space::Mutable,
        }
    }

    /// Offset within the address space. Null addresses have offset 0.
    pub const fn offset(self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Const(offset) | Self::Mutable(offset) => offset,
        }
    }

    pub const fn is_null(self) -> bool {
        matches!(self, Self::Null)
    }

    /// Same space, offset moved by `delta` slots.
    ///
    /// Returns `None` for null addresses and when the result leaves the
    /// 30-bit range.
    pub fn offset_by(self, delta: u32) -> Option<Self> {
        let moved = self.offset().checked_add(delta)?;
        match self {
            Self::Null => None,
            Self::Const(_) => Self::constant(moved),
            Self::Mutable(_) => Self::mutable(moved),
        }
    }

    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Const(offset) => (CONST_TAG << ADDRESS_OFFSET_BITS) | offset,
            Self::Mutable(offset) => (MUTABLE_TAG << ADDRESS_OFFSET_BITS) | offset,
        }
    }

    /// Decode a raw address word. Tag `11` is not a valid space.
    ///
    /// A zero tag decodes to [`Address::Null`] whatever the offset bits hold.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        let offset = raw & MAX_ADDRESS_OFFSET;
        match raw >> ADDRESS_OFFSET_BITS {
            0b00 => Some(Self::Null),
            CONST_TAG => Some(Self::Const(offset)),
            MUTABLE_TAG => Some(Self::Mutable(offset)),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Const(offset) => write!(f, "c:{offset}"),
            Self::Mutable(offset) => write!(f, "m:{offset}"),
        }
    }
}
