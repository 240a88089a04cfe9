//! Read-only view over both address spaces.
//!
//! Arrays may live in the constant pool (string literals) or on the heap
//! (everything built at runtime); code that only needs to look at values
//! goes through [`Memory`] and does not care which.

use crate::address::Address;
use crate::heap::Heap;
use crate::value::{Array, Value};

/// Nested arrays deeper than this render as `[...]`.
const MAX_RENDER_DEPTH: usize = 16;

#[derive(Clone, Copy)]
pub struct Memory<'a> {
    constants: &'a [Value],
    heap: &'a Heap,
}

impl<'a> Memory<'a> {
    pub fn new(constants: &'a [Value], heap: &'a Heap) -> Self {
        Self { constants, heap }
    }

    pub fn constants(&self) -> &'a [Value] {
        self.constants
    }

    pub fn heap(&self) -> &'a Heap {
        self.heap
    }

    /// Elements of `array`, wherever they live.
    pub fn resolve(&self, array: Array) -> Option<&'a [Value]> {
        if array.length == 0 {
            return Some(&[]);
        }
        match array.address {
            Address::Const(start) => {
                let start = start as usize;
                self.constants.get(start..start + array.length as usize)
            }
            Address::Mutable(_) => self.heap.slots(array),
            Address::Null => None,
        }
    }

    pub fn read(&self, address: Address) -> Option<Value> {
        match address {
            Address::Const(index) => self.constants.get(index as usize).copied(),
            Address::Mutable(_) => self.heap.get(address),
            Address::Null => None,
        }
    }

    /// Text of a char array. `None` for anything else.
    pub fn string(&self, value: Value) -> Option<String> {
        let elements = self.resolve(value.as_array()?)?;
        elements.iter().map(Value::as_char).collect()
    }

    /// Deep rendering used by `PRINT`: char arrays print as text, other
    /// arrays as `[ a b c ]`.
    pub fn render(&self, value: Value) -> String {
        let mut out = String::new();
        self.render_into(&mut out, value, 0);
        out
    }

    fn render_into(&self, out: &mut String, value: Value, depth: usize) {
        use std::fmt::Write;

        let array = match value {
            Value::Array(array) => array,
            Value::Char(c) => {
                out.push(c);
                return;
            }
            other => {
                let _ = write!(out, "{other}");
                return;
            }
        };

        if array.length == 0 {
            out.push_str("[]");
            return;
        }
        if depth >= MAX_RENDER_DEPTH {
            out.push_str("[...]");
            return;
        }
        let Some(elements) = self.resolve(array) else {
            let _ = write!(out, "{value}");
            return;
        };

        if elements.iter().all(|e| matches!(e, Value::Char(_))) {
            out.extend(elements.iter().filter_map(Value::as_char));
            return;
        }

        out.push('[');
        for element in elements {
            out.push(' ');
            self.render_into(out, *element, depth + 1);
        }
        out.push_str(" ]");
    }
}
