//! Deduplicating constant pool used while generating code.

use crate::address::Address;
use crate::value::{Array, MAX_ARRAY_LENGTH, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolFull;

#[derive(Debug, Default)]
pub struct ConstantPool {
    values: Vec<Value>,
}

/// Bitwise identity, so `0.0` and `-0.0` stay distinct constants.
fn same(a: &Value, b: &Value) -> bool {
    a.to_bits() == b.to_bits()
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&Value> {
        self.values.get(index as usize)
    }

    fn push(&mut self, value: Value) -> Result<u32, PoolFull> {
        let index = u32::try_from(self.values.len()).map_err(|_| PoolFull)?;
        Address::constant(index).ok_or(PoolFull)?;
        self.values.try_reserve(1).map_err(|_| PoolFull)?;
        self.values.push(value);
        Ok(index)
    }

    /// Index of `value`, appending it when not yet present.
    pub fn insert(&mut self, value: Value) -> Result<u32, PoolFull> {
        match self.values.iter().position(|v| same(v, &value)) {
            Some(index) => Ok(index as u32),
            None => self.push(value),
        }
    }

    /// Append `elements` as a contiguous run followed by one array
    /// descriptor pointing at it; returns the descriptor's index.
    ///
    /// An existing descriptor over identical contents is reused.
    pub fn insert_array(&mut self, elements: &[Value]) -> Result<u32, PoolFull> {
        if elements.len() > MAX_ARRAY_LENGTH as usize {
            return Err(PoolFull);
        }
        if let Some(index) = self.find_array(elements) {
            return Ok(index);
        }
        let start = self.values.len() as u32;
        for element in elements {
            self.push(*element)?;
        }
        let address = if elements.is_empty() {
            Address::Null
        } else {
            Address::constant(start).ok_or(PoolFull)?
        };
        self.push(Value::Array(Array::new(address, elements.len() as u32)))
    }

    pub fn insert_string(&mut self, text: &str) -> Result<u32, PoolFull> {
        let chars: Vec<Value> = text.chars().map(Value::Char).collect();
        self.insert_array(&chars)
    }

    fn find_array(&self, elements: &[Value]) -> Option<u32> {
        self.values.iter().enumerate().find_map(|(index, value)| {
            let array = value.as_array()?;
            if array.length as usize != elements.len() {
                return None;
            }
            let contents = match array.address {
                Address::Const(start) => {
                    let start = start as usize;
                    self.values.get(start..start + elements.len())?
                }
                Address::Null if elements.is_empty() => &[],
                _ => return None,
            };
            let equal = contents.iter().zip(elements).all(|(a, b)| same(a, b));
            equal.then_some(index as u32)
        })
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
