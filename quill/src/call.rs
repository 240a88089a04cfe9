//! Host-to-script call setup.

use core::fmt;

use crate::bytecode::Op;
use crate::program::Program;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    NotFound(String),
    /// The export points outside the program.
    BadAddress { name: String, address: u32 },
    /// The export does not point at a `MAKE_FRAME`.
    NotAFrame { name: String, address: u32 },
    ArgumentCount {
        name: String,
        expected: usize,
        found: usize,
    },
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "no exported function '{name}'"),
            Self::BadAddress { name, address } => {
                write!(f, "'{name}' points outside the program (@{address})")
            }
            Self::NotAFrame { name, address } => {
                write!(f, "'{name}' at @{address} does not start with MAKE_FRAME")
            }
            Self::ArgumentCount {
                name,
                expected,
                found,
            } => write!(f, "'{name}' takes {expected} arguments, {found} given"),
        }
    }
}

impl std::error::Error for CallError {}

/// A checked reference to an exported function plus its arguments.
///
/// ```ignore
/// let call = Call::lookup(&program, "add")?.arg(3.0).arg(4.0);
/// let sum = vm.execute_call(&program, &env, &call)?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    name: String,
    address: u32,
    arity: u8,
    args: Vec<Value>,
}

impl Call {
    pub fn lookup(program: &Program, name: &str) -> Result<Self, CallError> {
        let export = program
            .find_export(name)
            .ok_or_else(|| CallError::NotFound(name.to_owned()))?;
        let address = export.address;

        let Some(&byte) = program.code.get(address as usize) else {
            return Err(CallError::BadAddress {
                name: name.to_owned(),
                address,
            });
        };
        if Op::try_from(byte) != Ok(Op::MakeFrame) {
            return Err(CallError::NotAFrame {
                name: name.to_owned(),
                address,
            });
        }

        Ok(Self {
            name: name.to_owned(),
            address,
            arity: export.arity,
            args: Vec::new(),
        })
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_args(mut self, args: &[Value]) -> Self {
        self.args.extend_from_slice(args);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn arity(&self) -> u8 {
        self.arity
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.args.len() != self.arity as usize {
            return Err(CallError::ArgumentCount {
                name: self.name.clone(),
                expected: self.arity as usize,
                found: self.args.len(),
            });
        }
        Ok(())
    }
}
