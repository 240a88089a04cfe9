//! Host functions callable from scripts.
//!
//! The host registers natives by name in a [`Natives`] registry. A compiled
//! [`Program`] lists the natives it calls in its import table; binding the
//! two yields an [`Env`], indexed exactly like the import table, which is
//! what `CALL_NATIVE` dispatches through.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::memory::Memory;
use crate::program::Program;
use crate::value::Value;

/// What a native sees when it is called.
pub struct NativeContext<'a> {
    /// Arguments in declaration order.
    pub arguments: &'a [Value],
    /// Constant pool and heap, for reading array arguments.
    pub memory: Memory<'a>,
}

impl NativeContext<'_> {
    pub fn number(&self, index: usize) -> Result<f32, NativeError> {
        self.arguments
            .get(index)
            .and_then(Value::as_number)
            .ok_or_else(|| NativeError::new(format!("argument {index} is not a number")))
    }

    pub fn string(&self, index: usize) -> Result<String, NativeError> {
        self.arguments
            .get(index)
            .and_then(|value| self.memory.string(*value))
            .ok_or_else(|| NativeError::new(format!("argument {index} is not a string")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for NativeError {}

pub type NativeFn = Arc<dyn Fn(&NativeContext<'_>) -> Result<Value, NativeError> + Send + Sync>;

/// Whether the script gets a value back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    /// Pushes exactly one result.
    Function,
    /// Pushes nothing; the returned value is discarded.
    Action,
}

#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub arity: u8,
    pub kind: NativeKind,
    pub func: NativeFn,
}

impl NativeFunction {
    pub fn call(&self, ctx: &NativeContext<'_>) -> Result<Value, NativeError> {
        (self.func)(ctx)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Host-side registry, shared by every program the host loads.
#[derive(Debug, Clone, Default)]
pub struct Natives {
    functions: HashMap<String, NativeFunction>,
}

impl Natives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NativeFunction> {
        self.functions.get(name)
    }

    fn register(&mut self, name: &str, arity: u8, kind: NativeKind, func: NativeFn) {
        let native = NativeFunction {
            name: name.to_owned(),
            arity,
            kind,
            func,
        };
        if self.functions.insert(name.to_owned(), native).is_some() {
            log::warn!("native '{name}' registered twice, keeping the newer one");
        }
    }

    pub fn register_function<F>(&mut self, name: &str, arity: u8, func: F)
    where
        F: Fn(&NativeContext<'_>) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        self.register(name, arity, NativeKind::Function, Arc::new(func));
    }

    pub fn register_action<F>(&mut self, name: &str, arity: u8, func: F)
    where
        F: Fn(&NativeContext<'_>) -> Result<(), NativeError> + Send + Sync + 'static,
    {
        let func: NativeFn =
            Arc::new(move |ctx: &NativeContext<'_>| func(ctx).map(|()| Value::None));
        self.register(name, arity, NativeKind::Action, func);
    }

    /// Every registered native, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &NativeFunction> {
        self.functions.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindProblem {
    Missing,
    Arity { expected: u8, registered: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindError {
    /// Every import that could not be bound, with the reason.
    pub problems: Vec<(String, BindProblem)>,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot bind imports:")?;
        for (name, problem) in &self.problems {
            match problem {
                BindProblem::Missing => write!(f, " '{name}' is not registered;")?,
                BindProblem::Arity {
                    expected,
                    registered,
                } => write!(
                    f,
                    " '{name}' is called with {expected} arguments but takes {registered};"
                )?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for BindError {}

/// Natives resolved against one program's import table.
#[derive(Debug, Clone, Default)]
pub struct Env {
    bound: Vec<NativeFunction>,
}

impl Env {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn bind(program: &Program, natives: &Natives) -> Result<Self, BindError> {
        let mut bound = Vec::with_capacity(program.imports.len());
        let mut problems = Vec::new();

        for import in &program.imports {
            match natives.get(&import.name) {
                Some(native) if native.arity == import.arity => bound.push(native.clone()),
                Some(native) => problems.push((
                    import.name.clone(),
                    BindProblem::Arity {
                        expected: import.arity,
                        registered: native.arity,
                    },
                )),
                None => problems.push((import.name.clone(), BindProblem::Missing)),
            }
        }

        if !problems.is_empty() {
            let err = BindError { problems };
            log::error!("{err}");
            return Err(err);
        }
        log::debug!("bound {} imports", bound.len());
        Ok(Self { bound })
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&NativeFunction> {
        self.bound.get(index as usize)
    }

    /// Every import of `program` has a native behind it.
    pub fn is_ready(&self, program: &Program) -> bool {
        self.bound.len() == program.imports.len()
            && self
                .bound
                .iter()
                .zip(&program.imports)
                .all(|(native, import)| native.name == import.name)
    }
}
